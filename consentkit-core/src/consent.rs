//! Card enrollment against the consent API.
//!
//! Input validation happens entirely client-side, before any signing or
//! encryption work; a card that fails validation never leaves the process.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{json, Value};

use crate::challenge::AuthChallengeMachine;
use crate::error::{ConsentKitError, Result};
use crate::gateway::HttpGateway;
use crate::pending::PendingState;
use crate::remote::{self, paths, AUTH_STATUS_READY};

const PAN_LENGTH: usize = 16;
const CVC_LENGTH: usize = 3;
// The sandbox rejects expiry years before its launch year.
const MIN_EXPIRY_YEAR: u16 = 2021;

/// Cardholder-entered card details.
///
/// `Debug` shows only the last four PAN digits; the full PAN and the CVC
/// never appear in logs or error messages.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    /// Primary account number, exactly 16 digits.
    pub pan: String,
    /// Expiry month, 1 through 12.
    pub expiry_month: u8,
    /// Four-digit expiry year.
    pub expiry_year: u16,
    /// Card verification code, exactly 3 digits.
    pub cvc: String,
    /// Name as embossed on the card.
    pub cardholder_name: String,
}

impl CardDetails {
    /// Validates every field, returning the first violation.
    ///
    /// # Errors
    /// [`ConsentKitError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.pan.len() != PAN_LENGTH || !self.pan.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConsentKitError::invalid_input(
                "pan",
                format!("must be exactly {PAN_LENGTH} digits"),
            ));
        }
        if self.cvc.len() != CVC_LENGTH || !self.cvc.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConsentKitError::invalid_input(
                "cvc",
                format!("must be exactly {CVC_LENGTH} digits"),
            ));
        }
        if !(1..=12).contains(&self.expiry_month) {
            return Err(ConsentKitError::invalid_input(
                "expiry_month",
                "must be between 1 and 12",
            ));
        }
        if self.expiry_year < MIN_EXPIRY_YEAR {
            return Err(ConsentKitError::invalid_input(
                "expiry_year",
                format!("must be a four-digit year of {MIN_EXPIRY_YEAR} or later"),
            ));
        }
        if self.cardholder_name.trim().is_empty() {
            return Err(ConsentKitError::invalid_input(
                "cardholder_name",
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Last four PAN digits, the only part of the number that may be shown.
    #[must_use]
    pub fn pan_last4(&self) -> &str {
        &self.pan[self.pan.len().saturating_sub(4)..]
    }

    /// Display alias, e.g. `Jane Doe - 4321`.
    #[must_use]
    pub fn alias(&self) -> String {
        format!("{} - {}", self.cardholder_name, self.pan_last4())
    }
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDetails")
            .field("pan", &format!("****{}", self.pan_last4()))
            .field("expiry_month", &self.expiry_month)
            .field("expiry_year", &self.expiry_year)
            .field("cvc", &"***")
            .field("cardholder_name", &self.cardholder_name)
            .finish()
    }
}

/// What the enrollment asks consent for.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    /// Consent name presented to the cardholder.
    pub name: String,
    /// Free-form key/value consent details.
    pub details: Vec<(String, String)>,
    /// References to legal documents covered by the consent.
    pub legal_docs: Vec<String>,
    /// Channel the consent was captured on, e.g. `BROWSER`.
    pub device_channel: Option<String>,
    /// How long the consent stays valid, in days.
    pub duration_days: Option<u32>,
}

impl ConsentRequest {
    /// A minimal request with just a consent name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: Vec::new(),
            legal_docs: Vec::new(),
            device_channel: None,
            duration_days: None,
        }
    }
}

/// How an enrollment concluded.
#[derive(Debug)]
pub enum EnrollmentOutcome {
    /// The consent was created and no authentication is required.
    Enrolled(EnrollmentRecord),
    /// The consent was created but the card must be authenticated; the
    /// challenge flow has been opened and awaits fingerprint evidence.
    AuthenticationRequired {
        /// Record of the enrollment so far.
        record: EnrollmentRecord,
        /// Persisted state handed to the browser driver.
        pending: PendingState,
    },
}

/// Durable record of one enrollment. Holds no full PAN.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentRecord {
    /// Consent identifier assigned by the sandbox.
    pub consent_id: String,
    /// Stable card reference for follow-up calls.
    pub card_reference: Option<String>,
    /// Display alias.
    pub card_alias: String,
    /// Last four PAN digits.
    pub pan_last4: String,
    /// Consent status as reported by the sandbox.
    pub status: Option<String>,
    /// Authentication status, when the response carried one.
    pub auth_status: Option<String>,
    /// When the enrollment happened.
    pub created_at: SystemTime,
}

/// Enrolls cards and opens challenge flows when the sandbox demands one.
#[derive(Debug)]
pub struct EnrollmentService {
    gateway: Arc<HttpGateway>,
    machine: Arc<AuthChallengeMachine>,
}

impl EnrollmentService {
    /// Builds the service over a shared gateway and challenge machine.
    #[must_use]
    pub fn new(gateway: Arc<HttpGateway>, machine: Arc<AuthChallengeMachine>) -> Self {
        Self { gateway, machine }
    }

    /// Enrolls a card, posting the consent payload single-shot (enrollment
    /// creates remote state and must not be silently retried).
    ///
    /// # Errors
    /// [`ConsentKitError::InvalidInput`] before any network work,
    /// [`ConsentKitError::RemoteRejected`] / transport errors from the
    /// gateway, [`ConsentKitError::ProtocolViolation`] when the response is
    /// missing the consent id or announces an unusable auth section.
    pub async fn enroll(
        &self,
        card: &CardDetails,
        request: &ConsentRequest,
    ) -> Result<EnrollmentOutcome> {
        card.validate()?;

        let body = build_payload(card, request);
        let response = self.gateway.post(paths::CONSENTS, &body).await?;
        let parsed: remote::ConsentCreateResponse = serde_json::from_value(response.body)
            .map_err(|err| ConsentKitError::protocol(format!("malformed consent response: {err}")))?;

        let consent = parsed.consents.first().cloned().ok_or_else(|| {
            ConsentKitError::protocol("consent response carried no consent entry")
        })?;
        let consent_id = consent
            .id
            .ok_or_else(|| ConsentKitError::protocol("consent response missing consent id"))?;

        let record = EnrollmentRecord {
            consent_id,
            card_reference: parsed.card_reference.clone(),
            card_alias: card.alias(),
            pan_last4: card.pan_last4().to_owned(),
            status: consent.status,
            auth_status: parsed.auth.as_ref().and_then(|auth| auth.status.clone()),
            created_at: SystemTime::now(),
        };
        tracing::info!(
            consent_id = %record.consent_id,
            card_reference = ?record.card_reference,
            auth_status = ?record.auth_status,
            "card enrolled"
        );

        match parsed.auth {
            Some(auth) if auth.status.as_deref() == Some(AUTH_STATUS_READY) => {
                let card_reference = record.card_reference.clone().ok_or_else(|| {
                    ConsentKitError::protocol(
                        "authentication required but response missing card reference",
                    )
                })?;
                let pending = self.machine.begin(&card_reference, &auth)?;
                Ok(EnrollmentOutcome::AuthenticationRequired { record, pending })
            }
            _ => Ok(EnrollmentOutcome::Enrolled(record)),
        }
    }
}

fn build_payload(card: &CardDetails, request: &ConsentRequest) -> Value {
    let details: serde_json::Map<String, Value> = request
        .details
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();
    let mut payload = serde_json::Map::new();
    payload.insert(
        "consents".to_owned(),
        json!([{"name": request.name, "details": details}]),
    );
    payload.insert("cardDetails".to_owned(), json!(card));
    if !request.legal_docs.is_empty() {
        payload.insert("legalDocs".to_owned(), json!(request.legal_docs));
    }
    if let Some(channel) = &request.device_channel {
        payload.insert("deviceChannel".to_owned(), json!(channel));
    }
    if let Some(days) = request.duration_days {
        payload.insert("consentDurationDays".to_owned(), json!(days));
    }
    Value::Object(payload)
}
