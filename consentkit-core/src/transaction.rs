//! Transaction posting and the correlation identifiers that tie a posted
//! transaction to the notification events it later produces.

use std::sync::Arc;
use std::time::SystemTime;

use rand::rngs::OsRng;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{ConsentKitError, Result};
use crate::gateway::HttpGateway;
use crate::remote::paths;

const REFERENCE_NUMBER_LENGTH: usize = 9;
const STAN_LENGTH: usize = 6;

/// The identifier pair that correlates a posted transaction with its
/// notification events: a 9-digit reference number and a 6-digit system
/// trace audit number (STAN). Matching is by exact equality of both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationPair {
    /// 9-digit acquirer reference number.
    pub reference_number: String,
    /// 6-digit system trace audit number.
    pub system_trace_audit_number: String,
}

impl CorrelationPair {
    /// Generates a fresh random pair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            reference_number: random_numeric(REFERENCE_NUMBER_LENGTH),
            system_trace_audit_number: random_numeric(STAN_LENGTH),
        }
    }

    /// Whether an event carrying these identifiers refers to this pair.
    #[must_use]
    pub fn matches(&self, reference_number: &str, stan: &str) -> bool {
        self.reference_number == reference_number && self.system_trace_audit_number == stan
    }
}

fn random_numeric(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

/// A transaction to post against an enrolled card.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    /// Card reference from the enrollment.
    pub card_reference: String,
    /// Amount in the cardholder's currency.
    pub amount: Decimal,
    /// ISO 4217 currency code, three letters.
    pub currency: String,
    /// Merchant display name.
    pub merchant_name: String,
}

impl TransactionInput {
    /// Validates the input before any remote call.
    ///
    /// # Errors
    /// [`ConsentKitError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.card_reference.trim().is_empty() {
            return Err(ConsentKitError::invalid_input(
                "card_reference",
                "must not be empty",
            ));
        }
        if self.amount <= Decimal::ZERO {
            return Err(ConsentKitError::invalid_input(
                "amount",
                "must be greater than zero",
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConsentKitError::invalid_input(
                "currency",
                "must be a 3-letter uppercase code",
            ));
        }
        if self.merchant_name.trim().is_empty() {
            return Err(ConsentKitError::invalid_input(
                "merchant_name",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Durable record of one posted transaction, created whether or not the post
/// succeeded so reconciliation and audit always have something to work from.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    /// Local record id.
    pub id: String,
    /// Card reference the transaction was posted against.
    pub card_reference: String,
    /// Amount as entered.
    pub amount: Decimal,
    /// Currency as entered.
    pub currency: String,
    /// Merchant name as entered.
    pub merchant_name: String,
    /// Identifiers used to reconcile the notification events.
    pub correlation: CorrelationPair,
    /// `POSTED` or `FAILED`.
    pub status: TransactionStatus,
    /// Correlation id header from the sandbox response, when one arrived.
    pub correlation_id: Option<String>,
    /// Error detail for failed posts.
    pub error: Option<String>,
    /// When the post was attempted.
    pub posted_at: SystemTime,
}

/// Outcome of a transaction post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// The sandbox accepted the transaction.
    Posted,
    /// The post failed; the record carries the error.
    Failed,
}

/// Posts transactions against the notifications API.
#[derive(Debug)]
pub struct TransactionService {
    gateway: Arc<HttpGateway>,
}

impl TransactionService {
    /// Builds the service over a shared gateway.
    #[must_use]
    pub const fn new(gateway: Arc<HttpGateway>) -> Self {
        Self { gateway }
    }

    /// Posts one transaction, single-shot. Posting creates money-movement
    /// state remotely, so a transport failure is recorded as `Failed` rather
    /// than retried; the caller decides whether to resubmit with a fresh
    /// correlation pair.
    ///
    /// # Errors
    /// [`ConsentKitError::InvalidInput`] before any network work. Remote
    /// rejections and transport failures do not error: they produce a
    /// `Failed` record.
    pub async fn post(&self, input: &TransactionInput) -> Result<TransactionRecord> {
        input.validate()?;
        let correlation = CorrelationPair::generate();

        let body = json!({
            "cardReference": input.card_reference,
            "cardholderAmount": input.amount,
            "cardholderCurrency": input.currency,
            "merchantName": input.merchant_name,
            "referenceNumber": correlation.reference_number,
            "systemTraceAuditNumber": correlation.system_trace_audit_number,
        });

        let mut record = TransactionRecord {
            id: Uuid::new_v4().to_string(),
            card_reference: input.card_reference.clone(),
            amount: input.amount,
            currency: input.currency.clone(),
            merchant_name: input.merchant_name.clone(),
            correlation,
            status: TransactionStatus::Posted,
            correlation_id: None,
            error: None,
            posted_at: SystemTime::now(),
        };

        match self.gateway.post(paths::TRANSACTIONS, &body).await {
            Ok(response) => {
                record.correlation_id = response.correlation_id;
                tracing::info!(
                    record_id = %record.id,
                    reference_number = %record.correlation.reference_number,
                    correlation_id = ?record.correlation_id,
                    "transaction posted"
                );
            }
            Err(err) => {
                tracing::warn!(record_id = %record.id, error = %err, "transaction post failed");
                record.status = TransactionStatus::Failed;
                if let ConsentKitError::RemoteRejected { correlation_id, .. } = &err {
                    record.correlation_id.clone_from(correlation_id);
                }
                record.error = Some(err.to_string());
            }
        }
        Ok(record)
    }
}
