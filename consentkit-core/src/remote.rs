//! Wire-level adapter for the sandbox API.
//!
//! Exact field names and endpoint paths live here so call sites stay
//! insulated from the sandbox contract; the rest of the crate works with the
//! parsed types. Status vocabulary follows the sandbox documentation.

use serde::Deserialize;
use serde_json::Value;

/// Authentication type signalling a 3-D Secure style challenge flow.
pub const AUTH_TYPE_THREEDS: &str = "THREEDS";
/// Authentication is required and the fingerprint step may begin.
pub const AUTH_STATUS_READY: &str = "AUTH_READY_TO_START";
/// The authenticator requires an interactive challenge.
pub const AUTH_STATUS_IN_PROGRESS: &str = "AUTH_IN_PROGRESS";
/// Authentication completed successfully.
pub const AUTH_STATUS_AUTHENTICATED: &str = "AUTHENTICATED";

/// Endpoint paths relative to the configured base URL.
pub mod paths {
    /// Consent enrollment.
    pub const CONSENTS: &str = "/consents";
    /// Transaction posting.
    pub const TRANSACTIONS: &str = "/notifications/transactions";
    /// Undelivered events poll.
    pub const UNDELIVERED: &str = "/notifications/undelivered-notifications";

    /// Start-authentication for a given card reference.
    #[must_use]
    pub fn start_authentication(card_reference: &str) -> String {
        format!("/consents/{card_reference}/start-authentication")
    }

    /// Verify-authentication for a given card reference.
    #[must_use]
    pub fn verify_authentication(card_reference: &str) -> String {
        format!("/consents/{card_reference}/verify-authentication")
    }
}

/// The `auth` section returned by enrollment and authentication responses.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthSection {
    /// Authentication scheme, e.g. `THREEDS`.
    #[serde(rename = "type")]
    pub auth_type: Option<String>,
    /// Current authentication status.
    pub status: Option<String>,
    /// Scheme-specific parameters (ACS URL, method data, transaction ids).
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// One consent entry in an enrollment response.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsentEntry {
    /// Consent identifier assigned by the sandbox.
    pub id: Option<String>,
    /// Consent status, e.g. `APPROVED` or `PENDING`.
    pub status: Option<String>,
}

/// Response to `POST /consents`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConsentCreateResponse {
    /// Consents created by this enrollment.
    #[serde(default)]
    pub consents: Vec<ConsentEntry>,
    /// Stable reference for the enrolled card.
    pub card_reference: Option<String>,
    /// Authentication requirements, when the card must be authenticated.
    pub auth: Option<AuthSection>,
}

/// Response to start-authentication and verify-authentication.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatusResponse {
    /// Card reference the response applies to.
    pub card_reference: Option<String>,
    /// Updated authentication state.
    pub auth: Option<AuthSection>,
    /// Consents updated as a side effect of verification.
    #[serde(default)]
    pub consents: Vec<ConsentEntry>,
}

/// Pulls the list of event objects out of an undelivered-notifications
/// response. The sandbox has shipped both a bare array and an object wrapper;
/// both shapes are accepted.
#[must_use]
pub fn extract_notifications(body: &Value) -> Vec<Value> {
    if let Value::Array(items) = body {
        return items.clone();
    }
    if let Value::Object(map) = body {
        for key in ["notifications", "notification", "data", "items"] {
            match map.get(key) {
                Some(Value::Array(items)) => return items.clone(),
                Some(Value::Object(_)) => {
                    return vec![map.get(key).cloned().unwrap_or(Value::Null)]
                }
                Some(other) if !other.is_null() => return vec![other.clone()],
                _ => {}
            }
        }
    }
    Vec::new()
}

/// Reads a string field accepting both camelCase and snake_case spellings.
#[must_use]
pub fn string_field(event: &Value, camel: &str, snake: &str) -> Option<String> {
    let value = event.get(camel).or_else(|| event.get(snake))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
