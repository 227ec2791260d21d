//! Error taxonomy for the engine, plus the redaction rules applied before any
//! remote payload is allowed into an error or a log line.

use thiserror::Error;

/// Header names that must never appear verbatim in logs.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization"];

/// Payload field names that must be stripped before a remote body is embedded
/// into an error description or logged.
pub const SENSITIVE_FIELDS: &[&str] = &["pan", "full_pan", "card_number", "cvc", "cvv"];

/// Closed failure taxonomy. Every failure from the signer, the cipher, or the
/// gateway is classified into exactly one of these variants before it reaches
/// a caller or a log.
#[derive(Debug, Error)]
pub enum ConsentKitError {
    /// The signing key could not be loaded or the signature could not be
    /// produced.
    #[error("signing error: {reason}")]
    SigningError {
        /// What went wrong, free of key material.
        reason: String,
    },

    /// Payload encryption failed.
    #[error("encryption error: {reason}")]
    EncryptionError {
        /// What went wrong.
        reason: String,
    },

    /// Payload decryption or integrity validation failed.
    #[error("decryption error: {reason}")]
    DecryptionError {
        /// What went wrong.
        reason: String,
    },

    /// An encrypted envelope names a key fingerprint other than the one the
    /// credential in use carries. Always fatal, never retried.
    #[error("public key fingerprint mismatch: expected {expected}, found {found}")]
    FingerprintMismatch {
        /// Fingerprint of the credential in use.
        expected: String,
        /// Fingerprint found in the envelope.
        found: String,
    },

    /// The request never produced a usable response (connect failure,
    /// timeout, or retries exhausted on a retryable status).
    #[error("transport error for {url} (status {status:?}): {reason}")]
    TransportError {
        /// Request URL.
        url: String,
        /// Last observed HTTP status, when one was received.
        status: Option<u16>,
        /// Transport-level detail.
        reason: String,
    },

    /// The remote API rejected the request with a 4xx/terminal status.
    #[error("remote rejected (status {status}, reason {reason_code:?}, correlation {correlation_id:?})")]
    RemoteRejected {
        /// HTTP status code.
        status: u16,
        /// `ReasonCode` from the response body, when present.
        reason_code: Option<String>,
        /// Redacted description from the response body.
        description: Option<String>,
        /// Correlation id extracted from the response headers.
        correlation_id: Option<String>,
    },

    /// Evidence arrived for a step other than the currently persisted one, or
    /// an out-of-order/replayed callback was detected. Always fatal to the
    /// attempt.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Which expectation was violated.
        reason: String,
    },

    /// A step deadline elapsed before the externally-triggered transition
    /// arrived. Reported as a distinguishable terminal outcome.
    #[error("timed out: {context}")]
    Timeout {
        /// Which step or operation timed out.
        context: String,
    },

    /// Caller-supplied input failed validation before any remote call.
    #[error("invalid input '{field}': {reason}")]
    InvalidInput {
        /// Name of the offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No pending state exists for the presented token.
    #[error("no pending state for token {token}")]
    StateNotFound {
        /// The state token that was looked up.
        token: String,
    },
}

impl ConsentKitError {
    /// Creates a [`Self::SigningError`].
    pub fn signing<S: Into<String>>(reason: S) -> Self {
        Self::SigningError {
            reason: reason.into(),
        }
    }

    /// Creates a [`Self::EncryptionError`].
    pub fn encryption<S: Into<String>>(reason: S) -> Self {
        Self::EncryptionError {
            reason: reason.into(),
        }
    }

    /// Creates a [`Self::DecryptionError`].
    pub fn decryption<S: Into<String>>(reason: S) -> Self {
        Self::DecryptionError {
            reason: reason.into(),
        }
    }

    /// Creates a [`Self::ProtocolViolation`].
    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Creates an [`Self::InvalidInput`].
    pub fn invalid_input<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether this failure must terminate the current authentication attempt
    /// without retry.
    #[must_use]
    pub const fn is_fatal_to_attempt(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::FingerprintMismatch { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConsentKitError>;

/// Recursively strips denylisted fields from a JSON payload so it is safe to
/// log or embed in an error description.
#[must_use]
pub fn redact_payload(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if SENSITIVE_FIELDS.contains(&key.as_str()) {
                    out.insert(key.clone(), serde_json::Value::String("[redacted]".into()));
                } else {
                    out.insert(key.clone(), redact_payload(val));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_payload).collect())
        }
        other => other.clone(),
    }
}

/// Redacts denylisted headers for request logging.
#[must_use]
pub fn redact_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_str = name.as_str().to_owned();
            if SENSITIVE_HEADERS.contains(&name_str.to_ascii_lowercase().as_str()) {
                (name_str, "[redacted]".to_owned())
            } else {
                (
                    name_str,
                    value.to_str().unwrap_or("[non-ascii]").to_owned(),
                )
            }
        })
        .collect()
}

/// Extracts the correlation id the sandbox attaches to responses.
#[must_use]
pub fn correlation_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("Correlation-Id")
        .or_else(|| headers.get("X-Correlation-ID"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
