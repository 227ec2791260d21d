//! The only component that performs network I/O.
//!
//! Every outbound call is signed; bodies are hybrid-encrypted when the
//! credential carries an encryption key. Transport failures and 429/5xx
//! statuses are retried with exponential backoff and jitter, but only for
//! calls the caller has marked idempotent — retrying a state-mutating post
//! risks duplicate side effects on the remote system, so those are
//! single-shot by design.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::{ExponentialBuilder, Retryable};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::{Method, Url};
use serde_json::Value;

use crate::cipher::PayloadCipher;
use crate::credential::Credential;
use crate::error::{self, ConsentKitError, Result};
use crate::signer::Signer;

/// Gateway construction parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Sandbox base URL, e.g. `https://sandbox.api.example.com/consents-api`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Total attempts for idempotent calls (first try included).
    pub max_attempts: usize,
    /// Initial retry delay.
    pub min_backoff: Duration,
    /// Per-retry delay ceiling.
    pub max_backoff: Duration,
    /// Hard wall-clock ceiling across all retries of one call.
    pub retry_ceiling: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl GatewayConfig {
    /// Config with default timings for the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            retry_ceiling: Duration::from_secs(30),
            user_agent: format!("consentkit-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Whether the call may be retried on transport failure or 429/5xx.
    pub idempotent: bool,
}

impl SendOptions {
    /// Safe to retry (reads and other side-effect-free calls).
    pub const IDEMPOTENT: Self = Self { idempotent: true };
    /// Exactly one attempt (state-mutating posts).
    pub const SINGLE_SHOT: Self = Self { idempotent: false };
}

/// A mapped, successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code (always below 400 here).
    pub status: u16,
    /// Correlation id from the response headers, when present.
    pub correlation_id: Option<String>,
    /// Parsed response body; an empty object when the body was not JSON.
    pub body: Value,
}

/// Signed, optionally-encrypted HTTP client for the sandbox.
#[derive(Debug)]
pub struct HttpGateway {
    config: GatewayConfig,
    signer: Signer,
    cipher: Option<PayloadCipher>,
    client: reqwest::Client,
}

impl HttpGateway {
    /// Builds a gateway for the given credential.
    ///
    /// # Errors
    /// Returns an error if the cipher cannot be constructed from a credential
    /// that claims to carry an encryption key, or the HTTP client cannot be
    /// built.
    pub fn new(config: GatewayConfig, credential: &Credential) -> Result<Self> {
        let signer = Signer::new(credential);
        let cipher = if credential.encryption_enabled() {
            Some(PayloadCipher::new(credential)?)
        } else {
            None
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ConsentKitError::TransportError {
                url: config.base_url.clone(),
                status: None,
                reason: format!("client build failed: {err}"),
            })?;
        Ok(Self {
            config,
            signer,
            cipher,
            client,
        })
    }

    /// The cipher in use, when encryption is enabled. The reconciler uses it
    /// to decrypt encrypted event payloads.
    #[must_use]
    pub const fn cipher(&self) -> Option<&PayloadCipher> {
        self.cipher.as_ref()
    }

    /// Issues a GET with retries (GETs are idempotent by nature).
    ///
    /// # Errors
    /// See [`Self::send`].
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::GET, path, None, SendOptions::IDEMPOTENT)
            .await
    }

    /// Issues a single-shot POST.
    ///
    /// # Errors
    /// See [`Self::send`].
    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.send(Method::POST, path, Some(body), SendOptions::SINGLE_SHOT)
            .await
    }

    /// Signs, optionally encrypts, and sends one logical request.
    ///
    /// # Errors
    /// - [`ConsentKitError::TransportError`] when no usable response was
    ///   produced (connect/timeout failures, or a 429/5xx after the retry
    ///   budget — which is a single attempt for non-idempotent calls).
    /// - [`ConsentKitError::RemoteRejected`] for 4xx statuses, carrying the
    ///   body's `ReasonCode`/`Description` (redacted) and the correlation id
    ///   header.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: SendOptions,
    ) -> Result<ApiResponse> {
        let url = self.join_url(path)?;
        let body_bytes = self.prepare_body(body)?;

        let response = if options.idempotent {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(self.config.min_backoff)
                .with_max_delay(self.config.max_backoff)
                .with_total_delay(Some(self.config.retry_ceiling))
                .with_max_times(self.config.max_attempts.saturating_sub(1))
                .with_jitter();
            (|| async { self.attempt(&method, &url, body_bytes.as_deref()).await })
                .retry(backoff)
                .when(AttemptError::is_retryable)
                .await
        } else {
            self.attempt(&method, &url, body_bytes.as_deref()).await
        }
        .map_err(ConsentKitError::from)?;

        Self::map_response(response).await
    }

    fn join_url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        joined
            .parse()
            .map_err(|err| ConsentKitError::TransportError {
                url: joined,
                status: None,
                reason: format!("invalid url: {err}"),
            })
    }

    /// Serializes the body, replacing it with an encrypted envelope when the
    /// credential carries an encryption key.
    fn prepare_body(&self, body: Option<&Value>) -> Result<Option<Vec<u8>>> {
        let Some(body) = body else { return Ok(None) };
        let plaintext = serde_json::to_vec(body).map_err(|err| {
            ConsentKitError::invalid_input("body", format!("not serializable: {err}"))
        })?;
        let bytes = match &self.cipher {
            Some(cipher) => {
                let envelope = cipher.encrypt(&plaintext)?;
                serde_json::to_vec(&envelope).map_err(|err| {
                    ConsentKitError::encryption(format!("envelope serialization failed: {err}"))
                })?
            }
            None => plaintext,
        };
        Ok(Some(bytes))
    }

    /// One signed attempt. Classifies the outcome so the retry layer can tell
    /// transient failures from permanent ones.
    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&[u8]>,
    ) -> std::result::Result<reqwest::Response, AttemptError> {
        let mut nonce_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| {
                AttemptError::permanent(url.to_string(), None, format!("clock error: {err}"))
            })?
            .as_secs();

        let authorization = self
            .signer
            .sign(method.as_str(), url, body, &nonce, timestamp)
            .map_err(|err| AttemptError::permanent(url.to_string(), None, err.to_string()))?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header("Authorization", authorization)
            .header("User-Agent", &self.config.user_agent);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_vec());
        }

        let built = request
            .build()
            .map_err(|err| {
                AttemptError::permanent(url.to_string(), None, format!("build failed: {err}"))
            })?;
        tracing::debug!(
            method = %built.method(),
            url = %built.url(),
            headers = ?error::redact_headers(built.headers()),
            "outbound request"
        );

        match self.client.execute(built).await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 429 || (500..600).contains(&status) {
                    return Err(AttemptError::retryable(
                        url.to_string(),
                        Some(status),
                        format!("retryable status {status}"),
                    ));
                }
                Ok(response)
            }
            Err(err) => {
                if err.is_timeout() || err.is_connect() {
                    return Err(AttemptError::retryable(
                        url.to_string(),
                        None,
                        format!("timeout/connect error: {err}"),
                    ));
                }
                Err(AttemptError::permanent(
                    url.to_string(),
                    None,
                    format!("request failed: {err}"),
                ))
            }
        }
    }

    /// Maps a sub-500 response into the result type, classifying 4xx into the
    /// error taxonomy.
    async fn map_response(response: reqwest::Response) -> Result<ApiResponse> {
        let status = response.status().as_u16();
        let correlation_id = error::correlation_id(response.headers());
        let body: Value = response.json().await.unwrap_or_else(|_| Value::Object(serde_json::Map::new()));

        if status >= 400 {
            let reason_code = body
                .get("ReasonCode")
                .or_else(|| body.get("reasonCode"))
                .and_then(Value::as_str)
                .map(str::to_owned);
            let description = body
                .get("Description")
                .or_else(|| body.get("description"))
                .and_then(Value::as_str)
                .map_or_else(
                    || Some(error::redact_payload(&body).to_string()),
                    |text| Some(text.to_owned()),
                );
            tracing::warn!(
                status,
                ?correlation_id,
                payload = %error::redact_payload(&body),
                "remote rejected request"
            );
            return Err(ConsentKitError::RemoteRejected {
                status,
                reason_code,
                description,
                correlation_id,
            });
        }

        Ok(ApiResponse {
            status,
            correlation_id,
            body,
        })
    }
}

#[derive(Debug)]
struct AttemptError {
    url: String,
    status: Option<u16>,
    reason: String,
    retryable: bool,
}

impl AttemptError {
    const fn retryable(url: String, status: Option<u16>, reason: String) -> Self {
        Self {
            url,
            status,
            reason,
            retryable: true,
        }
    }

    const fn permanent(url: String, status: Option<u16>, reason: String) -> Self {
        Self {
            url,
            status,
            reason,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<AttemptError> for ConsentKitError {
    fn from(value: AttemptError) -> Self {
        Self::TransportError {
            url: value.url,
            status: value.status,
            reason: value.reason,
        }
    }
}
