//! One-legged request signing (OAuth 1.0a with RSA-SHA256).
//!
//! The signer is pure: nonce and timestamp are supplied by the caller, so
//! identical inputs always produce an identical `Authorization` header. The
//! gateway supplies fresh values per outbound call.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use rsa::pkcs1v15::SigningKey;
use rsa::sha2::Sha256 as RsaSha256;
use rsa::signature::{SignatureEncoding, Signer as _};
use sha2::{Digest, Sha256};

use crate::credential::Credential;
use crate::error::{ConsentKitError, Result};

/// RFC 3986 unreserved characters stay literal; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const SIGNATURE_METHOD: &str = "RSA-SHA256";
const OAUTH_VERSION: &str = "1.0";

/// Produces the `Authorization` header for outbound requests.
pub struct Signer {
    consumer_key: String,
    signing_key: SigningKey<RsaSha256>,
}

impl Signer {
    /// Builds a signer from an already-validated credential.
    #[must_use]
    pub fn new(credential: &Credential) -> Self {
        Self {
            consumer_key: credential.consumer_key().to_owned(),
            signing_key: SigningKey::new(credential.signing_key().clone()),
        }
    }

    /// Signs one request and returns the `Authorization` header value.
    ///
    /// The signature covers the canonical base string: uppercase method,
    /// normalized base URL, and the sorted percent-encoded parameter string
    /// (query parameters plus the `oauth_*` protocol parameters, including
    /// `oauth_body_hash` when a body is present).
    ///
    /// # Errors
    /// Returns [`ConsentKitError::SigningError`] if the URL cannot be
    /// normalized.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
        nonce: &str,
        timestamp: u64,
    ) -> Result<String> {
        let timestamp = timestamp.to_string();
        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_owned()),
            ("oauth_signature_method".into(), SIGNATURE_METHOD.into()),
            ("oauth_timestamp".into(), timestamp),
            ("oauth_version".into(), OAUTH_VERSION.into()),
        ];
        if let Some(body) = body {
            let digest = Sha256::digest(body);
            oauth_params.push(("oauth_body_hash".into(), BASE64.encode(digest)));
        }

        let base_string = signature_base_string(method, url, &oauth_params)?;
        let signature = self.signing_key.sign(base_string.as_bytes());
        let signature = BASE64.encode(signature.to_bytes());

        let mut header_params = oauth_params;
        header_params.push(("oauth_signature".into(), signature));
        header_params.sort();

        let rendered: Vec<String> = header_params
            .iter()
            .map(|(key, value)| format!("{key}=\"{}\"", encode(value)))
            .collect();
        Ok(format!("OAuth {}", rendered.join(",")))
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("consumer_key", &self.consumer_key)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

/// Scheme, host, optional non-default port, and path. Query and fragment are
/// carried in the parameter string instead.
fn base_url(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| ConsentKitError::signing("url has no host"))?;
    let mut base = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        base.push_str(&format!(":{port}"));
    }
    base.push_str(url.path());
    Ok(base)
}

fn signature_base_string(
    method: &str,
    url: &Url,
    oauth_params: &[(String, String)],
) -> Result<String> {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (encode(&key), encode(&value)))
        .collect();
    pairs.extend(
        oauth_params
            .iter()
            .map(|(key, value)| (encode(key), encode(value))),
    );
    pairs.sort();

    let param_string = pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    Ok(format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(&base_url(url)?),
        encode(&param_string)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::test_keys;

    fn test_signer() -> Signer {
        let credential =
            Credential::new("test-consumer-key", &test_keys::private_key_pem(), None, None, None)
                .unwrap();
        Signer::new(&credential)
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let signer = test_signer();
        let url: Url = "https://sandbox.example.test/consents?after=5".parse().unwrap();
        let body = br#"{"a":1}"#;
        let first = signer.sign("POST", &url, Some(body), "nonce-1", 1_700_000_000).unwrap();
        let second = signer.sign("POST", &url, Some(body), "nonce-1", 1_700_000_000).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn nonce_changes_signature() {
        let signer = test_signer();
        let url: Url = "https://sandbox.example.test/consents".parse().unwrap();
        let first = signer.sign("GET", &url, None, "nonce-1", 1_700_000_000).unwrap();
        let second = signer.sign("GET", &url, None, "nonce-2", 1_700_000_000).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn header_carries_protocol_params() {
        let signer = test_signer();
        let url: Url = "https://sandbox.example.test/consents".parse().unwrap();
        let header = signer
            .sign("POST", &url, Some(b"{}"), "abc", 1_700_000_000)
            .unwrap();
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_consumer_key=\"test-consumer-key\""));
        assert!(header.contains("oauth_signature_method=\"RSA-SHA256\""));
        assert!(header.contains("oauth_body_hash="));
        assert!(header.contains("oauth_signature="));
    }

    #[test]
    fn body_hash_omitted_without_body() {
        let signer = test_signer();
        let url: Url = "https://sandbox.example.test/notifications".parse().unwrap();
        let header = signer.sign("GET", &url, None, "abc", 1_700_000_000).unwrap();
        assert!(!header.contains("oauth_body_hash"));
    }

    #[test]
    fn base_string_normalizes_url_and_sorts_params() {
        let url: Url = "https://sandbox.example.test:8443/a/b?z=2&a=1".parse().unwrap();
        let base = signature_base_string(
            "post",
            &url,
            &[("oauth_nonce".into(), "n".into())],
        )
        .unwrap();
        assert!(base.starts_with("POST&"));
        assert!(base.contains("sandbox.example.test%3A8443%2Fa%2Fb"));
        // Sorted: a=1 before oauth_nonce before z=2.
        let params = base.rsplit('&').next().unwrap();
        let a = params.find("a%3D1").unwrap();
        let nonce = params.find("oauth_nonce").unwrap();
        let z = params.find("z%3D2").unwrap();
        assert!(a < nonce && nonce < z);
    }

    #[test]
    fn default_port_is_dropped() {
        let url: Url = "https://sandbox.example.test/consents".parse().unwrap();
        assert_eq!(
            base_url(&url).unwrap(),
            "https://sandbox.example.test/consents"
        );
    }
}
