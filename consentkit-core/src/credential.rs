//! Immutable API credential injected once at process start.
//!
//! The credential is supplied by an external secret-store collaborator; this
//! crate never reads key files or environment variables itself.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::{ConsentKitError, Result};

/// Credential for one-legged signing and payload encryption.
///
/// Constructed once and shared (`Arc`) across the gateway, the challenge
/// machine, and the reconciler. Key material is held behind [`SecretString`]
/// and is redacted from `Debug` output.
pub struct Credential {
    consumer_key: String,
    signing_key: RsaPrivateKey,
    encryption_public_key: Option<RsaPublicKey>,
    decryption_key: Option<RsaPrivateKey>,
    key_fingerprint: Option<String>,
}

impl Credential {
    /// Builds a credential from PEM-encoded key material.
    ///
    /// The signing key PEM is parsed eagerly so that a malformed credential
    /// fails at startup rather than on the first outbound call. When an
    /// encryption public key is supplied its fingerprint is computed as the
    /// hex SHA-256 of the SubjectPublicKeyInfo DER unless the secret store
    /// provides one explicitly.
    ///
    /// # Errors
    /// Returns [`ConsentKitError::InvalidInput`] for empty parameters and
    /// [`ConsentKitError::SigningError`] /
    /// [`ConsentKitError::EncryptionError`] for unparseable keys.
    pub fn new(
        consumer_key: &str,
        signing_key_pem: &SecretString,
        encryption_public_key_pem: Option<&str>,
        decryption_key_pem: Option<&SecretString>,
        key_fingerprint: Option<String>,
    ) -> Result<Self> {
        if consumer_key.is_empty() {
            return Err(ConsentKitError::invalid_input(
                "consumer_key",
                "must not be empty",
            ));
        }
        let signing_key = RsaPrivateKey::from_pkcs8_pem(signing_key_pem.expose_secret())
            .map_err(|err| ConsentKitError::signing(format!("unparseable signing key: {err}")))?;

        let encryption_public_key = encryption_public_key_pem
            .map(|pem| {
                RsaPublicKey::from_public_key_pem(pem).map_err(|err| {
                    ConsentKitError::encryption(format!("unparseable encryption key: {err}"))
                })
            })
            .transpose()?;

        let decryption_key = decryption_key_pem
            .map(|pem| {
                RsaPrivateKey::from_pkcs8_pem(pem.expose_secret()).map_err(|err| {
                    ConsentKitError::decryption(format!("unparseable decryption key: {err}"))
                })
            })
            .transpose()?;

        let key_fingerprint = match (key_fingerprint, &encryption_public_key) {
            (Some(fp), _) => Some(fp),
            (None, Some(public_key)) => Some(fingerprint_of(public_key)?),
            (None, None) => None,
        };

        Ok(Self {
            consumer_key: consumer_key.to_owned(),
            signing_key,
            encryption_public_key,
            decryption_key,
            key_fingerprint,
        })
    }

    /// The OAuth consumer key identifying the calling application.
    #[must_use]
    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    /// The parsed RSA signing key.
    #[must_use]
    pub const fn signing_key(&self) -> &RsaPrivateKey {
        &self.signing_key
    }

    /// The public key used to wrap content keys, when encryption is enabled.
    #[must_use]
    pub const fn encryption_public_key(&self) -> Option<&RsaPublicKey> {
        self.encryption_public_key.as_ref()
    }

    /// The private key used to unwrap encrypted response fields, if held.
    #[must_use]
    pub const fn decryption_key(&self) -> Option<&RsaPrivateKey> {
        self.decryption_key.as_ref()
    }

    /// Fingerprint of the encryption public key, embedded in every envelope
    /// and validated on decrypt.
    #[must_use]
    pub fn key_fingerprint(&self) -> Option<&str> {
        self.key_fingerprint.as_deref()
    }

    /// Whether outbound payloads must be encrypted.
    #[must_use]
    pub const fn encryption_enabled(&self) -> bool {
        self.encryption_public_key.is_some()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("consumer_key", &self.consumer_key)
            .field("signing_key", &"[REDACTED]")
            .field("encryption_public_key", &self.encryption_public_key.is_some())
            .field("decryption_key", &self.decryption_key.is_some())
            .field("key_fingerprint", &self.key_fingerprint)
            .finish()
    }
}

/// Hex SHA-256 of a public key's SubjectPublicKeyInfo DER encoding.
pub(crate) fn fingerprint_of(public_key: &RsaPublicKey) -> Result<String> {
    let der = public_key
        .to_public_key_der()
        .map_err(|err| ConsentKitError::encryption(format!("key encoding failed: {err}")))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_computes_fingerprint() {
        let credential = Credential::new(
            "consumer-key",
            &test_keys::private_key_pem(),
            Some(&test_keys::public_key_pem()),
            Some(&test_keys::private_key_pem()),
            None,
        )
        .unwrap();
        assert!(credential.encryption_enabled());
        let fingerprint = credential.key_fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn explicit_fingerprint_wins() {
        let credential = Credential::new(
            "consumer-key",
            &test_keys::private_key_pem(),
            Some(&test_keys::public_key_pem()),
            None,
            Some("provided-fp".into()),
        )
        .unwrap();
        assert_eq!(credential.key_fingerprint(), Some("provided-fp"));
    }

    #[test]
    fn rejects_empty_consumer_key() {
        let err =
            Credential::new("", &test_keys::private_key_pem(), None, None, None).unwrap_err();
        assert!(matches!(err, ConsentKitError::InvalidInput { .. }));
    }

    #[test]
    fn rejects_garbage_signing_key() {
        let err = Credential::new(
            "consumer-key",
            &SecretString::from("not a pem".to_owned()),
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConsentKitError::SigningError { .. }));
    }

    #[test]
    fn debug_redacts_key_material() {
        let credential =
            Credential::new("ck", &test_keys::private_key_pem(), None, None, None).unwrap();
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
