//! Hybrid payload encryption.
//!
//! Each call encrypts the payload with a fresh AES-256-GCM content key and a
//! fresh 12-byte IV, then wraps the content key with the credential's RSA
//! public key using OAEP(SHA-256). The cipher operates on opaque bytes; it
//! knows nothing about HTTP or payload shape, so the same instance serves
//! every payload type.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::credential::Credential;
use crate::error::{ConsentKitError, Result};

const IV_SIZE: usize = 12; // AES-GCM standard nonce size
const CONTENT_KEY_SIZE: usize = 32;
const OAEP_ALGORITHM: &str = "SHA256";

/// Wire representation of an encrypted payload, embedded into a request body
/// or parsed out of a response body. Field names match the sandbox contract.
///
/// Invariant: `encrypted_key` and `iv` are freshly random per envelope —
/// reuse is a correctness violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Base64 AES-256-GCM ciphertext (tag appended).
    #[serde(rename = "encryptedData")]
    pub encrypted_value: String,
    /// Base64 RSA-OAEP wrapped content key.
    pub encrypted_key: String,
    /// Base64 initialization vector.
    pub iv: String,
    /// Digest algorithm used for OAEP padding.
    pub oaep_hashing_algorithm: String,
    /// Fingerprint of the public key that wrapped the content key.
    pub public_key_fingerprint: String,
}

/// Hybrid-encrypts request bodies and decrypts encrypted response fields.
#[derive(Debug)]
pub struct PayloadCipher {
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
    fingerprint: String,
}

impl PayloadCipher {
    /// Builds a cipher from a credential carrying an encryption key.
    ///
    /// # Errors
    /// Returns [`ConsentKitError::EncryptionError`] when the credential has no
    /// encryption public key or fingerprint.
    pub fn new(credential: &Credential) -> Result<Self> {
        let public_key = credential
            .encryption_public_key()
            .ok_or_else(|| ConsentKitError::encryption("credential has no encryption key"))?
            .clone();
        let fingerprint = credential
            .key_fingerprint()
            .ok_or_else(|| ConsentKitError::encryption("credential has no key fingerprint"))?
            .to_owned();
        Ok(Self {
            public_key,
            private_key: credential.decryption_key().cloned(),
            fingerprint,
        })
    }

    /// Encrypts `plaintext` into a fresh envelope.
    ///
    /// # Errors
    /// Returns [`ConsentKitError::EncryptionError`] if AES or RSA-OAEP fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let mut key_bytes = Zeroizing::new([0u8; CONTENT_KEY_SIZE]);
        OsRng.fill_bytes(key_bytes.as_mut());
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_ref())
            .map_err(|err| ConsentKitError::encryption(format!("cipher init failed: {err}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| ConsentKitError::encryption("AES-GCM encryption failed"))?;

        let wrapped_key = self
            .public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key_bytes.as_ref())
            .map_err(|err| ConsentKitError::encryption(format!("key wrap failed: {err}")))?;

        Ok(EncryptedEnvelope {
            encrypted_value: BASE64.encode(ciphertext),
            encrypted_key: BASE64.encode(wrapped_key),
            iv: BASE64.encode(iv),
            oaep_hashing_algorithm: OAEP_ALGORITHM.to_owned(),
            public_key_fingerprint: self.fingerprint.clone(),
        })
    }

    /// Decrypts an envelope back to plaintext.
    ///
    /// The envelope's fingerprint is checked against the credential before
    /// any RSA work; a mismatch fails fast with
    /// [`ConsentKitError::FingerprintMismatch`] instead of attempting
    /// decryption.
    ///
    /// # Errors
    /// [`ConsentKitError::FingerprintMismatch`] on a foreign envelope,
    /// [`ConsentKitError::DecryptionError`] on unwrap/integrity/padding
    /// failure or when no decryption key is held.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        if envelope.public_key_fingerprint != self.fingerprint {
            return Err(ConsentKitError::FingerprintMismatch {
                expected: self.fingerprint.clone(),
                found: envelope.public_key_fingerprint.clone(),
            });
        }
        let private_key = self
            .private_key
            .as_ref()
            .ok_or_else(|| ConsentKitError::decryption("no decryption key held"))?;

        let wrapped_key = decode_field(&envelope.encrypted_key, "encryptedKey")?;
        let iv = decode_field(&envelope.iv, "iv")?;
        let ciphertext = decode_field(&envelope.encrypted_value, "encryptedData")?;
        if iv.len() != IV_SIZE {
            return Err(ConsentKitError::decryption("iv has wrong length"));
        }

        let key_bytes = Zeroizing::new(
            private_key
                .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
                .map_err(|_| ConsentKitError::decryption("content key unwrap failed"))?,
        );
        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_ref())
            .map_err(|_| ConsentKitError::decryption("unwrapped key has wrong length"))?;
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| ConsentKitError::decryption("AES-GCM authentication failed"))
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| ConsentKitError::decryption(format!("{field} is not valid base64")))
}
