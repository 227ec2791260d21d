//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use consentkit_core::{Credential, GatewayConfig, HttpGateway};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::SecretString;

fn key_pair() -> &'static (RsaPrivateKey, RsaPublicKey) {
    static PAIR: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
    PAIR.get_or_init(|| {
        // Seeded so every test run uses the same pair.
        let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let public = RsaPublicKey::from(&private);
        (private, public)
    })
}

fn private_key_pem() -> SecretString {
    let (private, _) = key_pair();
    SecretString::from(private.to_pkcs8_pem(LineEnding::LF).expect("pem").to_string())
}

fn public_key_pem() -> String {
    let (_, public) = key_pair();
    public.to_public_key_pem(LineEnding::LF).expect("pem")
}

/// Credential that signs but does not encrypt, so mock servers can match on
/// plaintext bodies.
pub fn signing_credential() -> Credential {
    Credential::new("test-consumer-key", &private_key_pem(), None, None, None).unwrap()
}

/// Credential with encryption enabled and the matching decryption key held.
pub fn encrypting_credential() -> Credential {
    Credential::new(
        "test-consumer-key",
        &private_key_pem(),
        Some(&public_key_pem()),
        Some(&private_key_pem()),
        None,
    )
    .unwrap()
}

/// Gateway with test-friendly retry timings pointed at a mock server.
pub fn gateway(base_url: String, credential: &Credential) -> Arc<HttpGateway> {
    let mut config = GatewayConfig::new(base_url);
    config.min_backoff = Duration::from_millis(5);
    config.max_backoff = Duration::from_millis(20);
    Arc::new(HttpGateway::new(config, credential).unwrap())
}
