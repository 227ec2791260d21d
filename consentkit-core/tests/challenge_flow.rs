//! End-to-end authentication flow against a mock sandbox: enrollment demands
//! authentication, the fingerprint step leads to an interactive challenge,
//! and verification concludes the attempt.

mod common;

use std::sync::Arc;

use consentkit_core::{
    AuthChallengeMachine, AuthStep, CardDetails, ConsentRequest, EnrollmentOutcome,
    EnrollmentService, Evidence, InMemoryPendingStateStore, PendingStateStore, StepDeadlines,
};
use serde_json::json;

fn test_card() -> CardDetails {
    CardDetails {
        pan: "5123456789012345".to_owned(),
        expiry_month: 12,
        expiry_year: 2030,
        cvc: "123".to_owned(),
        cardholder_name: "Jane Doe".to_owned(),
    }
}

struct Harness {
    service: EnrollmentService,
    machine: Arc<AuthChallengeMachine>,
    store: Arc<InMemoryPendingStateStore>,
}

fn harness(base_url: String) -> Harness {
    let credential = common::signing_credential();
    let gateway = common::gateway(base_url, &credential);
    let store = Arc::new(InMemoryPendingStateStore::new());
    let machine = Arc::new(AuthChallengeMachine::new(
        Arc::clone(&gateway),
        Arc::clone(&store) as Arc<dyn PendingStateStore>,
        StepDeadlines::default(),
    ));
    Harness {
        service: EnrollmentService::new(gateway, Arc::clone(&machine)),
        machine,
        store,
    }
}

#[tokio::test]
async fn challenge_flow_runs_to_verified() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/consents")
        .with_status(200)
        .with_body(
            json!({
                "consents": [{"id": "consent-1", "status": "PENDING"}],
                "cardReference": "card-ref-1",
                "auth": {
                    "type": "THREEDS",
                    "status": "AUTH_READY_TO_START",
                    "params": {
                        "threeDsMethodUrl": "https://acs.example.test/method",
                        "threeDSMethodData": "method-data",
                        "threeDSServerTransID": "trans-1"
                    }
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let start_mock = server
        .mock("POST", "/consents/card-ref-1/start-authentication")
        .with_status(200)
        .with_body(
            json!({
                "cardReference": "card-ref-1",
                "auth": {
                    "type": "THREEDS",
                    "status": "AUTH_IN_PROGRESS",
                    "params": {
                        "acsUrl": "https://acs.example.test/challenge",
                        "encodedCReq": "creq-blob"
                    }
                }
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let verify_mock = server
        .mock("POST", "/consents/card-ref-1/verify-authentication")
        .with_status(200)
        .with_body(
            json!({
                "cardReference": "card-ref-1",
                "auth": {"type": "THREEDS", "status": "AUTHENTICATED"},
                "consents": [{"id": "consent-1", "status": "APPROVED"}]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let harness = harness(server.url());

    let outcome = harness
        .service
        .enroll(&test_card(), &ConsentRequest::named("Bookstore purchases"))
        .await
        .unwrap();
    let pending = match outcome {
        EnrollmentOutcome::AuthenticationRequired { pending, .. } => pending,
        other => panic!("expected authentication to be required, got {other:?}"),
    };
    assert_eq!(pending.step, AuthStep::Fingerprinting);
    let token = pending.state_token.clone();

    // Browser reports the fingerprint iframe completed.
    let attempt = harness
        .machine
        .advance(&token, Evidence::FingerprintCompleted)
        .await
        .unwrap();
    assert_eq!(attempt.step, AuthStep::ChallengeRequired);
    assert_eq!(attempt.transaction_id.as_deref(), Some("trans-1"));

    // The ACS parameters were committed for the challenge UI.
    let stored = harness.store.get(&token).unwrap().unwrap();
    assert_eq!(
        stored.attributes.get("acsUrl").map(String::as_str),
        Some("https://acs.example.test/challenge")
    );
    assert_eq!(
        stored.attributes.get("encodedCReq").map(String::as_str),
        Some("creq-blob")
    );

    // Challenge UI handed over, then its completion callback arrives.
    let attempt = harness
        .machine
        .advance(&token, Evidence::ChallengeCompleted)
        .await
        .unwrap();
    assert_eq!(attempt.step, AuthStep::ChallengePending);

    let attempt = harness
        .machine
        .advance(&token, Evidence::ChallengeResultReceived)
        .await
        .unwrap();
    assert_eq!(attempt.step, AuthStep::Verified);
    assert!(attempt.last_error.is_none());

    // Terminal: the pending record is gone and re-entry replays the result
    // without further remote calls.
    assert!(harness.store.get(&token).unwrap().is_none());
    let replay = harness
        .machine
        .advance(&token, Evidence::ChallengeResultReceived)
        .await
        .unwrap();
    assert_eq!(replay.step, AuthStep::Verified);

    start_mock.assert_async().await;
    verify_mock.assert_async().await;
}

#[tokio::test]
async fn failed_verification_ends_in_failed_step() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/consents")
        .with_status(200)
        .with_body(
            json!({
                "consents": [{"id": "consent-1", "status": "PENDING"}],
                "cardReference": "card-ref-2",
                "auth": {
                    "type": "THREEDS",
                    "status": "AUTH_READY_TO_START",
                    "params": {"threeDSServerTransID": "trans-2"}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("POST", "/consents/card-ref-2/start-authentication")
        .with_status(200)
        .with_body(
            json!({
                "auth": {
                    "type": "THREEDS",
                    "status": "AUTH_IN_PROGRESS",
                    "params": {"acsUrl": "https://acs.example.test", "encodedCReq": "blob"}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("POST", "/consents/card-ref-2/verify-authentication")
        .with_status(200)
        .with_body(json!({"auth": {"type": "THREEDS", "status": "AUTH_FAILED"}}).to_string())
        .create_async()
        .await;

    let harness = harness(server.url());
    let outcome = harness
        .service
        .enroll(&test_card(), &ConsentRequest::named("Bookstore purchases"))
        .await
        .unwrap();
    let pending = match outcome {
        EnrollmentOutcome::AuthenticationRequired { pending, .. } => pending,
        other => panic!("expected authentication to be required, got {other:?}"),
    };
    let token = pending.state_token;

    harness
        .machine
        .advance(&token, Evidence::FingerprintCompleted)
        .await
        .unwrap();
    harness
        .machine
        .advance(&token, Evidence::ChallengeCompleted)
        .await
        .unwrap();
    let attempt = harness
        .machine
        .advance(&token, Evidence::ChallengeResultReceived)
        .await
        .unwrap();
    assert_eq!(attempt.step, AuthStep::Failed);
    assert!(attempt.last_error.unwrap().contains("AUTH_FAILED"));
}
