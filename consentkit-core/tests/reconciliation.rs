//! Post-then-reconcile scenarios against a mock sandbox.

mod common;

use std::sync::Arc;
use std::time::Duration;

use consentkit_core::{
    InMemorySeenIdStore, NotificationReconciler, ReconcilerConfig, SeenIdStore, TransactionInput,
    TransactionService, TransactionStatus,
};
use rust_decimal::Decimal;
use serde_json::json;

fn fast_reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        min_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        retention: Duration::from_secs(3600),
    }
}

fn purchase() -> TransactionInput {
    TransactionInput {
        card_reference: "card-ref-1".to_owned(),
        amount: Decimal::new(2500, 2),
        currency: "EUR".to_owned(),
        merchant_name: "Bookstore".to_owned(),
    }
}

#[tokio::test]
async fn posted_transaction_is_reconciled_from_notification() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/notifications/transactions")
        .with_status(200)
        .with_header("Correlation-Id", "corr-1")
        .with_body("{}")
        .create_async()
        .await;

    let credential = common::signing_credential();
    let gateway = common::gateway(server.url(), &credential);
    let record = TransactionService::new(Arc::clone(&gateway))
        .post(&purchase())
        .await
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Posted);

    // The sandbox later produces an event carrying the same identifiers.
    server
        .mock("GET", "/notifications/undelivered-notifications")
        .with_status(200)
        .with_body(
            json!({"notifications": [{
                "id": "evt-1",
                "cardReference": "card-ref-1",
                "merchantName": "Bookstore",
                "cardholderAmount": "25.00",
                "cardholderCurrency": "EUR",
                "referenceNumber": record.correlation.reference_number,
                "systemTraceAuditNumber": record.correlation.system_trace_audit_number
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let reconciler = NotificationReconciler::new(
        gateway,
        Arc::new(InMemorySeenIdStore::new()) as Arc<dyn SeenIdStore>,
        fast_reconciler_config(),
    );
    let result = reconciler
        .poll(&[record.correlation.clone()], Duration::from_millis(500))
        .await
        .unwrap();

    assert!(result.unmatched.is_empty());
    assert_eq!(result.matched.len(), 1);
    let (pair, event) = &result.matched[0];
    assert_eq!(pair, &record.correlation);
    assert_eq!(event.merchant.as_deref(), Some("Bookstore"));
    assert_eq!(event.amount, Some(Decimal::new(2500, 2)));
}

#[tokio::test]
async fn event_arriving_on_a_later_poll_is_still_matched() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/notifications/transactions")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let credential = common::signing_credential();
    let gateway = common::gateway(server.url(), &credential);
    let record = TransactionService::new(Arc::clone(&gateway))
        .post(&purchase())
        .await
        .unwrap();

    // First poll finds nothing; the event shows up afterwards.
    let empty = server
        .mock("GET", "/notifications/undelivered-notifications")
        .with_status(200)
        .with_body(json!({"notifications": []}).to_string())
        .expect(1)
        .create_async()
        .await;

    let reconciler = NotificationReconciler::new(
        Arc::clone(&gateway),
        Arc::new(InMemorySeenIdStore::new()) as Arc<dyn SeenIdStore>,
        fast_reconciler_config(),
    );

    let pair = record.correlation.clone();
    let poll = tokio::spawn(async move {
        reconciler.poll(&[pair], Duration::from_secs(2)).await
    });

    // Let the first (empty) poll land, then publish the event.
    tokio::time::sleep(Duration::from_millis(30)).await;
    empty.remove_async().await;
    server
        .mock("GET", "/notifications/undelivered-notifications")
        .with_status(200)
        .with_body(
            json!({"notifications": [{
                "id": "evt-late",
                "referenceNumber": record.correlation.reference_number,
                "systemTraceAuditNumber": record.correlation.system_trace_audit_number
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let result = poll.await.unwrap().unwrap();
    assert_eq!(result.matched.len(), 1);
    assert!(result.unmatched.is_empty());
    assert!(result.polls >= 2);
}

#[tokio::test]
async fn one_of_two_transactions_matching_leaves_the_other_unmatched() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/notifications/transactions")
        .with_status(200)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;

    let credential = common::signing_credential();
    let gateway = common::gateway(server.url(), &credential);
    let service = TransactionService::new(Arc::clone(&gateway));
    let first = service.post(&purchase()).await.unwrap();
    let second = service.post(&purchase()).await.unwrap();

    // Only the first transaction's event ever shows up.
    server
        .mock("GET", "/notifications/undelivered-notifications")
        .with_status(200)
        .with_body(
            json!({"notifications": [{
                "id": "evt-first",
                "referenceNumber": first.correlation.reference_number,
                "systemTraceAuditNumber": first.correlation.system_trace_audit_number
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let reconciler = NotificationReconciler::new(
        gateway,
        Arc::new(InMemorySeenIdStore::new()) as Arc<dyn SeenIdStore>,
        fast_reconciler_config(),
    );
    let result = reconciler
        .poll(
            &[first.correlation.clone(), second.correlation.clone()],
            Duration::from_millis(60),
        )
        .await
        .unwrap();

    assert_eq!(result.matched.len(), 1);
    assert_eq!(result.matched[0].0, first.correlation);
    assert_eq!(result.unmatched, vec![second.correlation]);
}

#[tokio::test]
async fn unmatched_transaction_is_reported_after_deadline() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/notifications/undelivered-notifications")
        .with_status(200)
        .with_body(
            json!({"notifications": [{
                "id": "evt-other",
                "referenceNumber": "000000000",
                "systemTraceAuditNumber": "000000"
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let credential = common::signing_credential();
    let gateway = common::gateway(server.url(), &credential);
    let reconciler = NotificationReconciler::new(
        gateway,
        Arc::new(InMemorySeenIdStore::new()) as Arc<dyn SeenIdStore>,
        fast_reconciler_config(),
    );

    let pair = consentkit_core::CorrelationPair {
        reference_number: "123456789".to_owned(),
        system_trace_audit_number: "654321".to_owned(),
    };
    let result = reconciler
        .poll(&[pair.clone()], Duration::from_millis(50))
        .await
        .unwrap();

    // Unrelated events are observed but nothing matches; this is a normal
    // outcome, not an error.
    assert_eq!(result.matched.len(), 0);
    assert_eq!(result.unmatched, vec![pair]);
    assert_eq!(result.observed.len(), 1);
}
