//! Undelivered-notification polling and transaction reconciliation.
//!
//! The sandbox delivers transaction events out of band; the reconciler polls
//! the undelivered queue, deduplicates what it has already seen, and matches
//! events back to posted transactions by their correlation pair. A pair that
//! never matches before the deadline is a normal outcome — the event may
//! simply not have been produced yet — and is reported, not errored.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::cipher::EncryptedEnvelope;
use crate::error::{self, ConsentKitError, Result};
use crate::gateway::HttpGateway;
use crate::remote::{self, paths};
use crate::transaction::CorrelationPair;

/// One notification event, normalized from the wire shape. The raw payload is
/// kept (redacted) for audit; the promoted fields drive matching.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    /// Event id from the sandbox, or a locally generated one.
    pub id: String,
    /// Card reference the event concerns, when present.
    pub card_reference: Option<String>,
    /// Merchant name, when present.
    pub merchant: Option<String>,
    /// Cardholder amount, when present and parseable.
    pub amount: Option<Decimal>,
    /// Cardholder currency, when present.
    pub currency: Option<String>,
    /// 9-digit reference number, when present.
    pub reference_number: Option<String>,
    /// 6-digit system trace audit number, when present.
    pub system_trace_audit_number: Option<String>,
    /// Event message type, when present.
    pub message_type: Option<String>,
    /// Whether the event arrived with an encrypted payload.
    pub was_encrypted: bool,
    /// Delivery status; flips to `Matched` when the record is tied to a
    /// posted transaction.
    pub status: NotificationStatus,
    /// When this process first saw the event.
    pub received_at: SystemTime,
    /// Redacted raw event body.
    pub payload: Value,
    #[serde(skip)]
    dedup_key: String,
}

/// Delivery status of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Pulled from the undelivered queue, not yet tied to a transaction.
    Undelivered,
    /// Matched to a posted transaction's correlation pair.
    Matched,
}

impl NotificationRecord {
    /// Builds a record from a raw (already decrypted) event body.
    #[must_use]
    pub fn from_event(event: &Value, was_encrypted: bool) -> Self {
        let amount = ["cardholderAmount", "transactionAmount", "amount"]
            .iter()
            .find_map(|key| event.get(key))
            .and_then(decimal_of);
        let event_id = remote::string_field(event, "id", "notificationId");
        let reference_number = remote::string_field(event, "referenceNumber", "reference_number");
        let system_trace_audit_number =
            remote::string_field(event, "systemTraceAuditNumber", "stan");
        let id = event_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // Distinct events (e.g. authorization and clearing) can share one
        // correlation pair, so a supplied id always wins; the pair is only a
        // fallback for id-less events.
        let dedup_key = if event_id.is_some() {
            format!("id:{id}")
        } else if let (Some(reference), Some(stan)) =
            (&reference_number, &system_trace_audit_number)
        {
            format!("pair:{reference}|{stan}")
        } else {
            format!("id:{id}")
        };
        Self {
            id,
            card_reference: remote::string_field(event, "cardReference", "card_reference"),
            merchant: remote::string_field(event, "merchantName", "merchant"),
            amount,
            currency: remote::string_field(event, "cardholderCurrency", "currency"),
            reference_number,
            system_trace_audit_number,
            message_type: remote::string_field(event, "messageType", "message_type"),
            was_encrypted,
            status: NotificationStatus::Undelivered,
            received_at: SystemTime::now(),
            payload: error::redact_payload(event),
            dedup_key,
        }
    }

    /// Stable key for duplicate suppression.
    #[must_use]
    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// Whether this event refers to the given correlation pair.
    #[must_use]
    pub fn matches(&self, pair: &CorrelationPair) -> bool {
        match (&self.reference_number, &self.system_trace_audit_number) {
            (Some(reference), Some(stan)) => pair.matches(reference, stan),
            _ => false,
        }
    }
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.to_string().parse().ok(),
        _ => None,
    }
}

/// Durable set of already-processed event keys, so reconciliation survives a
/// restart without reprocessing events the queue redelivers.
pub trait SeenIdStore: Send + Sync {
    /// Records `key` as seen at `now`; returns `false` when it was already
    /// present.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn insert(&self, key: &str, now: SystemTime) -> Result<bool>;

    /// Drops entries older than `retention`, returning how many were removed.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn sweep(&self, now: SystemTime, retention: Duration) -> Result<usize>;
}

/// In-memory seen-id set with timestamped entries for retention sweeps.
#[derive(Debug, Default)]
pub struct InMemorySeenIdStore {
    entries: RwLock<std::collections::HashMap<String, SystemTime>>,
}

impl InMemorySeenIdStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeenIdStore for InMemorySeenIdStore {
    fn insert(&self, key: &str, now: SystemTime) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), now);
        Ok(true)
    }

    fn sweep(&self, now: SystemTime, retention: Duration) -> Result<usize> {
        let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, seen_at| *seen_at >= cutoff);
        Ok(before - entries.len())
    }
}

/// Reconciler tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Delay before the second poll; doubles per round up to `max_interval`.
    pub min_interval: Duration,
    /// Per-round delay ceiling.
    pub max_interval: Duration,
    /// How long seen-ids are retained before sweeping.
    pub retention: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(8),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of one reconciliation run.
#[derive(Debug)]
pub struct Reconciliation {
    /// Events matched to a pending correlation pair, in arrival order.
    pub matched: Vec<(CorrelationPair, NotificationRecord)>,
    /// Pairs still unmatched when the deadline passed.
    pub unmatched: Vec<CorrelationPair>,
    /// All new (non-duplicate) events observed during the run, matched or
    /// not, for audit.
    pub observed: Vec<NotificationRecord>,
    /// How many polls were issued.
    pub polls: usize,
}

/// Polls the undelivered queue and matches events to posted transactions.
pub struct NotificationReconciler {
    gateway: Arc<HttpGateway>,
    seen: Arc<dyn SeenIdStore>,
    config: ReconcilerConfig,
}

impl NotificationReconciler {
    /// Builds a reconciler over a shared gateway and seen-id store.
    #[must_use]
    pub fn new(
        gateway: Arc<HttpGateway>,
        seen: Arc<dyn SeenIdStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            gateway,
            seen,
            config,
        }
    }

    /// Polls until every pending pair has matched or `deadline` elapses.
    ///
    /// Each round issues one idempotent GET (the gateway retries transient
    /// failures internally), deduplicates events against both the session set
    /// and the durable store, and sleeps for an exponentially growing
    /// interval capped by the time remaining. Pairs left over at the deadline
    /// come back in `unmatched`.
    ///
    /// Transport failures during a round are logged and the round is
    /// skipped; the deadline bounds the whole run either way.
    ///
    /// # Errors
    /// [`ConsentKitError::FingerprintMismatch`] when an encrypted event
    /// names a foreign key, plus storage errors from the seen-id store.
    pub async fn poll(
        &self,
        pending: &[CorrelationPair],
        deadline: Duration,
    ) -> Result<Reconciliation> {
        let started = Instant::now();
        let mut outstanding: Vec<CorrelationPair> = pending.to_vec();
        let mut session_seen: HashSet<String> = HashSet::new();
        let mut matched = Vec::new();
        let mut observed = Vec::new();
        let mut polls = 0usize;
        let mut interval = self.config.min_interval;

        loop {
            polls += 1;
            let events = match self.gateway.get(paths::UNDELIVERED).await {
                Ok(response) => remote::extract_notifications(&response.body),
                Err(err) => {
                    tracing::warn!(error = %err, "poll round failed");
                    Vec::new()
                }
            };
            let mut round_new = 0usize;
            for event in events {
                let (event, was_encrypted) = self.decrypt_if_enveloped(event)?;
                let mut record = NotificationRecord::from_event(&event, was_encrypted);
                let key = record.dedup_key().to_owned();
                if !session_seen.insert(key.clone()) {
                    continue;
                }
                if !self.seen.insert(&key, SystemTime::now())? {
                    continue;
                }
                round_new += 1;
                if let Some(position) =
                    outstanding.iter().position(|pair| record.matches(pair))
                {
                    let pair = outstanding.swap_remove(position);
                    record.status = NotificationStatus::Matched;
                    tracing::info!(
                        reference_number = %pair.reference_number,
                        event_id = %record.id,
                        "transaction reconciled"
                    );
                    matched.push((pair, record.clone()));
                }
                observed.push(record);
            }

            if outstanding.is_empty() {
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                break;
            }
            let remaining = deadline - elapsed;
            tokio::time::sleep(interval.min(remaining)).await;
            interval = self.next_interval(interval, round_new);
        }

        self.seen.sweep(SystemTime::now(), self.config.retention)?;
        if !outstanding.is_empty() {
            tracing::info!(
                unmatched = outstanding.len(),
                polls,
                "reconciliation deadline reached with unmatched transactions"
            );
        }
        Ok(Reconciliation {
            matched,
            unmatched: outstanding,
            observed,
            polls,
        })
    }

    /// Backoff grows only between empty batches; a round that produced new
    /// events resets the interval, since more are likely in flight.
    fn next_interval(&self, current: Duration, round_new: usize) -> Duration {
        if round_new == 0 {
            (current * 2).min(self.config.max_interval)
        } else {
            self.config.min_interval
        }
    }

    /// When an event embeds an encrypted envelope, decrypts it and returns
    /// the plaintext body. A fingerprint mismatch propagates; other failures
    /// (no key held, undecodable ciphertext) keep the raw event so the run
    /// continues.
    fn decrypt_if_enveloped(&self, event: Value) -> Result<(Value, bool)> {
        let Ok(envelope) = serde_json::from_value::<EncryptedEnvelope>(event.clone()) else {
            return Ok((event, false));
        };
        let Some(cipher) = self.gateway.cipher() else {
            tracing::warn!("encrypted event received but no decryption key held");
            return Ok((event, true));
        };
        match cipher.decrypt(&envelope) {
            Ok(plaintext) => {
                let body = serde_json::from_slice(&plaintext).unwrap_or(Value::Null);
                Ok((body, true))
            }
            Err(err @ ConsentKitError::FingerprintMismatch { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "event payload could not be decrypted");
                Ok((event, true))
            }
        }
    }
}

impl std::fmt::Debug for NotificationReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationReconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
