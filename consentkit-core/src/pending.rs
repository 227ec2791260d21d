//! Durable in-flight authentication state.
//!
//! The store contract is deliberately small: the persistence collaborator
//! (out of scope here) implements it however it likes, as long as writes are
//! atomic per token — a reader never observes a partially written record.
//! Exactly-once semantics per token are the challenge machine's job, not the
//! store's.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::challenge::AuthStep;
use crate::error::Result;

/// One in-flight authentication, keyed by an unguessable state token.
///
/// Created when a multi-step flow begins, rewritten on every committed
/// transition, and deleted on terminal success/failure or expiry. State
/// tokens are UUIDv4 and are never reused across subjects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingState {
    /// Unique, unguessable lookup key handed to the browser driver.
    pub state_token: String,
    /// The card reference this attempt authenticates.
    pub subject_reference: String,
    /// Last committed protocol step.
    pub step: AuthStep,
    /// When the flow began.
    pub created_at: SystemTime,
    /// Deadline for the current step; past this the attempt times out.
    pub expires_at: SystemTime,
    /// Step-specific attributes (auth type, ACS parameters, transaction id).
    pub attributes: HashMap<String, String>,
}

impl PendingState {
    /// Whether the step deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }

    /// Moves the record to `step` and extends the deadline by `step_deadline`
    /// from `now`.
    pub fn advance_to(&mut self, step: AuthStep, now: SystemTime, step_deadline: Duration) {
        self.step = step;
        self.expires_at = now + step_deadline;
    }
}

/// Abstract durable store for [`PendingState`] records.
///
/// Implementations must guarantee per-token atomic writes and that
/// `sweep_expired` removes every record whose deadline has passed, freeing
/// tokens for garbage collection (not for reuse).
pub trait PendingStateStore: Send + Sync {
    /// Inserts or replaces the record for `state.state_token`.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn put(&self, state: PendingState) -> Result<()>;

    /// Looks up a record; `None` when the token is unknown.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn get(&self, token: &str) -> Result<Option<PendingState>>;

    /// Deletes the record for `token`, if any.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn delete(&self, token: &str) -> Result<()>;

    /// Removes all records expired as of `now`, returning how many.
    ///
    /// # Errors
    /// Implementation-defined storage failures.
    fn sweep_expired(&self, now: SystemTime) -> Result<usize>;
}

/// Thread-safe in-memory store, used in tests and as the default when no
/// persistence collaborator is wired in.
#[derive(Debug, Default)]
pub struct InMemoryPendingStateStore {
    records: RwLock<HashMap<String, PendingState>>,
}

impl InMemoryPendingStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    ///
    /// # Panics
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PendingStateStore for InMemoryPendingStateStore {
    fn put(&self, state: PendingState) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(state.state_token.clone(), state);
        Ok(())
    }

    fn get(&self, token: &str) -> Result<Option<PendingState>> {
        Ok(self.records.read().unwrap().get(token).cloned())
    }

    fn delete(&self, token: &str) -> Result<()> {
        self.records.write().unwrap().remove(token);
        Ok(())
    }

    fn sweep_expired(&self, now: SystemTime) -> Result<usize> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, state| !state.is_expired(now));
        Ok(before - records.len())
    }
}
