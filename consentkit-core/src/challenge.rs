//! Step-wise cardholder-authentication state machine.
//!
//! Control returns to an external actor (the browser) between steps, so every
//! transition is computed from the *persisted* state plus fresh evidence,
//! never from in-memory state alone, and the new step is committed before
//! control returns to the caller. A crash between steps therefore resumes
//! deterministically from the last committed step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ConsentKitError, Result};
use crate::gateway::HttpGateway;
use crate::pending::{PendingState, PendingStateStore};
use crate::remote::{
    self, paths, AuthSection, AUTH_STATUS_AUTHENTICATED, AUTH_STATUS_IN_PROGRESS,
    AUTH_STATUS_READY, AUTH_TYPE_THREEDS,
};

/// Protocol steps. `Verified`, `Failed`, and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStep {
    /// Waiting for the browser to report device fingerprinting.
    Fingerprinting,
    /// Fingerprint result committed; start-authentication in flight or
    /// interrupted before its outcome was recorded.
    Started,
    /// The authenticator demands an interactive challenge.
    ChallengeRequired,
    /// Challenge UI handed to the user; waiting for the completion signal.
    ChallengePending,
    /// Authentication succeeded.
    Verified,
    /// Authentication failed (rejection, malformed response, or protocol
    /// violation).
    Failed,
    /// A step deadline elapsed before the external transition arrived.
    TimedOut,
}

impl AuthStep {
    /// Whether this step ends the attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::TimedOut)
    }
}

/// Externally-supplied proof that a step finished. The browser driver only
/// reports *that* something happened; all parameters flow from persisted
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// The device fingerprint iframe completed (or timed out client-side).
    FingerprintCompleted,
    /// The challenge UI was handed to the user.
    ChallengeCompleted,
    /// The challenge-completion callback arrived from the authenticator.
    ChallengeResultReceived,
}

impl Evidence {
    const fn describe(self) -> &'static str {
        match self {
            Self::FingerprintCompleted => "fingerprint-completed",
            Self::ChallengeCompleted => "challenge-completed",
            Self::ChallengeResultReceived => "challenge-result-received",
        }
    }
}

/// Outcome of one `advance` call, handed back to the browser driver so it can
/// decide what to render next.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationAttempt {
    /// Card reference being authenticated.
    pub subject_reference: String,
    /// Step after the transition.
    pub step: AuthStep,
    /// 3-D Secure server transaction id, when known.
    pub transaction_id: Option<String>,
    /// Error detail for `Failed`/`TimedOut` steps.
    pub last_error: Option<String>,
}

/// Per-step deadlines. The challenge deadline is longer because a human is in
/// the loop.
#[derive(Debug, Clone, Copy)]
pub struct StepDeadlines {
    /// Allowance for the silent device-fingerprinting step.
    pub fingerprint: Duration,
    /// Allowance for the interactive challenge steps.
    pub challenge: Duration,
    /// How long finished attempts stay cached for idempotent replay before
    /// a sweep drops them.
    pub terminal_retention: Duration,
}

impl Default for StepDeadlines {
    fn default() -> Self {
        Self {
            fingerprint: Duration::from_secs(5 * 60),
            challenge: Duration::from_secs(15 * 60),
            terminal_retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Drives the authentication protocol against the sandbox, persisting every
/// transition through the [`PendingStateStore`].
pub struct AuthChallengeMachine {
    gateway: Arc<HttpGateway>,
    store: Arc<dyn PendingStateStore>,
    deadlines: StepDeadlines,
    // Serializes transitions per token so a duplicate browser postback cannot
    // race the first one. Transitions for different tokens are independent.
    token_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    // Terminal results outlive the pending record so re-entry stays
    // idempotent after the record is deleted. Entries are timestamped and
    // dropped by `sweep_finished` once the retention window passes.
    terminal: RwLock<HashMap<String, (AuthenticationAttempt, SystemTime)>>,
    // One live attempt per subject; a new `begin` supersedes the old token.
    live_by_subject: Mutex<HashMap<String, String>>,
}

impl AuthChallengeMachine {
    /// Builds a machine over a gateway and a pending-state store.
    #[must_use]
    pub fn new(
        gateway: Arc<HttpGateway>,
        store: Arc<dyn PendingStateStore>,
        deadlines: StepDeadlines,
    ) -> Self {
        Self {
            gateway,
            store,
            deadlines,
            token_locks: Mutex::new(HashMap::new()),
            terminal: RwLock::new(HashMap::new()),
            live_by_subject: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a new attempt for `subject_reference` from the `auth` section of
    /// an enrollment response, discarding any superseded attempt for the same
    /// subject.
    ///
    /// # Errors
    /// [`ConsentKitError::ProtocolViolation`] when the auth section does not
    /// announce a startable THREEDS authentication.
    pub fn begin(
        &self,
        subject_reference: &str,
        auth: &AuthSection,
    ) -> Result<PendingState> {
        let auth_type = auth.auth_type.as_deref().unwrap_or_default();
        if auth_type != AUTH_TYPE_THREEDS {
            return Err(ConsentKitError::protocol(format!(
                "unsupported authentication type '{auth_type}'"
            )));
        }
        if auth.status.as_deref() != Some(AUTH_STATUS_READY) {
            return Err(ConsentKitError::protocol(format!(
                "authentication not startable in status {:?}",
                auth.status
            )));
        }

        // Supersede, never merge: the old attempt is discarded wholesale.
        if let Some(old_token) = self
            .live_by_subject
            .lock()
            .unwrap()
            .insert(subject_reference.to_owned(), String::new())
        {
            if !old_token.is_empty() {
                self.store.delete(&old_token)?;
                self.terminal.write().unwrap().remove(&old_token);
                self.token_locks.lock().unwrap().remove(&old_token);
            }
        }

        let now = SystemTime::now();
        self.sweep_finished(now);
        let token = Uuid::new_v4().to_string();
        let mut attributes: HashMap<String, String> = auth
            .params
            .iter()
            .map(|(key, value)| (key.clone(), stringify(value)))
            .collect();
        attributes.insert("authType".to_owned(), auth_type.to_owned());

        let state = PendingState {
            state_token: token.clone(),
            subject_reference: subject_reference.to_owned(),
            step: AuthStep::Fingerprinting,
            created_at: now,
            expires_at: now + self.deadlines.fingerprint,
            attributes,
        };
        self.store.put(state.clone())?;
        self.live_by_subject
            .lock()
            .unwrap()
            .insert(subject_reference.to_owned(), token);
        Ok(state)
    }

    /// Applies one piece of evidence to the attempt identified by `token`.
    ///
    /// Re-entering on an already-terminal token is idempotent: the stored
    /// terminal attempt is returned and no remote call is made. Evidence for
    /// a step other than the persisted one is rejected as a protocol
    /// violation and the attempt moves to `Failed`.
    ///
    /// # Errors
    /// [`ConsentKitError::StateNotFound`] for unknown tokens,
    /// [`ConsentKitError::ProtocolViolation`] for out-of-order or replayed
    /// evidence, plus storage errors from the pending-state store.
    pub async fn advance(&self, token: &str, evidence: Evidence) -> Result<AuthenticationAttempt> {
        let lock = self.token_lock(token);
        let _guard = lock.lock().await;

        if let Some((attempt, _)) = self.terminal.read().unwrap().get(token) {
            return Ok(attempt.clone());
        }

        let state = self
            .store
            .get(token)?
            .ok_or_else(|| ConsentKitError::StateNotFound {
                token: token.to_owned(),
            })?;

        let now = SystemTime::now();
        if state.is_expired(now) {
            tracing::warn!(token, step = ?state.step, "step deadline elapsed");
            return Ok(self.finish(
                state,
                AuthStep::TimedOut,
                Some("step deadline elapsed before completion".to_owned()),
            )?);
        }

        match (state.step, evidence) {
            // `Started` also accepts the fingerprint evidence: it means a
            // crash landed between the commit and the response handling, and
            // the resume re-drives start-authentication.
            (AuthStep::Fingerprinting | AuthStep::Started, Evidence::FingerprintCompleted) => {
                self.start_authentication(state, now).await
            }
            (AuthStep::ChallengeRequired, Evidence::ChallengeCompleted) => {
                let mut state = state;
                state.advance_to(AuthStep::ChallengePending, now, self.deadlines.challenge);
                self.store.put(state.clone())?;
                Ok(attempt_for(&state, None))
            }
            (AuthStep::ChallengePending, Evidence::ChallengeResultReceived) => {
                self.verify_authentication(state, now).await
            }
            (step, evidence) => {
                let reason = format!(
                    "evidence '{}' does not belong to step {step:?}",
                    evidence.describe()
                );
                self.finish(state, AuthStep::Failed, Some(reason.clone()))?;
                Err(ConsentKitError::protocol(reason))
            }
        }
    }

    /// Looks up the live token for a subject, if one exists.
    #[must_use]
    pub fn live_token(&self, subject_reference: &str) -> Option<String> {
        self.live_by_subject
            .lock()
            .unwrap()
            .get(subject_reference)
            .filter(|token| !token.is_empty())
            .cloned()
    }

    async fn start_authentication(
        &self,
        mut state: PendingState,
        now: SystemTime,
    ) -> Result<AuthenticationAttempt> {
        // Commit the step before the remote call so a crash resumes here.
        state.advance_to(AuthStep::Started, now, self.deadlines.fingerprint);
        self.store.put(state.clone())?;

        let body = json!({
            "auth": {
                "type": state.attributes.get("authType").cloned().unwrap_or_else(|| AUTH_TYPE_THREEDS.to_owned()),
                "params": fingerprint_params(&state),
            }
        });
        let response = self
            .gateway
            .post(&paths::start_authentication(&state.subject_reference), &body)
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let reason = format!("start-authentication failed: {err}");
                return Ok(self.finish(state, AuthStep::Failed, Some(reason))?);
            }
        };

        let parsed: remote::AuthStatusResponse =
            serde_json::from_value(response.body).unwrap_or_default();
        let auth = parsed.auth.unwrap_or_default();
        match auth.status.as_deref() {
            Some(AUTH_STATUS_AUTHENTICATED) => {
                Ok(self.finish(state, AuthStep::Verified, None)?)
            }
            Some(AUTH_STATUS_IN_PROGRESS) => {
                let acs_url = auth.params.get("acsUrl").map(stringify);
                let creq = auth.params.get("encodedCReq").map(stringify);
                match (acs_url, creq) {
                    (Some(acs_url), Some(creq)) => {
                        state
                            .attributes
                            .insert("acsUrl".to_owned(), acs_url);
                        state.attributes.insert("encodedCReq".to_owned(), creq);
                        state.advance_to(
                            AuthStep::ChallengeRequired,
                            now,
                            self.deadlines.challenge,
                        );
                        self.store.put(state.clone())?;
                        Ok(attempt_for(&state, None))
                    }
                    _ => Ok(self.finish(
                        state,
                        AuthStep::Failed,
                        Some("challenge parameters missing from response".to_owned()),
                    )?),
                }
            }
            other => Ok(self.finish(
                state,
                AuthStep::Failed,
                Some(format!("unexpected authentication status {other:?}")),
            )?),
        }
    }

    async fn verify_authentication(
        &self,
        state: PendingState,
        _now: SystemTime,
    ) -> Result<AuthenticationAttempt> {
        let mut params = serde_json::Map::new();
        if let Some(trans_id) = state.attributes.get("threeDSServerTransID") {
            params.insert(
                "threeDSServerTransID".to_owned(),
                Value::String(trans_id.clone()),
            );
        }
        let body = json!({
            "auth": {
                "type": state.attributes.get("authType").cloned().unwrap_or_else(|| AUTH_TYPE_THREEDS.to_owned()),
                "params": params,
            }
        });
        let response = self
            .gateway
            .post(
                &paths::verify_authentication(&state.subject_reference),
                &body,
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let reason = format!("verify-authentication failed: {err}");
                return Ok(self.finish(state, AuthStep::Failed, Some(reason))?);
            }
        };

        let parsed: remote::AuthStatusResponse =
            serde_json::from_value(response.body).unwrap_or_default();
        let status = parsed.auth.unwrap_or_default().status;
        if status.as_deref() == Some(AUTH_STATUS_AUTHENTICATED) {
            Ok(self.finish(state, AuthStep::Verified, None)?)
        } else {
            Ok(self.finish(
                state,
                AuthStep::Failed,
                Some(format!("verification returned status {status:?}")),
            )?)
        }
    }

    /// Records a terminal outcome: the terminal attempt is stored for
    /// idempotent replay, the pending record is deleted, and the subject's
    /// live-token slot is cleared if it still belongs to this attempt (a
    /// superseding `begin` may have claimed it meanwhile).
    fn finish(
        &self,
        state: PendingState,
        step: AuthStep,
        last_error: Option<String>,
    ) -> Result<AuthenticationAttempt> {
        debug_assert!(step.is_terminal());
        let attempt = AuthenticationAttempt {
            subject_reference: state.subject_reference.clone(),
            step,
            transaction_id: state.attributes.get("threeDSServerTransID").cloned(),
            last_error,
        };
        self.terminal.write().unwrap().insert(
            state.state_token.clone(),
            (attempt.clone(), SystemTime::now()),
        );
        self.store.delete(&state.state_token)?;
        {
            let mut live = self.live_by_subject.lock().unwrap();
            if live
                .get(&state.subject_reference)
                .is_some_and(|token| token == &state.state_token)
            {
                live.remove(&state.subject_reference);
            }
        }
        tracing::debug!(token = %state.state_token, step = ?step, "attempt finished");
        Ok(attempt)
    }

    /// Drops finished attempts older than the terminal retention window,
    /// along with their per-token locks, returning how many were removed.
    /// Replays of a swept token see `StateNotFound`. Runs opportunistically
    /// on every `begin`; long-running hosts can also call it on a schedule.
    pub fn sweep_finished(&self, now: SystemTime) -> usize {
        let cutoff = now
            .checked_sub(self.deadlines.terminal_retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut terminal = self.terminal.write().unwrap();
        let expired: Vec<String> = terminal
            .iter()
            .filter(|(_, entry)| entry.1 < cutoff)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            terminal.remove(token);
        }
        drop(terminal);
        let mut locks = self.token_locks.lock().unwrap();
        for token in &expired {
            locks.remove(token);
        }
        expired.len()
    }

    fn token_lock(&self, token: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.token_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(token.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

impl std::fmt::Debug for AuthChallengeMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthChallengeMachine")
            .field("deadlines", &self.deadlines)
            .finish_non_exhaustive()
    }
}

fn attempt_for(state: &PendingState, last_error: Option<String>) -> AuthenticationAttempt {
    AuthenticationAttempt {
        subject_reference: state.subject_reference.clone(),
        step: state.step,
        transaction_id: state.attributes.get("threeDSServerTransID").cloned(),
        last_error,
    }
}

/// Parameters for start-authentication: every stored attribute from the
/// enrollment's auth section plus the fingerprint completion marker.
fn fingerprint_params(state: &PendingState) -> serde_json::Map<String, Value> {
    let mut params: serde_json::Map<String, Value> = state
        .attributes
        .iter()
        .filter(|(key, _)| key.as_str() != "authType")
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();
    params.insert(
        "fingerprintStatus".to_owned(),
        Value::String("COMPLETE".to_owned()),
    );
    params
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
