//! Sandbox card-enrollment engine: request signing, payload encryption,
//! challenge-based authentication, and transaction reconciliation against a
//! card-network sandbox API.
//!
//! The crate is organized around a small number of collaborators that share
//! one [`credential::Credential`]:
//!
//! - [`signer::Signer`] produces the one-legged OAuth `Authorization` header
//!   for every outbound request.
//! - [`cipher::PayloadCipher`] hybrid-encrypts request bodies and decrypts
//!   encrypted response fields.
//! - [`gateway::HttpGateway`] is the only component that touches the
//!   network; it signs, encrypts, retries idempotent calls, and classifies
//!   failures into the [`error::ConsentKitError`] taxonomy.
//! - [`consent::EnrollmentService`] enrolls cards and opens an
//!   authentication flow when the sandbox demands one.
//! - [`challenge::AuthChallengeMachine`] drives the step-wise authentication
//!   protocol, persisting every transition through a
//!   [`pending::PendingStateStore`].
//! - [`transaction::TransactionService`] posts transactions tagged with a
//!   fresh [`transaction::CorrelationPair`].
//! - [`reconcile::NotificationReconciler`] polls the undelivered queue and
//!   matches events back to posted transactions.
//!
//! Nothing here reads key files or environment variables: credentials and
//! configuration are injected by the embedding application.

pub mod challenge;
pub mod cipher;
pub mod consent;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod pending;
pub mod reconcile;
pub mod remote;
pub mod signer;
pub mod transaction;

pub use challenge::{AuthChallengeMachine, AuthStep, AuthenticationAttempt, Evidence, StepDeadlines};
pub use cipher::{EncryptedEnvelope, PayloadCipher};
pub use consent::{CardDetails, ConsentRequest, EnrollmentOutcome, EnrollmentService};
pub use credential::Credential;
pub use error::{ConsentKitError, Result};
pub use gateway::{ApiResponse, GatewayConfig, HttpGateway, SendOptions};
pub use pending::{InMemoryPendingStateStore, PendingState, PendingStateStore};
pub use reconcile::{
    InMemorySeenIdStore, NotificationReconciler, NotificationRecord, NotificationStatus,
    Reconciliation, ReconcilerConfig, SeenIdStore,
};
pub use signer::Signer;
pub use transaction::{
    CorrelationPair, TransactionInput, TransactionRecord, TransactionService, TransactionStatus,
};
