pub mod compliance;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod errors;
pub mod phone;
pub mod retry;
pub mod signature;

pub use compliance::{ComplianceEngine, InboundAssessment, Keyword, MessagePurpose};
pub use domain::OrgId;
pub use envelope::{parse_envelope, EventKind, ProviderEvent};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use retry::{RetryOutcome, RetryPolicy};
pub use signature::{SignatureError, WebhookVerifier};
