//! AI conversation interface for the webhook gateway.
//!
//! The gateway never generates replies itself. It hands each inbound turn to
//! a [`ConversationProcessor`] and passes whatever comes back through the
//! [`ReplyGuard`] before anything is texted to a patient.
//!
//! # Implementations
//!
//! - [`HttpConversationProcessor`] talks JSON to an external conversation
//!   service with a bounded timeout.
//! - [`ScriptedProcessor`] returns canned replies and records every request,
//!   for tests and offline runs.

pub mod guardrails;
pub mod http;
pub mod processor;
pub mod scripted;

pub use guardrails::{ReplyDecision, ReplyGuard};
pub use http::HttpConversationProcessor;
pub use processor::{ConversationProcessor, ProcessorError};
pub use scripted::ScriptedProcessor;
