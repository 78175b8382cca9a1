//! HTTP surface and background runtime of the webhook gateway.

pub mod bootstrap;
pub mod health;
pub mod outbound;
pub mod outbox_relay;
pub mod provider;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod voice_session;
pub mod webhooks;
pub mod worker;
