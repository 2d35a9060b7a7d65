//! Telegram transport: the inbound webhook that feeds the trigger queue and
//! the outbound sendMessage sink.
//!
//! The webhook always answers 200 once the secret checks out — Telegram
//! retries anything else, and a retried update would double-trigger the
//! agent.  Authorization failures are the one exception (401) so a
//! misconfigured proxy is visible.

pub mod sink;
pub mod webhook;

pub use sink::TelegramSink;
pub use webhook::{WebhookState, router};
