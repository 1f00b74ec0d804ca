//! Trigger boundary: the events that start flow runs, webhook request
//! authentication, and the cron scheduler.

pub mod event;
pub mod scheduler;
pub mod webhook;

pub use event::TriggerEvent;
pub use scheduler::FlowScheduler;
pub use webhook::{authenticate, AuthResult, AuthType, WebhookAuthConfig, WebhookRequest};
