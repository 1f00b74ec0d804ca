pub mod breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod result;
pub mod store;
pub mod template;
pub mod traits;
pub mod types;

pub use breaker::ConsecutiveFailureBreaker;
pub use config::AppConfig;
pub use error::{ConduitError, Result};
pub use event::EventBus;
pub use flow::{Edge, Flow, Node, DEFAULT_HANDLE};
pub use result::{ErrorKind, Next, NodeFailure, NodeResult};
pub use store::{DirectoryFlowStore, InMemoryFlowStore};
pub use template::{resolve_template, TemplateContext};
pub use traits::{AiService, CircuitBreaker, FlowStore, MessageSender, Notifier};
pub use types::*;
