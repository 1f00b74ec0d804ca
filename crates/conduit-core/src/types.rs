use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::ErrorKind;

/// Unique identifier of one flow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node invocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Per-run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

/// Events emitted by the engine through the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    RunStarted {
        execution_id: ExecutionId,
        flow_id: String,
        depth: u32,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        node_type: String,
    },
    NodeFinished {
        execution_id: ExecutionId,
        node_id: String,
        state: NodeState,
        elapsed_ms: u64,
    },
    RetryScheduled {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Out-of-band broadcast from a flow (handoff, consensus, ...).
    Broadcast {
        execution_id: ExecutionId,
        topic: String,
        payload: serde_json::Value,
    },
    RunFinished {
        execution_id: ExecutionId,
        flow_id: String,
        status: RunStatus,
        error_kind: Option<ErrorKind>,
    },
}

/// A chat-style message sent to the AI service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiMessage {
    pub role: String,
    pub content: String,
}

impl AiMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

/// Request to the AI completion/routing service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiRequest {
    pub messages: Vec<AiMessage>,
    /// Model tier hint (e.g. "fast", "balanced", "smart").
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

/// An outbound message on a messaging channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: String,
    pub text: String,
}

/// Delivery receipt from a messaging channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub delivered_at: Option<DateTime<Utc>>,
}
