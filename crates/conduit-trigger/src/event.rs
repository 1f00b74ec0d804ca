use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Something that starts a flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerEvent {
    Manual {
        input: Value,
    },
    Webhook {
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        query: HashMap<String, String>,
        body: Value,
    },
    Message {
        channel: String,
        sender: String,
        text: String,
    },
    Schedule {
        name: String,
        fired_at: DateTime<Utc>,
        #[serde(default)]
        input: Value,
    },
}

impl TriggerEvent {
    pub fn manual(input: Value) -> Self {
        Self::Manual { input }
    }

    /// Node type of the trigger node this event feeds.
    pub fn node_type(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "trigger:manual",
            Self::Webhook { .. } => "trigger:webhook",
            Self::Message { .. } => "trigger:message",
            Self::Schedule { .. } => "trigger:schedule",
        }
    }

    /// The flow input this event produces.
    pub fn payload(&self) -> Value {
        match self {
            Self::Manual { input } => input.clone(),
            Self::Webhook {
                path,
                headers,
                query,
                body,
            } => json!({
                "path": path,
                "headers": headers,
                "query": query,
                "body": body,
            }),
            Self::Message {
                channel,
                sender,
                text,
            } => json!({
                "channel": channel,
                "sender": sender,
                "text": text,
            }),
            Self::Schedule {
                name,
                fired_at,
                input,
            } => {
                let mut payload = match input {
                    Value::Object(map) => map.clone(),
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("input".into(), other.clone());
                        map
                    }
                };
                payload.insert("schedule".into(), json!(name));
                payload.insert("firedAt".into(), json!(fired_at.to_rfc3339()));
                Value::Object(payload)
            }
        }
    }
}
