use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConduitError {
    // Flow errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow load failed: {flow_id}: {message}")]
    FlowLoad { flow_id: String, message: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found in flow: {0}")]
    NodeNotFound(String),

    #[error("No executor registered for node type: {0}")]
    UnknownNodeType(String),

    #[error("Flow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    // Service errors
    #[error("AI service error: {0}")]
    Ai(String),

    #[error("AI service not configured")]
    AiUnavailable,

    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error("Channel not configured: {0}")]
    ChannelUnavailable(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_joins_messages() {
        let err = ConduitError::Validation(vec!["a: bad".into(), "b: worse".into()]);
        assert_eq!(err.to_string(), "Flow validation failed: a: bad; b: worse");
    }

    #[test]
    fn json_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: ConduitError = parse.unwrap_err().into();
        assert!(matches!(err, ConduitError::Json(_)));
    }
}
