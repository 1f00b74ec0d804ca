use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Node configuration is invalid.
    Config,
    /// Generic execution error.
    Execution,
    Timeout,
    Network,
    RateLimit,
    ServerError,
    /// Explicitly transient (caller marked it safe to retry).
    Transient,
    /// Cancellation observed at a suspension point.
    Aborted,
    MaxDepthExceeded,
    MaxIterationsExceeded,
    RetryExhausted,
    SubflowTimeout,
}

impl ErrorKind {
    /// SCREAMING_SNAKE_CASE code, as matched by retry deny-lists.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config => "CONFIG",
            Self::Execution => "EXECUTION",
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::Transient => "TRANSIENT",
            Self::Aborted => "ABORTED",
            Self::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            Self::MaxIterationsExceeded => "MAX_ITERATIONS_EXCEEDED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::SubflowTimeout => "SUBFLOW_TIMEOUT",
        }
    }

    /// Safety limits are terminal for the construct that raised them and are never retried.
    pub fn is_safety_limit(&self) -> bool {
        matches!(
            self,
            Self::MaxDepthExceeded
                | Self::MaxIterationsExceeded
                | Self::RetryExhausted
                | Self::SubflowTimeout
        )
    }

    /// Whether failures of this kind are retry candidates by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimit | Self::ServerError | Self::Transient
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The failure variant of a node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub message: String,
    pub kind: ErrorKind,
    /// Provider or node specific error code (e.g. `AUTH_FAILED`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Advisory retry eligibility.
    pub recoverable: bool,
    /// Output handle to continue on instead of failing the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn server_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b5\d\d\b|internal server error|bad gateway|service unavailable")
            .expect("static pattern")
    })
}

impl NodeFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            code: None,
            recoverable: kind.is_transient(),
            branch: None,
        }
    }

    /// Classify a raw error message by pattern (timeout, rate limit, 5xx, network, transient).
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let kind = if lower.contains("timeout") || lower.contains("timed out") {
            ErrorKind::Timeout
        } else if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            ErrorKind::RateLimit
        } else if server_error_pattern().is_match(&message) {
            ErrorKind::ServerError
        } else if ["econnreset", "econnrefused", "connection", "network", "socket"]
            .iter()
            .any(|p| lower.contains(p))
        {
            ErrorKind::Network
        } else if lower.contains("transient") || lower.contains("temporar") {
            ErrorKind::Transient
        } else {
            ErrorKind::Execution
        };

        Self::new(kind, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "execution cancelled")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// True if either the kind code or the provider code equals `code` (case-insensitive).
    pub fn matches_code(&self, code: &str) -> bool {
        self.kind.code().eq_ignore_ascii_case(code)
            || self
                .code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code))
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "kind": self.kind.code(),
            "code": self.code,
            "recoverable": self.recoverable,
        })
    }
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Routing override carried by a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Next {
    /// Follow the edge leaving this output handle.
    Handle(String),
    /// Jump to a node id.
    Node(String),
    /// Continue along the default edge of another node (used by wrappers).
    After(String),
    /// End the current path.
    Halt,
}

/// Outcome of one executor invocation. Exactly one is produced per call.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult {
    Success { output: Value, next: Option<Next> },
    Failure(NodeFailure),
    Skip { reason: String },
}

impl NodeResult {
    pub fn success(output: Value) -> Self {
        Self::Success { output, next: None }
    }

    pub fn route(output: Value, next: Next) -> Self {
        Self::Success {
            output,
            next: Some(next),
        }
    }

    pub fn handle(output: Value, handle: impl Into<String>) -> Self {
        Self::route(output, Next::Handle(handle.into()))
    }

    pub fn failure(failure: NodeFailure) -> Self {
        Self::Failure(failure)
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Success { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&NodeFailure> {
        match self {
            Self::Failure(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_patterns() {
        assert_eq!(NodeFailure::classify("request timed out").kind, ErrorKind::Timeout);
        assert_eq!(NodeFailure::classify("HTTP 429 Too Many Requests").kind, ErrorKind::RateLimit);
        assert_eq!(NodeFailure::classify("upstream returned 503").kind, ErrorKind::ServerError);
        assert_eq!(NodeFailure::classify("ECONNRESET by peer").kind, ErrorKind::Network);
        assert_eq!(NodeFailure::classify("temporarily unavailable").kind, ErrorKind::Transient);

        let plain = NodeFailure::classify("invalid recipient");
        assert_eq!(plain.kind, ErrorKind::Execution);
        assert!(!plain.recoverable);
    }

    #[test]
    fn recoverable_follows_kind() {
        assert!(NodeFailure::new(ErrorKind::RateLimit, "slow down").recoverable);
        assert!(!NodeFailure::new(ErrorKind::MaxDepthExceeded, "deep").recoverable);
        assert!(!NodeFailure::aborted().recoverable);
    }

    #[test]
    fn code_matching() {
        let f = NodeFailure::new(ErrorKind::Execution, "nope").with_code("AUTH_FAILED");
        assert!(f.matches_code("auth_failed"));
        assert!(f.matches_code("EXECUTION"));
        assert!(!f.matches_code("TIMEOUT"));
    }

    #[test]
    fn safety_limits() {
        assert!(ErrorKind::MaxDepthExceeded.is_safety_limit());
        assert!(ErrorKind::RetryExhausted.is_safety_limit());
        assert!(!ErrorKind::Timeout.is_safety_limit());
        assert_eq!(ErrorKind::MaxIterationsExceeded.to_string(), "MAX_ITERATIONS_EXCEEDED");
    }

    #[test]
    fn result_accessors() {
        let ok = NodeResult::handle(serde_json::json!(1), "true");
        assert!(ok.is_success());
        assert_eq!(ok.output(), Some(&serde_json::json!(1)));
        assert!(NodeResult::failure(NodeFailure::aborted()).as_failure().is_some());
        assert!(!NodeResult::skip("nothing to do").is_failure());
    }
}
