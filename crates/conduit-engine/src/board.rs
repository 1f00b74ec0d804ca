use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

/// Arrival state of the branches feeding one merge node.
///
/// Opened by a fork for its paired merge id; branches publish into it as they
/// finish, including after the fork itself has returned.
pub struct BranchBoard {
    /// Branch names in edge declaration order.
    names: Vec<String>,
    state: Mutex<BoardState>,
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct BoardState {
    /// Successful branch outputs in arrival order.
    arrived: Vec<(String, Value)>,
    failed: HashMap<String, String>,
}

/// Point-in-time copy of a board.
#[derive(Debug, Clone, Default)]
pub struct BoardSnapshot {
    pub arrived: Vec<(String, Value)>,
    pub failed: HashMap<String, String>,
}

impl BoardSnapshot {
    pub fn settled(&self) -> usize {
        self.arrived.len() + self.failed.len()
    }

    pub fn has_arrived(&self, name: &str) -> bool {
        self.arrived.iter().any(|(n, _)| n == name)
    }
}

impl BranchBoard {
    pub fn new(names: Vec<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            names,
            state: Mutex::new(BoardState::default()),
            version,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn arrive(&self, name: &str, output: Value) {
        {
            let mut state = self.state.lock();
            if state.arrived.iter().any(|(n, _)| n == name) {
                return;
            }
            state.arrived.push((name.to_string(), output));
        }
        self.bump();
    }

    pub fn fail(&self, name: &str, message: impl Into<String>) {
        self.state.lock().failed.insert(name.to_string(), message.into());
        self.bump();
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let state = self.state.lock();
        BoardSnapshot {
            arrived: state.arrived.clone(),
            failed: state.failed.clone(),
        }
    }

    /// Receiver that observes every subsequent publication.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arrivals_keep_order_and_dedupe() {
        let board = BranchBoard::new(vec!["a".into(), "b".into()]);
        board.arrive("b", json!(2));
        board.arrive("a", json!(1));
        board.arrive("b", json!(99));
        let snap = board.snapshot();
        assert_eq!(snap.arrived, vec![("b".to_string(), json!(2)), ("a".to_string(), json!(1))]);
        assert!(snap.has_arrived("a"));
    }

    #[tokio::test]
    async fn subscribers_wake_on_publish() {
        let board = std::sync::Arc::new(BranchBoard::new(vec!["a".into()]));
        let mut rx = board.subscribe();
        let publisher = board.clone();
        tokio::spawn(async move { publisher.fail("a", "boom") });
        rx.changed().await.unwrap();
        assert_eq!(board.snapshot().settled(), 1);
    }
}
