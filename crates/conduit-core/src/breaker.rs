use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::traits::CircuitBreaker;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// In-memory breaker keyed by string.
///
/// Opens after `threshold` consecutive failures. Once `cooldown` has elapsed the
/// breaker is half-open: calls are allowed again, a success closes it and a
/// failure re-opens it immediately.
pub struct ConsecutiveFailureBreaker {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl ConsecutiveFailureBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        !self.can_execute(key)
    }
}

impl Default for ConsecutiveFailureBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn can_execute(&self, key: &str) -> bool {
        let states = self.states.lock();
        match states.get(key).and_then(|s| s.opened_at) {
            Some(opened) => opened.elapsed() >= self.cooldown,
            None => true,
        }
    }

    fn record_success(&self, key: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(key) {
            if state.opened_at.take().is_some() {
                info!(key, "Circuit closed");
            }
            state.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, key: &str) {
        let mut states = self.states.lock();
        let state = states.entry(key.to_string()).or_default();
        state.consecutive_failures += 1;
        let half_open = state.opened_at.is_some();
        if half_open || state.consecutive_failures >= self.threshold {
            if !half_open {
                warn!(key, failures = state.consecutive_failures, "Circuit opened");
            }
            state.opened_at = Some(Instant::now());
        }
    }
}
