use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_without_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_cancellable(Duration::from_secs(5), &cancel).await);
    }

    #[tokio::test]
    async fn cancel_interrupts_long_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(60), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
