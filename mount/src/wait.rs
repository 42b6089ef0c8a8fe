//! Bounded polling helpers
//!
//! Motion completion and homing are detected by polling. These helpers
//! sleep between polls, give up after a timeout, and stop early when the
//! caller's cancellation check fires.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// How a wait ended when it did not time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Done,
    Cancelled,
}

impl WaitOutcome {
    pub fn is_done(self) -> bool {
        self == WaitOutcome::Done
    }
}

/// Poll `is_done` until it reports true, `cancelled` reports true, or
/// `timeout` elapses. The timeout error is built by `on_timeout` from the
/// elapsed time.
pub async fn poll_until<F, Fut, E>(
    mut is_done: F,
    cancelled: &(dyn Fn() -> bool + Send + Sync),
    timeout: Duration,
    poll_interval: Duration,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<WaitOutcome, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();

    loop {
        if cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        if is_done().await? {
            tracing::trace!("Wait finished after {:.2}s", start.elapsed().as_secs_f64());
            return Ok(WaitOutcome::Done);
        }

        let elapsed = start.elapsed();
        if elapsed > timeout {
            return Err(on_timeout(elapsed));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Sleep for `duration` in slices of at most `slice`, returning early with
/// `Cancelled` once `cancelled` reports true
pub async fn sleep_cancellable(
    duration: Duration,
    slice: Duration,
    cancelled: &(dyn Fn() -> bool + Send + Sync),
) -> WaitOutcome {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled() {
            return WaitOutcome::Cancelled;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return WaitOutcome::Done;
        }
        tokio::time::sleep(remaining.min(slice)).await;
    }
}

/// A cancellation check that never fires
pub fn never_cancelled() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_until_done() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let outcome: Result<_, String> = poll_until(
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            &never_cancelled,
            Duration::from_secs(1),
            Duration::from_millis(1),
            |_| "timeout".to_string(),
        )
        .await;
        assert_eq!(outcome.unwrap(), WaitOutcome::Done);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_timeout() {
        let outcome = poll_until(
            || async { Ok::<_, String>(false) },
            &never_cancelled,
            Duration::from_millis(20),
            Duration::from_millis(5),
            |elapsed| format!("gave up after {:?}", elapsed),
        )
        .await;
        assert!(outcome.unwrap_err().starts_with("gave up"));
    }

    #[tokio::test]
    async fn test_poll_until_cancelled() {
        let flag = AtomicBool::new(true);
        let cancelled = move || flag.load(Ordering::SeqCst);
        let outcome = poll_until(
            || async { Ok::<_, String>(false) },
            &cancelled,
            Duration::from_secs(5),
            Duration::from_millis(5),
            |_| "timeout".to_string(),
        )
        .await;
        assert_eq!(outcome.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_sleep_cancellable_runs_to_completion() {
        let start = Instant::now();
        let outcome = sleep_cancellable(
            Duration::from_millis(30),
            Duration::from_millis(10),
            &never_cancelled,
        )
        .await;
        assert!(outcome.is_done());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
