//! Harness for the reconciler's periodic loops.
//!
//! Each named loop runs its operation on a minimum interval, breaks the
//! circuit after a run of consecutive failures, and exposes a
//! `force_update` trigger that wakes the loop immediately. `tokio::sync::
//! Notify` holds at most one stored permit, which debounces bursts of
//! triggers into a single extra run.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Consecutive-failure breaker with a timed reset.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    /// Open means runs are skipped. The breaker half-closes once the reset
    /// timeout has elapsed: the next run is allowed through.
    pub fn is_open(&mut self) -> bool {
        match self.opened_at {
            None => false,
            Some(at) => {
                if at.elapsed() >= self.reset_timeout {
                    self.opened_at = None;
                    self.consecutive_failures = 0;
                    false
                } else {
                    true
                }
            }
        }
    }
}

/// Static configuration of one loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub name: String,
    pub min_interval: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            name: name.into(),
            min_interval,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Handle to a spawned loop.
pub struct LoopHandle {
    pub name: String,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl LoopHandle {
    /// Wake the loop now; bursts collapse into one extra run.
    pub fn force_update(&self) {
        self.notify.notify_one();
    }

    /// Stop the loop and wait for it to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn a named loop running `op` forever.
pub fn spawn_loop<F, Fut>(config: LoopConfig, mut op: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send,
{
    let notify = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let loop_notify = Arc::clone(&notify);
    let loop_cancel = cancel.clone();
    let name = config.name.clone();

    let join = tokio::spawn(async move {
        let mut breaker = CircuitBreaker::new(config.failure_threshold, config.reset_timeout);
        loop {
            if breaker.is_open() {
                tracing::warn!(loop_name = %config.name, "circuit open, skipping run");
            } else {
                match op().await {
                    Ok(()) => breaker.on_success(),
                    Err(e) => {
                        tracing::warn!(loop_name = %config.name, error = %e, "loop run failed");
                        breaker.on_failure();
                    }
                }
            }

            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                _ = tokio::time::sleep(config.min_interval) => {}
                _ = loop_notify.notified() => {
                    tracing::debug!(loop_name = %config.name, "woken by force_update");
                }
            }
        }
        tracing::debug!(loop_name = %config.name, "loop stopped");
    });

    LoopHandle {
        name,
        notify,
        cancel,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.is_open());
        breaker.on_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_breaker_success_resets() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_breaker_recloses_after_reset_timeout() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.on_failure();
        // Zero reset timeout: open, then immediately allowed again.
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_loop_runs_and_force_update_wakes() {
        let count = Arc::new(AtomicU32::new(0));
        let loop_count = Arc::clone(&count);
        let handle = spawn_loop(
            LoopConfig::new("test", Duration::from_secs(3600)),
            move || {
                let c = Arc::clone(&loop_count);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        // First run happens on spawn.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Force a second run long before the interval elapses.
        handle.force_update();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_loop_breaker_skips_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let loop_count = Arc::clone(&count);
        let config = LoopConfig {
            name: "failing".to_string(),
            min_interval: Duration::from_secs(3600),
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(3600),
        };
        let handle = spawn_loop(config, move || {
            let c = Arc::clone(&loop_count);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom"))
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Breaker is open: the forced wake skips the operation.
        handle.force_update();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }
}
