//! Check bookkeeping and retry with backoff

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Counters of one run of the check suite, passed to every check
#[derive(Debug, Default)]
pub struct TestRun {
    started: usize,
    failures: Vec<(String, String)>,
}

impl TestRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one named check and record its outcome
    pub async fn check<F, Fut>(&mut self, name: &str, check: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let n = self.started;
        self.started += 1;
        info!("Check #{} - {}", n, name);

        let start = Instant::now();
        match check().await {
            Ok(()) => info!("Check #{} passed in {:?}", n, start.elapsed()),
            Err(e) => {
                error!("Check #{} failed: {:#}", n, e);
                self.failures.push((name.to_string(), format!("{:#}", e)));
            }
        }
    }

    pub fn passed(&self) -> usize {
        self.started - self.failures.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[(String, String)] {
        &self.failures
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Call `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `max_attempts` calls were made. The delay before each retry
/// starts at `initial_delay` and is multiplied by `backoff_factor`.
pub async fn retry<T, E, F, Fut, R>(
    mut operation: F,
    max_attempts: usize,
    initial_delay: Duration,
    backoff_factor: f64,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                warn!("{}, retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(backoff_factor.max(1.0));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = retry(
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(format!("attempt {}", n))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            Duration::from_millis(1),
            2.0,
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry(
            || {
                calls.set(calls.get() + 1);
                async { Err("down".to_string()) }
            },
            3,
            Duration::from_millis(1),
            1.5,
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);

        // a permanent error is returned at once
        calls.set(0);
        let result: Result<(), String> = retry(
            || {
                calls.set(calls.get() + 1);
                async { Err("fatal".to_string()) }
            },
            3,
            Duration::from_millis(1),
            2.0,
            |e| e != "fatal",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_run_counts() {
        let mut run = TestRun::new();
        run.check("ok", || async { Ok(()) }).await;
        run.check("broken", || async { Err(anyhow!("mismatch")) }).await;
        run.check("ok again", || async { Ok(()) }).await;

        assert_eq!(run.passed(), 2);
        assert_eq!(run.failed(), 1);
        assert!(!run.is_success());
        assert_eq!(run.failures()[0], ("broken".to_string(), "mismatch".to_string()));
    }
}
