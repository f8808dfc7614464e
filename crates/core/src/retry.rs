//! Bounded exponential backoff.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(10),
            cap: Duration::from_secs(1),
        }
    }
}

impl Retry {
    /// Delay before attempt `attempt + 1` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Runs `op` until it succeeds, fails with an error `transient` rejects,
    /// or the attempts are exhausted. The last error is returned.
    pub fn run<T, E>(
        &self,
        what: &str,
        mut op: impl FnMut() -> std::result::Result<T, E>,
        transient: impl Fn(&E) -> bool,
    ) -> std::result::Result<T, E>
    where
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.attempts.max(1) && transient(&e) => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// [`Retry::run`] for crate results, retrying every error.
    pub fn run_all<T>(&self, what: &str, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.run(what, op, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InfinityError;

    fn quick(attempts: u32) -> Retry {
        Retry {
            attempts,
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let retry = quick(10);
        assert_eq!(retry.delay(0), Duration::from_millis(1));
        assert_eq!(retry.delay(1), Duration::from_millis(2));
        assert_eq!(retry.delay(5), Duration::from_millis(4));
        assert_eq!(retry.delay(40), Duration::from_millis(4));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = quick(3).run_all("flaky", || {
            calls += 1;
            if calls < 3 {
                Err(InfinityError::Storage("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_the_last_attempt() {
        let mut calls = 0;
        let result: Result<()> = quick(2).run_all("broken", || {
            calls += 1;
            Err(InfinityError::Storage("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = quick(5).run(
            "fatal",
            || {
                calls += 1;
                Err(InfinityError::Fatal("nothing removed".into()))
            },
            |e| !matches!(e, InfinityError::Fatal(_)),
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
