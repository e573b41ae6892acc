//! Busy-retry wrapper for get/post attempts.
//!
//! When the server is overloaded it answers `503` instead of data.
//! That is not a hard failure: the caller's request is repeated, with a
//! fixed sleep between attempts, until it succeeds, fails for a real
//! reason, or the retry budget runs out.  The loop is synchronous and
//! blocking; there is no cancellation, only the timeout.

use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};

/// HTTP status used by the server to signal "busy, try again".
pub const BUSY_STATUS: u16 = 503;

/// Retry configuration for a single accessor.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total time to spend repeating busy requests before giving up.
    /// Set at or below `retry_interval` to disable retries.
    pub retry_timeout: Duration,
    /// Sleep between attempts.
    pub retry_interval: Duration,
    /// Emit a warning whenever the busy period grows by this much.
    pub warning_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            retry_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
            warning_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it returns anything other than a busy error.
    ///
    /// Non-busy errors propagate immediately and untouched.  Busy
    /// errors are swallowed and retried; once the cumulative elapsed
    /// time reaches `retry_timeout` the loop fails with
    /// [`Error::RetryTimeout`] reporting the attempt count and elapsed
    /// time.
    pub fn run<T, F>(&self, action: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        // Fast path for the first attempt.
        match attempt() {
            Err(Error::Http { status: BUSY_STATUS, .. }) => {}
            other => return other,
        }

        if self.retry_timeout <= self.retry_interval {
            return Err(Error::RetryTimeout {
                attempts: 1,
                elapsed_secs: 0.0,
            });
        }

        let started = Instant::now();
        let mut elapsed = Duration::ZERO;
        let mut last_warning = Duration::ZERO;
        let mut attempts: u32 = 1;

        while elapsed < self.retry_timeout {
            if elapsed - last_warning > self.warning_interval {
                println!(
                    "Warning, server has been busy for {:.1} seconds during \"{}\".  Still retrying...",
                    elapsed.as_secs_f64(),
                    action
                );
                last_warning = elapsed;
            }
            thread::sleep(self.retry_interval);
            attempts += 1;
            match attempt() {
                Err(Error::Http { status: BUSY_STATUS, .. }) => {
                    elapsed = started.elapsed();
                }
                other => return other,
            }
        }

        Err(Error::RetryTimeout {
            attempts,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> Error {
        Error::Http {
            action: "test".to_string(),
            method: "GET",
            path: "/".to_string(),
            status: BUSY_STATUS,
            reason: "Service Unavailable".to_string(),
            response_body: String::new(),
            request_body: String::new(),
        }
    }

    fn not_found() -> Error {
        Error::Http {
            action: "test".to_string(),
            method: "GET",
            path: "/".to_string(),
            status: 404,
            reason: "Not Found".to_string(),
            response_body: String::new(),
            request_body: String::new(),
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            retry_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(20),
            warning_interval: Duration::from_millis(1000),
        }
    }

    #[test]
    fn success_needs_one_attempt() {
        let mut calls = 0;
        let value: i32 = quick_policy()
            .run("op", || {
                calls += 1;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn non_busy_errors_propagate_immediately() {
        let mut calls = 0;
        let err = quick_policy()
            .run::<i32, _>("op", || {
                calls += 1;
                Err(not_found())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 404, .. }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn busy_then_success_retries_once() {
        let mut calls = 0;
        let value: i32 = quick_policy()
            .run("op", || {
                calls += 1;
                if calls == 1 {
                    Err(busy())
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 2);
    }

    #[test]
    fn timeout_at_or_below_interval_disables_retry() {
        let policy = RetryPolicy {
            retry_timeout: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
            warning_interval: Duration::from_millis(1000),
        };
        let mut calls = 0;
        let err = policy
            .run::<i32, _>("op", || {
                calls += 1;
                Err(busy())
            })
            .unwrap_err();
        assert!(matches!(err, Error::RetryTimeout { attempts: 1, .. }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn persistent_busy_exhausts_the_budget() {
        // timeout/interval = 5, so roughly six attempts counting the
        // first; allow one either way for scheduler jitter.
        let mut calls = 0u32;
        let err = quick_policy()
            .run::<i32, _>("op", || {
                calls += 1;
                Err(busy())
            })
            .unwrap_err();
        match err {
            Error::RetryTimeout { attempts, elapsed_secs } => {
                assert_eq!(attempts, calls);
                assert!((5..=7).contains(&attempts), "attempts = {}", attempts);
                assert!(elapsed_secs >= 0.1);
            }
            other => panic!("expected RetryTimeout, got {:?}", other),
        }
    }

    #[test]
    fn busy_then_real_error_stops_the_loop() {
        let mut calls = 0;
        let err = quick_policy()
            .run::<i32, _>("op", || {
                calls += 1;
                if calls < 3 {
                    Err(busy())
                } else {
                    Err(not_found())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 404, .. }));
        assert_eq!(calls, 3);
    }
}
