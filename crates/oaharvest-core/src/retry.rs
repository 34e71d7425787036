//! Retry with capped exponential backoff

use std::time::Duration;

use indicatif::ProgressBar;

/// Errors that can report whether another attempt is worthwhile.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff: 2^attempt seconds, capped at `max_backoff`.
pub fn backoff_duration(attempt: u32, max_backoff: Duration) -> Duration {
    let exp = Duration::from_secs(2u64.saturating_pow(attempt));
    exp.min(max_backoff)
}

/// Retry a fallible operation with exponential backoff.
///
/// On retryable errors, logs the failure, updates the progress bar, sleeps,
/// and retries up to `max_retries`. Returns `Ok(T)` on first success, or the
/// final `Err` on exhaustion / non-retryable error.
pub fn retry_with_backoff<T, E: Retryable + std::fmt::Display>(
    label: &str,
    max_retries: u32,
    max_backoff: Duration,
    pb: &ProgressBar,
    mut attempt_fn: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                attempt += 1;
                pb.set_message(format!("retry {attempt}/{max_retries}..."));
                log::debug!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                std::thread::sleep(backoff_duration(attempt, max_backoff));
            }
            Err(e) => {
                log::debug!("{label}: failed permanently: {e}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(bool);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn backoff_exponential() {
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_duration(1, cap), Duration::from_secs(2));
        assert_eq!(backoff_duration(2, cap), Duration::from_secs(4));
        assert_eq!(backoff_duration(3, cap), Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped() {
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_duration(5, cap), cap);
        assert_eq!(backoff_duration(30, cap), cap);
    }

    #[test]
    fn succeeds_first_try() {
        let pb = ProgressBar::hidden();
        let result: Result<i32, TestError> =
            retry_with_backoff("t", 3, Duration::from_millis(1), &pb, || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn non_retryable_fails_immediately() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result: Result<i32, TestError> =
            retry_with_backoff("t", 3, Duration::from_millis(1), &pb, || {
                calls += 1;
                Err(TestError(false))
            });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retryable_exhausts_attempts() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result: Result<i32, TestError> =
            retry_with_backoff("t", 2, Duration::from_millis(1), &pb, || {
                calls += 1;
                Err(TestError(true))
            });
        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(calls, 3);
    }

    #[test]
    fn recovers_after_transient_failure() {
        let pb = ProgressBar::hidden();
        let mut calls = 0;
        let result: Result<i32, TestError> =
            retry_with_backoff("t", 3, Duration::from_millis(1), &pb, || {
                calls += 1;
                if calls < 2 { Err(TestError(true)) } else { Ok(7) }
            });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
