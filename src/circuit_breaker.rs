//! Circuit Breaker Module
//!
//! Tracks consecutive remote store failures. Once the configured threshold is reached,
//! remote store access is paused for a cooldown window so that an unreachable store is
//! neither hammered with requests nor allowed to flood the logs.
//!
//! ```text
//! Closed(0) -> Closed(n) -> Paused -> Closed(0)
//! ```
//!
//! The cooldown is a deadline checked on access rather than a background timer, so a
//! paused breaker never keeps the process alive.

use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug)]
pub struct CircuitBreaker {
    errors_before_pausing: u32,
    pause_duration: Duration,
    consecutive_errors: u32,
    resume_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(errors_before_pausing: u32, pause_duration: Duration) -> Self {
        Self {
            errors_before_pausing: errors_before_pausing.max(1),
            pause_duration,
            consecutive_errors: 0,
            resume_at: None,
        }
    }

    /// Whether remote store calls are currently suppressed.
    ///
    /// Resumes (and resets the error count) once the cooldown has elapsed.
    pub fn is_paused(&mut self) -> bool {
        match self.resume_at {
            Some(resume_at) if Instant::now() >= resume_at => {
                warn!("Resuming remote store access; attempting to resume normal caching");
                self.resume_at = None;
                self.consecutive_errors = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// A remote call succeeded (including a not-found answer)
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// A remote call failed. Returns true if this failure paused the breaker.
    pub fn record_failure(&mut self) -> bool {
        let already_paused = self.is_paused();
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if already_paused || self.consecutive_errors < self.errors_before_pausing {
            return false;
        }

        warn!(
            "Encountered {} consecutive remote store errors; pausing remote store access for {} minutes",
            self.consecutive_errors,
            self.pause_duration.as_secs_f64() / 60.0
        );
        self.resume_at = Some(Instant::now() + self.pause_duration);
        true
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pauses_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.is_paused());
        assert!(breaker.record_failure());
        assert!(breaker.is_paused());
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_errors(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_paused());
        assert_eq!(breaker.consecutive_errors(), 2);
    }

    #[test]
    fn test_success_while_paused_does_not_resume() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        assert!(breaker.is_paused());
    }

    #[test]
    fn test_zero_threshold_treated_as_one() {
        let mut breaker = CircuitBreaker::new(0, Duration::from_secs(60));
        assert!(breaker.record_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_after_cooldown() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(300));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_paused());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(breaker.is_paused());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breaker.is_paused());
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_while_paused_do_not_extend_pause() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.record_failure());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_paused());
    }
}
