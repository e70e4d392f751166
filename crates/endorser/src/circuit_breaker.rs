//! Circuit breaker for cross-peer control-plane calls.
//!
//! Three states:
//!
//! ```text
//! ┌────────┐  threshold failures  ┌──────┐  open_timeout   ┌───────────┐
//! │ Closed ├─────────────────────►│ Open ├────────────────►│ Half-Open │
//! └────┬───┘                      └──────┘                 └─────┬─────┘
//!      │                             ▲                           │
//!      │                             │ probe failure             │ probe success
//!      │                             └───────────────────────────┤
//!      │◄────────────────────────────────────────────────────────┘
//! ```
//!
//! While the circuit is open, calls fail fast with [`CircuitOpen`] and no
//! network I/O happens. After `open_timeout`, exactly one caller is handed
//! the half-open probe; concurrent callers keep failing fast until the
//! probe resolves.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use snafu::Snafu;
use tessera_types::BreakerSettings;

/// Rejection raised while the circuit is open (or a probe is in flight).
#[derive(Debug, Clone, Snafu)]
#[snafu(display("circuit breaker is open (retry after {retry_after:?})"))]
pub struct CircuitOpen {
    /// Time until the next probe may run.
    pub retry_after: Duration,
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Tripped, calls are rejected without executing.
    Open,
    /// One probe call is in flight to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Three-state failure gate around an unreliable operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given settings.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
            settings,
        }
    }

    /// The breaker settings.
    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, with the implicit open→half-open transition applied
    /// only by [`check`](Self::check) so that the probe permit is handed
    /// out exactly once.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Asks permission to execute the operation.
    ///
    /// In the open state, the first caller after `open_timeout` wins the
    /// half-open probe; every other caller gets [`CircuitOpen`]. State
    /// transitions happen under one lock, so two calls can never both hold
    /// the probe.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                // A probe is already in flight.
                Err(CircuitOpen { retry_after: self.settings.retry_interval })
            },
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.settings.open_timeout);
                if elapsed >= self.settings.open_timeout {
                    let previous = inner.state;
                    inner.state = CircuitState::HalfOpen;
                    tracing::warn!(from = %previous, to = %inner.state, "circuit breaker probing");
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_after: self.settings.open_timeout - elapsed,
                    })
                }
            },
        }
    }

    /// Records a successful call: the circuit closes and counters reset.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::warn!(from = %inner.state, to = %CircuitState::Closed, "circuit breaker recovered");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
    }

    /// Records a failed call.
    ///
    /// A failed half-open probe reopens immediately; in the closed state
    /// the circuit opens once `threshold` consecutive failures accumulate.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                tracing::warn!("circuit breaker probe failed, reopening");
            },
            CircuitState::Closed if inner.failures >= self.settings.threshold => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                tracing::warn!(
                    failures = inner.failures,
                    threshold = self.settings.threshold,
                    "circuit breaker opened"
                );
            },
            CircuitState::Open => {
                inner.last_failure = Some(Instant::now());
            },
            CircuitState::Closed => {},
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// Returns `Err(CircuitOpen)` without executing when the circuit
    /// rejects the call; otherwise executes and records the outcome,
    /// passing the operation's own result through.
    pub async fn execute<T, E, Fut>(
        &self,
        operation: impl FnOnce() -> Fut,
    ) -> Result<Result<T, E>, CircuitOpen>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.check()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn settings(threshold: u32, open_timeout: Duration) -> BreakerSettings {
        BreakerSettings::builder()
            .threshold(threshold)
            .open_timeout(open_timeout)
            .max_retries(3)
            .retry_interval(Duration::from_millis(5))
            .build()
    }

    #[test]
    fn test_starts_closed_and_allows_calls() {
        let breaker = CircuitBreaker::new(settings(3, Duration::from_millis(50)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(settings(3, Duration::from_millis(50)));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.check().unwrap_err();
        assert!(err.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_open_blocks_until_timeout_then_probes() {
        let breaker = CircuitBreaker::new(settings(1, Duration::from_millis(20)));
        breaker.record_failure();
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(30));

        // First caller wins the probe; a concurrent caller is rejected.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(settings(1, Duration::from_millis(10)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.check().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(settings(1, Duration::from_millis(10)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(settings(3, Duration::from_millis(50)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_passes_result_through() {
        let breaker = CircuitBreaker::new(settings(1, Duration::from_millis(50)));

        let ok: Result<Result<u32, String>, _> =
            breaker.execute(|| async { Ok(7u32) }).await;
        assert_eq!(ok.expect("not open").expect("op ok"), 7);

        let err: Result<Result<u32, String>, _> =
            breaker.execute(|| async { Err("boom".to_string()) }).await;
        assert!(err.expect("not open").is_err());

        // That failure tripped the threshold-1 breaker.
        let rejected: Result<Result<u32, String>, _> =
            breaker.execute(|| async { Ok(1u32) }).await;
        assert!(rejected.is_err());
    }
}
