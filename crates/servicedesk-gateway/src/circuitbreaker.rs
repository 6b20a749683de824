//! Circuit breaker guarding one wrapped gateway.
//!
//! # How It Works
//!
//! The breaker has three states:
//!
//! 1. **Closed**: Normal operation. Every request is admitted. Exhausted
//!    requests are counted; reaching `failure_threshold` consecutive ones opens
//!    the circuit.
//! 2. **Open**: Requests are denied until `open_timeout` has elapsed since the
//!    last recorded failure. The next admission check after that moves the
//!    breaker to half-open and admits the caller.
//! 3. **HalfOpen**: Requests are admitted without a probe limit. The first
//!    success closes the circuit; an exhausted request re-opens it.
//!
//! All transitions are compare-and-swap on a single `AtomicU8`, so exactly one
//! caller wins each transition and no lock is held on the dispatch path.
//!
//! # Example
//!
//! ```
//! use servicedesk_gateway::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! if breaker.try_acquire() {
//!     // dispatch ...
//!     breaker.record_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Default number of consecutive exhausted requests required to open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default time the circuit stays open before a probe is admitted.
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 60_000;

/// Represents the state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; requests are allowed through.
    Closed,
    /// Circuit is open; requests are denied.
    Open,
    /// Testing recovery; requests are allowed through.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker, fixed per instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive exhausted requests required to open the circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a probe.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
        }
    }
}

/// A thread-safe circuit breaker implementation using atomic operations.
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` of the last recorded failure.
    last_failure_ms: AtomicU64,
    epoch: Instant,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Admission check run before every dispatch.
    ///
    /// Returns `false` when the circuit is open and `open_timeout` has not yet
    /// elapsed since the last failure.
    pub fn try_acquire(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED | STATE_HALF_OPEN => true,
            STATE_OPEN => {
                let elapsed = self
                    .now_ms()
                    .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if elapsed <= self.config.open_timeout.as_millis() as u64 {
                    return false;
                }
                // A lost race means another caller already moved us out of OPEN.
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    info!(elapsed_ms = elapsed, "circuit breaker moved to HALF_OPEN");
                }
                true
            }
            _ => false,
        }
    }

    /// Records a successful request: clears the failure streak and closes a
    /// half-open circuit.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self
            .state
            .compare_exchange(
                STATE_HALF_OPEN,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!("circuit breaker moved to CLOSED");
        }
    }

    /// Records a request whose retries were exhausted.
    ///
    /// Returns `true` if this call moved the circuit into OPEN.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_ms.store(self.now_ms(), Ordering::Release);

        let tripped = match self.state.load(Ordering::Acquire) {
            STATE_CLOSED if failures >= self.config.failure_threshold => self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            STATE_HALF_OPEN => self
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            _ => false,
        };

        if tripped {
            warn!(failures, "circuit breaker moved to OPEN");
        }
        tripped
    }

    /// Returns the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Manually resets the circuit breaker to closed state.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_failure_ms.store(0, Ordering::Release);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_millis(50),
        })
    }

    #[test]
    fn config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.open_timeout.as_secs(), 60);
    }

    #[tokio::test]
    async fn initial_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn trip_open_counts_one_transition() {
        let breaker = CircuitBreaker::default();
        let transitions = (0..7).filter(|_| breaker.record_failure()).count();

        assert_eq!(transitions, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            assert!(!breaker.record_failure());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn open_to_halfopen_after_timeout() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!breaker.try_acquire(), "must wait strictly longer than open_timeout");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // No probe limit while half-open.
        assert!(breaker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn halfopen_to_closed_on_success() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.try_acquire());

        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn halfopen_to_open_on_failure() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.try_acquire());

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        // last failure was refreshed, so the timeout starts over
        assert!(!breaker.try_acquire());
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let breaker = CircuitBreaker::default();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn reset() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn concurrent_failures_trip_exactly_once() {
        let breaker = std::sync::Arc::new(CircuitBreaker::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let breaker = std::sync::Arc::clone(&breaker);
            handles.push(tokio::spawn(async move { breaker.record_failure() }));
        }

        let mut transitions = 0;
        for handle in handles {
            if handle.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(breaker.consecutive_failures(), 20);
    }
}
