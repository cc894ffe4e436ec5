//! Circuit breaker guarding the remote endpoint so a dead upstream is not
//! hammered by the head poller and the startup probes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);

/// Represents the current state of the RPC circuit breaker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of breaker internals for observability.
#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

/// Error returned when the breaker refuses to allow an RPC attempt.
#[derive(Debug)]
pub enum CircuitBreakerError {
    CircuitOpen { retry_in: Duration },
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen { retry_in } => write!(
                f,
                "RPC circuit breaker is open (next probe in {}ms)",
                retry_in.as_millis()
            ),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Closed/Open/Half-Open breaker. While half-open a single probe request is
/// admitted; its outcome decides whether the circuit closes or re-opens.
#[derive(Debug, Clone)]
pub struct RpcCircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl RpcCircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        let cooldown = if cooldown.is_zero() {
            Duration::from_millis(1)
        } else {
            cooldown
        };

        Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let guard = self.lock();
        CircuitBreakerSnapshot {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            opened_at: guard.opened_at,
        }
    }

    /// Checks whether a new RPC attempt is allowed, reserving the half-open
    /// probe slot when the cooldown has elapsed.
    pub fn before_request(&self) -> Result<CircuitState, CircuitBreakerError> {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or_default();
                if elapsed < self.cooldown {
                    return Err(CircuitBreakerError::CircuitOpen {
                        retry_in: self.cooldown - elapsed,
                    });
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.probe_in_flight = true;
                Ok(CircuitState::HalfOpen)
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    return Err(CircuitBreakerError::CircuitOpen {
                        retry_in: Duration::ZERO,
                    });
                }
                state.probe_in_flight = true;
                Ok(CircuitState::HalfOpen)
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.probe_in_flight = false;
        state.consecutive_failures = 0;
        state.opened_at = None;
        self.transition(&mut state, CircuitState::Closed);
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.probe_in_flight = false;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let trip = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            state.opened_at = Some(Instant::now());
            self.transition(&mut state, CircuitState::Open);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // The guarded state is plain data; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: &mut BreakerState, next: CircuitState) {
        if state.state != next {
            tracing::warn!(
                previous = ?state.state,
                next = ?next,
                consecutive_failures = state.consecutive_failures,
                "rpc circuit breaker state changed"
            );
            state.state = next;
        }
    }
}
