//! Generic circuit breaker, used as the state-machine template for the
//! core's signature cooldown gate and for guarding transport calls.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub window_size: u32,
    pub minimum_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            window_size: 10,
            minimum_requests: 3,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
}

#[derive(Debug)]
struct CircuitBreakerState {
    current_state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt: Option<Instant>,
    consecutive_successes: u32,
    recent_calls: Vec<CallResult>,
}

#[derive(Debug, Clone)]
struct CallResult {
    timestamp: Instant,
    success: bool,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Arc::new(RwLock::new(CircuitBreakerState {
                current_state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt: None,
                consecutive_successes: 0,
                recent_calls: Vec::new(),
            })),
        }
    }

    pub async fn should_allow_call(&self) -> bool {
        let mut state = self.state.write().await;

        let window_start = Instant::now() - Duration::from_secs(300);
        state.recent_calls.retain(|call| call.timestamp > window_start);

        match state.current_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(next_attempt) = state.next_attempt {
                    if Instant::now() >= next_attempt {
                        info!("circuit breaker '{}' transitioning to half-open", self.name);
                        state.current_state = CircuitState::HalfOpen;
                        state.consecutive_successes = 0;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub async fn record_call_result(&self, success: bool) {
        let mut state = self.state.write().await;

        state.recent_calls.push(CallResult {
            timestamp: Instant::now(),
            success,
        });

        if state.recent_calls.len() > self.config.window_size as usize {
            state.recent_calls.drain(0..1);
        }

        match state.current_state {
            CircuitState::Closed => {
                if success {
                    state.success_count += 1;
                    state.consecutive_successes += 1;
                    state.failure_count = 0;
                } else {
                    state.failure_count += 1;
                    state.consecutive_successes = 0;
                    state.last_failure_time = Some(Instant::now());

                    if self.should_open_circuit(&state) {
                        warn!(
                            "circuit breaker '{}' opening after {} failures",
                            self.name, state.failure_count
                        );
                        state.current_state = CircuitState::Open;
                        state.next_attempt = Some(Instant::now() + self.config.timeout);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        info!(
                            "circuit breaker '{}' closing after {} consecutive successes",
                            self.name, state.consecutive_successes
                        );
                        state.current_state = CircuitState::Closed;
                        state.failure_count = 0;
                        state.consecutive_successes = 0;
                    }
                } else {
                    warn!(
                        "circuit breaker '{}' reopening after failure in half-open state",
                        self.name
                    );
                    state.current_state = CircuitState::Open;
                    state.next_attempt = Some(Instant::now() + self.config.timeout);
                    state.consecutive_successes = 0;
                    state.failure_count += 1;
                }
            }
            CircuitState::Open => {
                debug!("recording call result while circuit breaker '{}' is open", self.name);
            }
        }
    }

    fn should_open_circuit(&self, state: &CircuitBreakerState) -> bool {
        if state.recent_calls.len() < self.config.minimum_requests as usize {
            return false;
        }

        let recent_failures = state.recent_calls.iter().filter(|call| !call.success).count();
        let total_recent_calls = state.recent_calls.len();
        let failure_rate = recent_failures as f64 / total_recent_calls as f64;

        let threshold_rate = self.config.failure_threshold as f64 / self.config.window_size as f64;
        failure_rate >= threshold_rate
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.read().await.current_state.clone()
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;

        let recent_calls = &state.recent_calls;
        let total_calls = recent_calls.len();
        let successful_calls = recent_calls.iter().filter(|call| call.success).count();
        let failed_calls = total_calls - successful_calls;

        let success_rate = if total_calls > 0 {
            (successful_calls as f64 / total_calls as f64) * 100.0
        } else {
            100.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            current_state: state.current_state.clone(),
            total_calls: total_calls as u32,
            successful_calls: successful_calls as u32,
            failed_calls: failed_calls as u32,
            success_rate,
            consecutive_successes: state.consecutive_successes,
            last_failure_time: state.last_failure_time,
            next_attempt_time: state.next_attempt,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!("resetting circuit breaker '{}'", self.name);

        state.current_state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.consecutive_successes = 0;
        state.last_failure_time = None;
        state.next_attempt = None;
        state.recent_calls.clear();
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        warn!("forcing circuit breaker '{}' to open state", self.name);

        state.current_state = CircuitState::Open;
        state.next_attempt = Some(Instant::now() + self.config.timeout);
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub current_state: CircuitState,
    pub total_calls: u32,
    pub successful_calls: u32,
    pub failed_calls: u32,
    pub success_rate: f64,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<Instant>,
    pub next_attempt_time: Option<Instant>,
}

pub async fn with_circuit_breaker<F, T, E>(
    circuit_breaker: &CircuitBreaker,
    operation: F,
) -> Result<T, CircuitBreakerError<E>>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    if !circuit_breaker.should_allow_call().await {
        return Err(CircuitBreakerError::CircuitOpen);
    }

    let result = operation.await;

    match &result {
        Ok(_) => circuit_breaker.record_call_result(true).await,
        Err(_) => circuit_breaker.record_call_result(false).await,
    }

    result.map_err(CircuitBreakerError::OperationFailed)
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::CircuitOpen => None,
            CircuitBreakerError::OperationFailed(e) => Some(e),
        }
    }
}
