//! Retry and circuit breaking around unreliable operations.
//!
//! The breaker wraps the retry loop: every attempt is checked against and counted by
//! the breaker, and an open circuit fails before any attempt is made.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{ErrorKind, IsolationError, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Only these kinds are retried; everything else propagates immediately.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retry_on: vec![
                ErrorKind::Timeout,
                ErrorKind::Connection,
                ErrorKind::Io,
                ErrorKind::Detection,
                ErrorKind::BackgroundRemoval,
            ],
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, err: &IsolationError) -> bool {
        self.retry_on.contains(&err.kind())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Circuit {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure breakers keyed by circuit name.
pub struct CircuitBreakers {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, name: &str) -> CircuitState {
        let circuits = self.circuits.lock();
        match circuits.get(name).and_then(|c| c.opened_at) {
            None => CircuitState::Closed,
            Some(opened_at) if opened_at.elapsed() < self.config.recovery_timeout => {
                CircuitState::Open
            }
            Some(_) => CircuitState::HalfOpen,
        }
    }

    pub fn reset(&self, name: &str) {
        self.circuits.lock().remove(name);
    }

    /// Admits one attempt, or fails fast while the circuit is open.
    ///
    /// The returned guard releases a half-open trial slot if the attempt never reports back.
    fn admit<'a>(&'a self, name: &'a str) -> Result<TrialGuard<'a>> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_string()).or_default();

        let Some(opened_at) = circuit.opened_at else {
            return Ok(TrialGuard {
                breakers: self,
                name,
                armed: false,
            });
        };

        let elapsed = opened_at.elapsed();
        if elapsed < self.config.recovery_timeout {
            return Err(IsolationError::CircuitOpen {
                circuit: name.to_string(),
                retry_after: self.config.recovery_timeout - elapsed,
            });
        }

        // half-open: exactly one trial call at a time
        if circuit.trial_in_flight {
            return Err(IsolationError::CircuitOpen {
                circuit: name.to_string(),
                retry_after: Duration::ZERO,
            });
        }
        circuit.trial_in_flight = true;
        debug!(circuit = name, "circuit half-open, admitting trial call");
        Ok(TrialGuard {
            breakers: self,
            name,
            armed: true,
        })
    }

    fn release_trial(&self, name: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(name) {
            if circuit.trial_in_flight {
                circuit.trial_in_flight = false;
                warn!(circuit = name, "trial call abandoned without a result");
            }
        }
    }

    fn record_success(&self, name: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(name) {
            if circuit.opened_at.is_some() {
                debug!(circuit = name, "circuit closed");
            }
            *circuit = Circuit::default();
        }
    }

    pub fn record_failure(&self, name: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_string()).or_default();
        circuit.consecutive_failures += 1;

        if circuit.trial_in_flight {
            circuit.trial_in_flight = false;
            circuit.opened_at = Some(Instant::now());
            warn!(circuit = name, "trial call failed, circuit re-opened");
        } else if circuit.opened_at.is_none()
            && circuit.consecutive_failures >= self.config.failure_threshold
        {
            circuit.opened_at = Some(Instant::now());
            warn!(
                circuit = name,
                failures = circuit.consecutive_failures,
                "circuit opened"
            );
        }
    }
}

struct TrialGuard<'a> {
    breakers: &'a CircuitBreakers,
    name: &'a str,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breakers.release_trial(self.name);
        }
    }
}

/// Runs `op` under the named circuit with bounded, exponentially backed-off retries.
pub fn with_resilience<T, F>(
    circuit: &str,
    mut op: F,
    retry: &RetryConfig,
    breakers: &CircuitBreakers,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        let trial = breakers.admit(circuit)?;
        let outcome = op();
        trial.disarm();

        match outcome {
            Ok(value) => {
                breakers.record_success(circuit);
                return Ok(value);
            }
            Err(e) => {
                breakers.record_failure(circuit);
                if attempt >= retry.max_retries || !retry.should_retry(&e) {
                    return Err(e);
                }

                let delay = retry.delay_for(attempt);
                attempt += 1;
                warn!(circuit, attempt, ?delay, error = %e, "operation failed, retrying");
                thread::sleep(delay);
            }
        }
    }
}

/// Retry policy plus the breakers it reports to.
pub struct ResiliencePolicy {
    retry: RetryConfig,
    breakers: CircuitBreakers,
}

impl ResiliencePolicy {
    pub fn new(retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            retry,
            breakers: CircuitBreakers::new(breaker),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn call<T, F>(&self, circuit: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        with_resilience(circuit, op, &self.retry, &self.breakers)
    }

    /// Same breakers, different retry allow-list.
    pub fn call_with<T, F>(&self, circuit: &str, retry: &RetryConfig, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        with_resilience(circuit, op, retry, &self.breakers)
    }

    /// Like [`call`](Self::call), but exhausted retries of a recognised kind, or an open
    /// circuit, are replaced by `fallback`'s value.
    pub fn call_with_fallback<T, F, G>(&self, circuit: &str, op: F, fallback: G) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        G: FnOnce(&IsolationError) -> T,
    {
        match self.call(circuit, op) {
            Ok(value) => Ok(value),
            Err(e) if self.retry.should_retry(&e) || e.kind() == ErrorKind::CircuitOpen => {
                warn!(circuit, error = %e, "falling back");
                Ok(fallback(&e))
            }
            Err(e) => Err(e),
        }
    }

    pub fn circuit_state(&self, circuit: &str) -> CircuitState {
        self.breakers.state(circuit)
    }

    /// Counts a failure observed outside [`call`](Self::call), e.g. a caller-side timeout.
    pub fn record_failure(&self, circuit: &str) {
        self.breakers.record_failure(circuit)
    }

    pub fn reset(&self, circuit: &str) {
        self.breakers.reset(circuit)
    }
}
