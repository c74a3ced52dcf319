use super::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Process-wide map from operation name to its breaker.
///
/// The lock only covers the lookup; the breakers themselves are atomic.
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    reset_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.failure_threshold,
                    self.reset_timeout,
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Breaker name for commands sent to `host`.
pub fn exec_breaker_name(host: &str) -> String {
    format!("exec:{}", host)
}

/// Breaker name for file I/O against `host`.
pub fn transfer_breaker_name(host: &str) -> String {
    format!("sftp:{}", host)
}
