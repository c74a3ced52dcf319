//! Lock-free circuit breaker.
//!
//! A breaker guards one named operation (for example every command sent to one host). State,
//! failure count and the time of the last transition are plain atomics, so callers share a
//! breaker through an `Arc` without any external locking.

use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Result of a guarded call: either the breaker refused it, or the operation ran and failed.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    Open(String),
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open(name) => write!(f, "Circuit breaker '{}' is open", name),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Point-in-time view of a breaker, reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub millis_since_state_change: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: AtomicU8,
    failures: AtomicU32,
    // Milliseconds since `epoch`.
    last_state_change: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            last_state_change: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.failure_count(),
            millis_since_state_change: self
                .now_millis()
                .saturating_sub(self.last_state_change.load(Ordering::Acquire)),
        }
    }

    /// Runs a blocking operation through the breaker.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let trial = TrialGuard::arm(self, self.acquire::<E>()?);
        let outcome = op();
        trial.disarm();
        self.record(outcome)
    }

    /// Async counterpart of [`CircuitBreaker::call`]; the future is only created when the
    /// breaker lets the call through.
    ///
    /// A half-open trial whose future is dropped before it completes (a caller timeout or a
    /// cancelled request) counts as a failed trial, so the breaker never stays half-open.
    pub async fn call_async<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = TrialGuard::arm(self, self.acquire::<E>()?);
        let outcome = op().await;
        trial.disarm();
        self.record(outcome)
    }

    fn record<T, E>(&self, outcome: Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        match outcome {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Admits or rejects one call. OPEN moves to HALF_OPEN here, lazily, and only the caller
    /// that wins that transition runs the trial; `Ok(true)` marks that caller.
    fn acquire<E>(&self) -> Result<bool, CircuitBreakerError<E>> {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return Ok(false),
                OPEN => {
                    let since = self
                        .now_millis()
                        .saturating_sub(self.last_state_change.load(Ordering::Acquire));
                    if since < self.reset_timeout.as_millis() as u64 {
                        debug!("Circuit breaker '{}' rejected a call", self.name);
                        return Err(CircuitBreakerError::Open(self.name.clone()));
                    }
                    if self.transition(OPEN, HALF_OPEN) {
                        return Ok(true);
                    }
                    // Lost the race, look at the new state.
                }
                _ => return Err(CircuitBreakerError::Open(self.name.clone())),
            }
        }
    }

    fn on_success(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                self.failures.store(0, Ordering::Release);
                self.transition(HALF_OPEN, CLOSED);
            }
            CLOSED => self.failures.store(0, Ordering::Release),
            _ => {}
        }
    }

    fn on_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                if self.transition(HALF_OPEN, OPEN) {
                    warn!("Circuit breaker '{}' trial call failed", self.name);
                }
            }
            CLOSED => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold && self.transition(CLOSED, OPEN) {
                    warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, failures
                    );
                }
            }
            _ => {}
        }
    }

    fn on_abandoned_trial(&self) {
        if self.transition(HALF_OPEN, OPEN) {
            warn!(
                "Circuit breaker '{}' trial call was abandoned before completing",
                self.name
            );
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        let swapped = self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.last_state_change
                .store(self.now_millis(), Ordering::Release);
            info!(
                "Circuit breaker '{}' {} -> {}",
                self.name,
                BreakerState::from_raw(from),
                BreakerState::from_raw(to)
            );
        }
        swapped
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Reopens the breaker if the half-open trial it watches never reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn arm(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            armed: trial,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_abandoned_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn failing(calls: &AtomicUsize) -> Result<(), &'static str> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("boom")
    }

    #[test]
    fn test_opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("exec:db01", 3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(
                breaker.call(|| failing(&calls)),
                Err(CircuitBreakerError::Inner("boom"))
            ));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let fourth = breaker.call(|| failing(&calls));
        assert!(matches!(fourth, Err(CircuitBreakerError::Open(name)) if name == "exec:db01"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_success_in_closed_resets_counter() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| failing(&calls));
        let _ = breaker.call(|| failing(&calls));
        assert_eq!(breaker.failure_count(), 2);

        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(breaker.failure_count(), 0);

        let _ = breaker.call(|| failing(&calls));
        let _ = breaker.call(|| failing(&calls));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_millis(30));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = breaker.call(|| failing(&calls));
        }
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.call(|| Ok::<_, &str>(7)).ok(), Some(7));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_millis(50));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = breaker.call(|| failing(&calls));
        }
        std::thread::sleep(Duration::from_millis(80));

        assert!(matches!(
            breaker.call(|| failing(&calls)),
            Err(CircuitBreakerError::Inner(_))
        ));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // The timer restarted, so an immediate call is refused again.
        assert!(matches!(
            breaker.call(|| failing(&calls)),
            Err(CircuitBreakerError::Open(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_only_one_trial_in_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("op", 1, Duration::from_millis(20)));
        let _ = breaker.call(|| Err::<(), _>("down"));
        std::thread::sleep(Duration::from_millis(40));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            std::thread::spawn(move || {
                breaker.call(|| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok::<_, &str>(())
                })
            })
        };
        entered_rx.recv().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(matches!(
            breaker.call(|| Ok::<_, &str>(())),
            Err(CircuitBreakerError::Open(_))
        ));

        release_tx.send(()).unwrap();
        assert!(trial.join().unwrap().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_async_call_is_not_started_when_open() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_secs(60));
        let _ = breaker.call_async(|| async { Err::<(), _>("down") }).await;

        let started = AtomicUsize::new(0);
        let result = breaker
            .call_async(|| {
                started.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_dropped_trial_reopens_breaker() {
        let breaker = CircuitBreaker::new("exec:db01", 1, Duration::from_millis(20));
        let _ = breaker.call_async(|| async { Err::<(), _>("down") }).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call_async(|| std::future::pending::<Result<(), &str>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // Refused until the restarted timer elapses, then a new trial is admitted.
        assert!(matches!(
            breaker.call_async(|| async { Ok::<_, &str>(()) }).await,
            Err(CircuitBreakerError::Open(_))
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.call_async(|| async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_panicking_trial_reopens_breaker() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(20));
        let _ = breaker.call(|| Err::<(), _>("down"));
        std::thread::sleep(Duration::from_millis(40));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            breaker.call(|| -> Result<(), &'static str> { panic!("trial crashed") })
        }));
        assert!(outcome.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
