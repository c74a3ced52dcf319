//! Failure isolation for remote I/O.

pub mod breaker_registry;
pub mod circuit_breaker;

pub use breaker_registry::CircuitBreakerRegistry;
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerError};
