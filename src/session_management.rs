//! Session management core module.
//!
//! Session identity and bookkeeping, the token service that signs session tokens, and the
//! registry owning the live remote sessions of this instance.

/// Live session handle handed to operations.
pub mod active_session;
/// Session key and metadata.
pub mod session;
/// Lifecycle of the sessions owned by this instance.
pub mod session_registry;
/// Signing and validation of session tokens.
pub mod token_service;

pub use active_session::ActiveSession;
pub use session::{SessionKey, SessionMetadata};
pub use session_registry::{RegistrySettings, SessionCredentials, SessionRegistry};
pub use token_service::SessionTokenService;
