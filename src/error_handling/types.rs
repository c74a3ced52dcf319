use std::fmt;
use std::time::Duration;

/// Coarse classification shared by every error the proxy surfaces.
///
/// The web layer maps a kind to an HTTP status; callers use it to decide whether a retry can
/// help (`Transient`) or not (`Caller`, `Conflict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong.
    Caller,
    /// Missing, invalid or expired credentials.
    Unauthorized,
    NotFound,
    /// Permanent state conflict, such as a chunk sent to a terminal transfer.
    Conflict,
    /// Remote or I/O failure that may succeed later.
    Transient,
    Internal,
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingSecret,
    WeakSecret(usize),
    BadAddress(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingSecret => write!(f, "Token signing secret is not configured"),
            ConfigError::WeakSecret(len) => write!(
                f,
                "Token signing secret is {} bytes, at least 32 bytes are required",
                len
            ),
            ConfigError::BadAddress(e) => write!(f, "Bind address error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

#[derive(Debug)]
pub enum TokenError {
    KeyInitFailed(String),
    SigningFailed(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::KeyInitFailed(e) => write!(f, "Token signing key unusable: {}", e),
            TokenError::SigningFailed(e) => write!(f, "Token signing failed: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    NotFound,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(e) => write!(f, "Storage connection failed: {}", e),
            StorageError::WriteFailed(e) => write!(f, "Storage write failed: {}", e),
            StorageError::ReadFailed(e) => write!(f, "Storage read failed: {}", e),
            StorageError::NotFound => write!(f, "Record not found"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Failures talking to a remote host, or refused before reaching it.
#[derive(Debug)]
pub enum RemoteError {
    HostKeyRejected { host: String, reason: String },
    ConnectionFailed { host: String, reason: String },
    AuthenticationFailed(String),
    CommandTimeout(Duration),
    RemoteExecution(String),
    ChunkIo(String),
    CircuitOpen(String),
    WorkerUnavailable(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::HostKeyRejected { .. } => ErrorKind::Conflict,
            RemoteError::AuthenticationFailed(_) => ErrorKind::Caller,
            RemoteError::WorkerUnavailable(_) => ErrorKind::Internal,
            _ => ErrorKind::Transient,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::HostKeyRejected { host, reason } => {
                write!(f, "Host key for {} rejected: {}", host, reason)
            }
            RemoteError::ConnectionFailed { host, reason } => {
                write!(f, "Connection to {} failed: {}", host, reason)
            }
            RemoteError::AuthenticationFailed(user) => {
                write!(f, "Authentication failed for user {}", user)
            }
            RemoteError::CommandTimeout(t) => {
                write!(f, "Command timed out after {} ms", t.as_millis())
            }
            RemoteError::RemoteExecution(e) => write!(f, "Remote execution failed: {}", e),
            RemoteError::ChunkIo(e) => write!(f, "Chunk I/O failed: {}", e),
            RemoteError::CircuitOpen(name) => write!(f, "Circuit breaker '{}' is open", name),
            RemoteError::WorkerUnavailable(e) => write!(f, "Remote worker unavailable: {}", e),
        }
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug)]
pub enum SessionError {
    InvalidToken,
    NotFound,
    Expired,
    TokenIssue(TokenError),
    Remote(RemoteError),
    CapacityExhausted(usize),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidToken => ErrorKind::Unauthorized,
            SessionError::NotFound => ErrorKind::NotFound,
            SessionError::Expired => ErrorKind::Unauthorized,
            SessionError::TokenIssue(_) => ErrorKind::Internal,
            SessionError::Remote(e) => e.kind(),
            SessionError::CapacityExhausted(_) => ErrorKind::Transient,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidToken => write!(f, "Session token is invalid"),
            SessionError::NotFound => write!(f, "Session not found"),
            SessionError::Expired => write!(f, "Session expired"),
            SessionError::TokenIssue(e) => write!(f, "Token error: {}", e),
            SessionError::Remote(e) => write!(f, "Remote error: {}", e),
            SessionError::CapacityExhausted(max) => {
                write!(f, "Session limit of {} reached, try again later", max)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RemoteError> for SessionError {
    fn from(e: RemoteError) -> Self {
        SessionError::Remote(e)
    }
}

impl From<TokenError> for SessionError {
    fn from(e: TokenError) -> Self {
        SessionError::TokenIssue(e)
    }
}

#[derive(Debug)]
pub enum TransferError {
    NotFound(String),
    InvalidState { transfer_id: String, status: String },
    InvalidChunk(String),
    InvalidRequest(String),
    ChunkIo(String),
    Remote(RemoteError),
    Storage(StorageError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::InvalidState { .. } => ErrorKind::Conflict,
            TransferError::InvalidChunk(_) | TransferError::InvalidRequest(_) => ErrorKind::Caller,
            TransferError::ChunkIo(_) => ErrorKind::Transient,
            TransferError::Remote(e) => e.kind(),
            TransferError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::NotFound(id) => write!(f, "Transfer {} not found", id),
            TransferError::InvalidState {
                transfer_id,
                status,
            } => write!(
                f,
                "Transfer {} is {} and accepts no further chunk operations",
                transfer_id, status
            ),
            TransferError::InvalidChunk(e) => write!(f, "Invalid chunk: {}", e),
            TransferError::InvalidRequest(e) => write!(f, "Invalid transfer request: {}", e),
            TransferError::ChunkIo(e) => write!(f, "Chunk I/O failed: {}", e),
            TransferError::Remote(e) => write!(f, "Remote error: {}", e),
            TransferError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<RemoteError> for TransferError {
    fn from(e: RemoteError) -> Self {
        TransferError::Remote(e)
    }
}

impl From<StorageError> for TransferError {
    fn from(e: StorageError) -> Self {
        TransferError::Storage(e)
    }
}

/// Error returned by the operations facade that the web interface calls.
#[derive(Debug)]
pub enum ProxyError {
    Session(SessionError),
    Remote(RemoteError),
    Transfer(TransferError),
    Forbidden,
    InvalidRequest(String),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Session(e) => e.kind(),
            ProxyError::Remote(e) => e.kind(),
            ProxyError::Transfer(e) => e.kind(),
            ProxyError::Forbidden => ErrorKind::Unauthorized,
            ProxyError::InvalidRequest(_) => ErrorKind::Caller,
        }
    }

    /// The remote failure underneath, if any. Used to pick between gateway status codes.
    pub fn remote_cause(&self) -> Option<&RemoteError> {
        match self {
            ProxyError::Remote(e)
            | ProxyError::Session(SessionError::Remote(e))
            | ProxyError::Transfer(TransferError::Remote(e)) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Session(e) => write!(f, "{}", e),
            ProxyError::Remote(e) => write!(f, "{}", e),
            ProxyError::Transfer(e) => write!(f, "{}", e),
            ProxyError::Forbidden => write!(f, "Session does not own this resource"),
            ProxyError::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<SessionError> for ProxyError {
    fn from(e: SessionError) -> Self {
        ProxyError::Session(e)
    }
}

impl From<RemoteError> for ProxyError {
    fn from(e: RemoteError) -> Self {
        ProxyError::Remote(e)
    }
}

impl From<TransferError> for ProxyError {
    fn from(e: TransferError) -> Self {
        ProxyError::Transfer(e)
    }
}

#[derive(Debug)]
pub enum WebError {
    ServerStartFailed(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::ServerStartFailed(e) => write!(f, "Web server failed to start: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    Token(TokenError),
    Storage(StorageError),
    Web(WebError),
    Initialization(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Config(e) => write!(f, "Configuration error: {}", e),
            ControllerError::Token(e) => write!(f, "Token service error: {}", e),
            ControllerError::Storage(e) => write!(f, "Storage error: {}", e),
            ControllerError::Web(e) => write!(f, "Web interface error: {}", e),
            ControllerError::Initialization(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(e: ConfigError) -> Self {
        ControllerError::Config(e)
    }
}

impl From<TokenError> for ControllerError {
    fn from(e: TokenError) -> Self {
        ControllerError::Token(e)
    }
}

impl From<StorageError> for ControllerError {
    fn from(e: StorageError) -> Self {
        ControllerError::Storage(e)
    }
}

impl From<WebError> for ControllerError {
    fn from(e: WebError) -> Self {
        ControllerError::Web(e)
    }
}
