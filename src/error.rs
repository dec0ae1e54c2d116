use thiserror::Error;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the gateway core.
///
/// Variants are semantic kinds, not transport codes: the HTTP layer maps
/// them onto status codes, the core only decides which kind applies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("unavailable: {0}")]
    Unavailable(#[from] UnavailableError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// Malformed input. Never retried.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid session name {name:?}: {reason}")]
    SessionName { name: String, reason: &'static str },

    #[error("invalid recipient address {0:?}")]
    Recipient(String),

    #[error("invalid proxy configuration: {0}")]
    Proxy(String),

    #[error("invalid payload: {0}")]
    Payload(String),
}

/// A named resource does not exist.
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("session {0:?} not found")]
    Session(String),
}

/// The operation contradicts the session's current state.
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("session {0:?} already exists")]
    AlreadyExists(String),

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session is already logged in")]
    AlreadyLoggedIn,

    #[error("session is not logged in")]
    NotLoggedIn,

    #[error("session is not connected")]
    NotConnected,
}

/// Transient failures from the protocol layer. Recorded on the session
/// record's connection-error field; the protocol client does its own
/// retries, the core does not.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("qr channel failed: {0}")]
    QrChannel(String),

    #[error("logout failed: {0}")]
    Logout(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("proxy update failed: {0}")]
    Proxy(String),
}

/// A resource that exists in principle is momentarily absent.
#[derive(Error, Debug)]
pub enum UnavailableError {
    #[error("no qr code available")]
    NoQrAvailable,

    #[error("qr code expired")]
    QrExpired,
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("database: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(StoreError::from(e))
    }
}
