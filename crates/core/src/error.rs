use thiserror::Error;

/// Malformed envelope bytes.
#[derive(Error, Debug)]
#[error("Decode error: {0}")]
pub struct DecodeError(pub String);

/// Adapter-level send failure. Callers decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Rejected by transport: {0}")]
    Rejected(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl DeliveryError {
    /// Only connection-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Connection(_))
    }
}

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Message has no routing targets")]
    NoTargets,

    #[error("Malformed routing address: {0}")]
    MalformedAddress(String),

    #[error("No adapter registered for scheme: {0}")]
    UnknownScheme(String),

    #[error("Audit persistence failed: {0}")]
    AuditFailure(#[source] StoreError),

    #[error("Tenant mismatch: router serves {expected}, message belongs to {actual}")]
    TenantMismatch { expected: String, actual: String },
}

/// Command or query dispatched with no registered handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No handler registered for {0}")]
pub struct NoHandlerError(pub String);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    NoHandler(#[from] NoHandlerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
