//! Error types for the coordination and polling engine

use thiserror::Error;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream {0} does not exist")]
    StreamNotFound(String),

    #[error("Coordination store error: {0}")]
    Kv(#[from] KvError),

    #[error("Stream service error: {0}")]
    Stream(#[from] StreamClientError),

    #[error("Failed to get iterator for shard {shard_id}: {message}")]
    GetIteratorFailed { shard_id: String, message: String },

    #[error("Failed to decode records: {0}")]
    Decode(String),

    #[error("Lease for shard {0} is no longer held")]
    LeaseLost(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    /// Fatal errors park the shard poller; everything else is retried in place.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConsumerError::Config(_) | ConsumerError::Decode(_) => true,
            ConsumerError::Kv(e) => {
                !e.is_retriable() && !matches!(e, KvError::PreconditionFailed)
            }
            ConsumerError::Stream(e) => {
                !e.is_retriable() && !matches!(e, StreamClientError::ExpiredIterator)
            }
            _ => false,
        }
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error type for the coordination KV store
#[derive(Debug, Error)]
pub enum KvError {
    /// A conditional write lost the race. Never retried automatically: the
    /// caller decides what "someone else won" means for its operation.
    #[error("Conditional check failed")]
    PreconditionFailed,

    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// The table is being created or deleted, possibly by a peer
    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    #[error("Request validation failed: {0}")]
    Validation(String),

    #[error("Throughput exceeded: {0}")]
    Throttled(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed document: {0}")]
    Corrupt(String),

    #[error("Timed out waiting for table state: {0}")]
    WaitTimeout(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl KvError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, KvError::Throttled(_) | KvError::Connection(_))
    }
}

/// Error type for the stream-service client
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("Shard iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    #[error("Operation not supported by endpoint: {0}")]
    UnknownOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out waiting for stream state: {0}")]
    WaitTimeout(String),

    #[error("Stream service error: {0}")]
    Other(String),
}

impl StreamClientError {
    /// Retry-eligible per the service contract: throughput and
    /// connection-level failures. Everything else terminates retries.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StreamClientError::ThroughputExceeded
                | StreamClientError::Timeout(_)
                | StreamClientError::Connection(_)
        )
    }

    /// Maps a service error code to the taxonomy. Connection-level failure
    /// codes surface here when the transport reports them as service errors.
    pub(crate) fn from_code(code: &str, message: String) -> Self {
        match code {
            "ExpiredIteratorException" => StreamClientError::ExpiredIterator,
            "ProvisionedThroughputExceededException" | "LimitExceededException" => {
                StreamClientError::ThroughputExceeded
            }
            "ResourceNotFoundException" => StreamClientError::ResourceNotFound(message),
            "ResourceInUseException" => StreamClientError::ResourceInUse(message),
            "UnknownOperationException" => StreamClientError::UnknownOperation(message),
            "InvalidArgumentException" | "ValidationException" => {
                StreamClientError::InvalidArgument(message)
            }
            "AccessDeniedException" => StreamClientError::AccessDenied(message),
            "EADDRINUSE" | "ECONNREFUSED" | "ECONNRESET" | "EPIPE" | "NetworkingError" => {
                StreamClientError::Connection(message)
            }
            "ESOCKETTIMEDOUT" | "ETIMEDOUT" | "TimeoutError" => {
                StreamClientError::Timeout(message)
            }
            _ => StreamClientError::Other(format!("{}: {}", code, message)),
        }
    }
}
