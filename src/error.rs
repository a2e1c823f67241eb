use thiserror::Error;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// The call was enqueued but no reply arrived before the deadline.
    ///
    /// Distinct from a transport failure: the broker accepted the call,
    /// the handler side stayed silent.
    #[error("no response: request timed out")]
    Timeout,

    /// No route is registered for the requested service name
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The remote handler ran and reported an application error
    #[error("remote handler error: {0}")]
    Remote(String),

    /// Handler-side application error, returned by user handlers
    #[error("handler error: {0}")]
    Handler(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker or transport failure that should not be retried
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection-class broker failure; the operation may be retried
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// A read referenced a queue or consumer group that does not exist yet
    #[error("missing queue or consumer group: {0}")]
    MissingQueue(String),

    /// Required configuration was not supplied
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Configuration values contradict each other
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// An empty payload was given for a call; empty payloads mark
    /// placeholders and cancellation tombstones on the queue
    #[error("empty payload for service: {0}")]
    EmptyPayload(String),

    /// A fire time that cannot be expressed as unix nanoseconds
    #[error("invalid fire time: {0}")]
    InvalidFireTime(String),
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
