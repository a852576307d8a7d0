//! Store error types.
//!
//! Every variant carries enough context to diagnose the problem without a
//! debugger. Backends map their native errors into these; engines above
//! decide whether a failure is retryable.

/// Errors from key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The backend rejected or failed the operation.
    #[error("kv backend error on key '{key}': {reason}")]
    Backend { key: String, reason: String },

    /// The key exists but holds a different data type (e.g. `incr` on a set).
    #[error("kv key '{key}' holds the wrong type for this operation")]
    WrongType { key: String },

    /// The stored value could not be interpreted (e.g. a non-integer counter).
    #[error("kv key '{key}' holds an invalid value: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Failed to establish a connection to the backend.
    #[error("kv connection failed: {reason}")]
    Connection { reason: String },
}

/// Errors from message bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A durable publish was not accepted by the stream.
    #[error("publish to '{subject}' failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    /// The bus backend failed an operation other than publish.
    #[error("bus backend error: {reason}")]
    Backend { reason: String },

    /// An ack/nack referenced a delivery the bus no longer tracks.
    #[error("unknown delivery (already acknowledged or never issued)")]
    UnknownDelivery,
}
