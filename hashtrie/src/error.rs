use thiserror::Error;

/// Result type alias using the index [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index.
///
/// None of these are retried internally, and a failed operation is not rolled back: whatever was
/// written before the failure stays written.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was invoked in the wrong lifecycle state, or a leaf-only operation was
    /// invoked on an internal node. Indicates a bug in the caller or the traversal.
    #[error("invalid state: {0}")]
    State(String),

    /// Reading, writing or extending the index file, or flushing the bitmap, failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk structures contradict each other, e.g. a sector is allocated twice or a child
    /// pointer leads outside of the file.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// No sector index is left below the configured limit.
    #[error("sector space exhausted: at most {limit} sectors may be allocated")]
    Capacity { limit: u64 },

    /// The value collides with the empty-slot sentinel and cannot be stored.
    #[error("value {0} is reserved for empty slots")]
    ReservedValue(i64),
}

impl Error {
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        Error::Consistency(msg.into())
    }
}
