//! The error taxonomy used throughout the streaming writer.
//!
//! Every fallible operation in this crate returns [`StreamingError`]. Validation
//! errors surface synchronously; errors raised by background flush workers are
//! deposited into a shared slot (see [`crate::thread_pool`]) and resurface at the
//! next [`crate::stream::Stream::append`] or [`crate::stream::Stream::close`].

/// The error type returned by fallible operations on a [`crate::stream::Stream`]
/// and its constituent arrays, sinks, and worker pool.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// Configuration rejected by validation (e.g. an unknown version, an empty
    /// store path, an out-of-range compression level).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A logical inconsistency in otherwise well-formed configuration (e.g. an
    /// unlimited axis that is not the first axis, or a spatial axis count != 2).
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A runtime index fell outside a valid range. This should be unreachable
    /// from configuration that passed validation; it indicates an internal bug.
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    /// Size arithmetic overflowed, or a buffer bound was exceeded.
    #[error("overflow: {0}")]
    Overflow(String),

    /// A feature stub was reached (e.g. a data type or codec combination that
    /// is recognised but not yet wired up).
    #[error("not yet implemented: {0}")]
    NotYetImplemented(String),

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A sink read, write, or finalize call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A compression codec returned a non-positive size.
    #[error("compression error: {0}")]
    Compression(String),

    /// A second write of custom metadata was attempted without `overwrite`.
    #[error("will not overwrite existing custom metadata")]
    WillNotOverwrite,

    /// An unexpected failure from a background worker that does not fit any
    /// other variant.
    #[error("internal error: {0}")]
    Internal(String),

    /// Metadata JSON failed to serialize, deserialize, or round-trip.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The object-store backend reported a failure.
    #[cfg(feature = "s3")]
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamingError>;
