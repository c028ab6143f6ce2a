//! Error handling.
//!
//! Every fallible operation in this crate returns [`Result`], an alias for
//! `std::result::Result<T, Error>`. [`Error`] enumerates the abstract error
//! kinds produced by the scheduler, channels, flows, the worker pool and
//! the cross-process mutex. It is `#[non_exhaustive]`: new variants may be
//! added without a breaking change.

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The job was cancelled before or during execution.
    #[error("job was cancelled")]
    Cancelled,

    /// A deadline elapsed before the awaited operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The channel has been closed and can no longer accept or no longer
    /// has any values to yield.
    #[error("channel is closed")]
    ChannelClosed,

    /// A bounded buffer was full and the configured overflow strategy is
    /// `ERROR`.
    #[error("buffer overflow")]
    BufferOverflow,

    /// An operation was attempted from a state that forbids it, e.g.
    /// `suspend` called outside of a running fiber, or resuming an already
    /// terminated fiber.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A worker process failed; `message` carries whatever description the
    /// child process reported.
    #[error("worker failed: {0}")]
    WorkerFailure(String),

    /// The AsyncIO poller, the serializer, or the filesystem reported an
    /// error.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// A caller passed an argument outside its documented domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to encode a value for transfer to or from a worker process.
    #[error("encode failure: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a value received from a worker process.
    #[error("decode failure: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Any other error not captured by a more specific variant above.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error as [`Error::Other`].
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(error))
    }

    /// Returns the `snake_case` name of the variant, useful for metrics
    /// labels and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Cancelled => "cancelled",
            Error::Timeout => "timeout",
            Error::ChannelClosed => "channel_closed",
            Error::BufferOverflow => "buffer_overflow",
            Error::InvalidState(_) => "invalid_state",
            Error::WorkerFailure(_) => "worker_failure",
            Error::IoFailure(_) => "io_failure",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Encode(_) => "encode",
            Error::Decode(_) => "decode",
            Error::Other(_) => "other",
        }
    }

    /// True for the errors that represent expected, user-observable
    /// cancellation/timeout signals rather than genuine failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }
}

// Compile-time assertion that `Error` can cross fiber/worker boundaries.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
