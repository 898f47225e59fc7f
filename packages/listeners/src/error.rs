use thiserror::Error;

use crate::QueueId;

/// Errors that can occur when handing work to a call queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The call queue has been closed and no longer accepts work.
    #[error("call queue {queue} is closed and no longer accepts work")]
    QueueClosed {
        /// The queue that rejected the work.
        queue: QueueId,
    },
}

/// A specialized `Result` type for call queue operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
