use thiserror::Error;

use crate::{
    protocol::{CodecError, Lsn},
    transport::TransportError,
};

/// Rejection from an external work queue.
#[derive(Debug, Error)]
#[error("work queue rejected request: {0}")]
pub struct QueueError(pub String);

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("page compaction request of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },

    /// Acknowledging this LSN would corrupt replica state. Never recoverable.
    #[error("refusing to acknowledge illegal lsn {0}")]
    InvalidLsn(Lsn),

    #[error("operation not allowed on the coordinator")]
    IsCoordinator,

    #[error("no coordinator is known")]
    NoCoordinator,

    #[error("no current sequence number to send")]
    NoSequence,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl NetError {
    /// Errors the host process must treat as a crash.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetError::InvalidLsn(_))
    }
}
