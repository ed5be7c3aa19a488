use thiserror::Error;

use crate::cache::{ChangeCacheError, ChannelCacheError, LateLogError, SkippedSequenceError};
use crate::core::ParseSequenceError;
use crate::feed::FeedError;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical per-module
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] ChangeCacheError),

    #[error(transparent)]
    Channel(#[from] ChannelCacheError),

    #[error(transparent)]
    Skipped(#[from] SkippedSequenceError),

    #[error(transparent)]
    LateLog(#[from] LateLogError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ParseSequence(#[from] ParseSequenceError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Cache(_) | Error::Channel(_) => Transience::Unknown,
            Error::Skipped(_) | Error::ParseSequence(_) => Transience::Permanent,
            Error::LateLog(_) => Transience::Permanent,
            Error::Feed(FeedError::Cache(_)) | Error::Feed(FeedError::Channel(_)) => {
                Transience::Unknown
            }
            Error::Store(StoreError::Unavailable { .. }) => Transience::Retryable,
            Error::Store(StoreError::UnknownChannel { .. }) => Transience::Permanent,
        }
    }
}
