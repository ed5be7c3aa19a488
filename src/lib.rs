#![forbid(unsafe_code)]

//! In-memory change and channel cache core for a mobile sync gateway.
//!
//! The [`Gateway`] ingests an ordered-but-gappy stream of document
//! mutations ([`Gateway::doc_changed`]), reconciles out-of-order arrivals
//! into a monotonic per-client view, and serves filtered, resumable changes
//! feeds ([`Gateway::changes`], [`Gateway::changes_feed`]) over logical
//! channels. Storage, authentication, and the upstream feed stay behind the
//! [`ChannelStore`] and [`AccessProvider`] seams.

pub mod access;
pub mod cache;
pub mod core;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::access::{ALL_CHANNELS, AccessProvider, UserAccess};
pub use crate::cache::{
    CacheStats, ChangeCache, ChangeCacheError, ChangeNotifier, ChannelCache, ChannelCacheError,
    LateLogError, LateSequenceLog, MaintenanceWorker, PRINCIPALS_CHANNEL, SkippedSequence,
    SkippedSequenceError, SkippedSequenceQueue, Terminator, WaitOutcome,
};
pub use crate::core::{
    CacheOptions, EntryFlags, LogEntry, PRINCIPAL_DOC_PREFIX, ParseSequenceError, SequenceId,
};
pub use crate::feed::{ChangeEntry, ChangeRev, ChangesFeed, ChangesOptions, FeedError};
pub use crate::gateway::Gateway;
pub use crate::store::{ChannelStore, StoreError};
