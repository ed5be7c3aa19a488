//! Storage facade for backfilling below a channel cache's window.

use std::sync::Arc;

use thiserror::Error;

use crate::core::LogEntry;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The view query failed; the caller serves what it has and retries.
    #[error("storage view unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("channel {channel:?} unknown to the storage view")]
    UnknownChannel { channel: String },
}

/// Read-side of the document store.
///
/// Queried only when a feed resumes from below a channel cache's
/// `valid_from`; the cache absorbs the results so repeat misses stay cheap.
pub trait ChannelStore: Send + Sync {
    /// Entries in `channel` with `since < sequence < until`, ascending.
    fn changes_in_channel(
        &self,
        channel: &str,
        since: u64,
        until: u64,
    ) -> Result<Vec<Arc<LogEntry>>, StoreError>;

    /// Current document body for `include_docs` feeds. `None` when the body
    /// is gone or the revision is no longer current.
    fn doc_body(&self, doc_id: &str, rev_id: &str) -> Option<serde_json::Value> {
        let _ = (doc_id, rev_id);
        None
    }
}
