//! Crate façade wiring the change cache to its external collaborators.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, bounded};

use crate::access::AccessProvider;
use crate::cache::{ChangeCache, ChangeCacheError, MaintenanceWorker, Terminator};
use crate::core::{CacheOptions, LogEntry};
use crate::feed::{ChangeEntry, ChangesFeed, ChangesOptions, FeedError};
use crate::store::ChannelStore;

/// The sync gateway's caching core: one ingest hub, its maintenance worker,
/// and the feed surfaces.
///
/// `initial_sequence` is the upstream sequence counter as read at startup;
/// everything at or below it is served from storage, never from the cache.
pub struct Gateway {
    cache: Arc<ChangeCache>,
    store: Arc<dyn ChannelStore>,
    access: Arc<dyn AccessProvider>,
    _maintenance: MaintenanceWorker,
}

impl Gateway {
    pub fn new(
        options: CacheOptions,
        initial_sequence: u64,
        store: Arc<dyn ChannelStore>,
        access: Arc<dyn AccessProvider>,
    ) -> Self {
        let cache = Arc::new(ChangeCache::new(options, initial_sequence));
        let maintenance = cache.start_maintenance();
        Self {
            cache,
            store,
            access,
            _maintenance: maintenance,
        }
    }

    /// Upstream mutation callback; invoked once per mutation.
    pub fn doc_changed(&self, entry: Arc<LogEntry>) -> Result<(), ChangeCacheError> {
        self.cache.doc_changed(entry)
    }

    pub fn change_cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    /// A cancellation handle usable in `ChangesOptions::terminator`.
    pub fn terminator(&self) -> Terminator {
        self.cache.notifier().terminator()
    }

    pub fn wait_for_sequence(&self, sequence: u64, timeout: Duration) -> bool {
        self.cache.wait_for_sequence(sequence, timeout)
    }

    pub fn wait_for_sequence_with_missing(&self, sequence: u64, timeout: Duration) -> bool {
        self.cache.wait_for_sequence_with_missing(sequence, timeout)
    }

    /// One-shot changes request for `user` over `channels` (`"*"` = all the
    /// user's channels).
    pub fn changes(
        &self,
        user: &str,
        channels: BTreeSet<String>,
        options: ChangesOptions,
    ) -> Result<Vec<ChangeEntry>, FeedError> {
        self.feed(user, channels, options).run_once()
    }

    /// Continuous changes subscription; rows arrive on the returned
    /// receiver until the terminator fires, the limit is reached, or the
    /// receiver is dropped.
    pub fn changes_feed(
        &self,
        user: &str,
        channels: BTreeSet<String>,
        options: ChangesOptions,
    ) -> Receiver<ChangeEntry> {
        let (sender, receiver) = bounded(self.cache.options().feed_buffer.max(1));
        let feed = self.feed(user, channels, options);
        thread::spawn(move || feed.run_continuous(sender));
        receiver
    }

    fn feed(&self, user: &str, channels: BTreeSet<String>, options: ChangesOptions) -> ChangesFeed {
        ChangesFeed::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            Arc::clone(&self.access),
            user,
            channels,
            options,
        )
    }
}
