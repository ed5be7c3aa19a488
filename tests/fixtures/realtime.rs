//! Gateway fixture simulating an upstream feed with controllable ordering.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use tideway::{AccessProvider, CacheOptions, ChangeEntry, ChannelStore, Gateway, LogEntry};

use super::memory::{MemoryAccess, MemoryStore};

pub const FEED_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GatewayFixture {
    pub gateway: Gateway,
    pub store: Arc<MemoryStore>,
    pub access: Arc<MemoryAccess>,
}

impl GatewayFixture {
    pub fn new() -> Self {
        Self::with_options(CacheOptions::default())
    }

    pub fn with_options(options: CacheOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let access = Arc::new(MemoryAccess::new());
        let gateway = Gateway::new(
            options,
            0,
            Arc::clone(&store) as Arc<dyn ChannelStore>,
            Arc::clone(&access) as Arc<dyn AccessProvider>,
        );
        Self {
            gateway,
            store,
            access,
        }
    }

    /// Write a document mutation straight onto the upstream feed, the way
    /// out-of-order arrivals are simulated against a real bucket.
    pub fn write_direct(&self, channels: &[&str], sequence: u64) {
        let entry = Arc::new(
            LogEntry::new(sequence, format!("doc-{sequence}"), "1-a")
                .with_channels(channels.to_vec()),
        );
        self.store.record(Arc::clone(&entry));
        self.gateway.doc_changed(entry).expect("doc_changed");
    }

    /// A principal-record update moving through the feed.
    pub fn write_principal(&self, name: &str, sequence: u64) {
        let entry = Arc::new(LogEntry::new(sequence, format!("_user/{name}"), ""));
        self.gateway.doc_changed(entry).expect("doc_changed");
    }

    pub fn wait_for_sequence(&self, sequence: u64) {
        assert!(
            self.gateway.wait_for_sequence(sequence, FEED_TIMEOUT),
            "sequence {sequence} not ingested in time"
        );
    }

    pub fn wait_for_sequence_with_missing(&self, sequence: u64) {
        assert!(
            self.gateway
                .wait_for_sequence_with_missing(sequence, FEED_TIMEOUT),
            "sequence {sequence} not filled in time"
        );
    }
}

pub fn all_channels() -> BTreeSet<String> {
    ["*".to_string()].into()
}

pub fn channel_set(channels: &[&str]) -> BTreeSet<String> {
    channels.iter().map(|c| c.to_string()).collect()
}

/// Drain up to `count` rows from a feed, bounded by `FEED_TIMEOUT`.
pub fn read_rows(receiver: &Receiver<ChangeEntry>, count: usize) -> Vec<ChangeEntry> {
    let deadline = Instant::now() + FEED_TIMEOUT;
    let mut rows = Vec::with_capacity(count);
    while rows.len() < count {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match receiver.recv_timeout(deadline - now) {
            Ok(row) => rows.push(row),
            Err(_) => break,
        }
    }
    rows
}

/// Wire-form sequence strings, compound prefixes included.
pub fn full_sequences(rows: &[ChangeEntry]) -> Vec<String> {
    rows.iter().map(|row| row.seq.to_string()).collect()
}

/// Sequence numbers only, ignoring compound prefixes.
pub fn sequences(rows: &[ChangeEntry]) -> Vec<u64> {
    rows.iter().map(|row| row.seq.seq).collect()
}
