//! In-memory stand-ins for the storage and authorization seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tideway::{AccessProvider, ChannelStore, LogEntry, StoreError, UserAccess};

/// Storage fake: remembers every written entry so cache misses can be
/// served, and can be flipped into a failing mode.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<Arc<LogEntry>>>,
    bodies: Mutex<HashMap<(String, String), serde_json::Value>>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: Arc<LogEntry>) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn put_doc_body(&self, doc_id: &str, rev_id: &str, body: serde_json::Value) {
        self.bodies
            .lock()
            .unwrap()
            .insert((doc_id.to_string(), rev_id.to_string()), body);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ChannelStore for MemoryStore {
    fn changes_in_channel(
        &self,
        channel: &str,
        since: u64,
        until: u64,
    ) -> Result<Vec<Arc<LogEntry>>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "view offline".to_string(),
            });
        }
        let mut matched: Vec<Arc<LogEntry>> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.sequence > since && e.sequence < until)
            .filter(|e| {
                e.channels.contains(channel) || e.removed_channels.contains(channel)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.sequence);
        Ok(matched)
    }

    fn doc_body(&self, doc_id: &str, rev_id: &str) -> Option<serde_json::Value> {
        self.bodies
            .lock()
            .unwrap()
            .get(&(doc_id.to_string(), rev_id.to_string()))
            .cloned()
    }
}

/// Authorization fake with mutable per-user access.
#[derive(Default)]
pub struct MemoryAccess {
    users: Mutex<HashMap<String, UserAccess>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_access(&self, user: &str, channels: &[(&str, u64)], principal_seq: u64) {
        let access = UserAccess {
            channels: channels
                .iter()
                .map(|(channel, grant)| (channel.to_string(), *grant))
                .collect(),
            principal_seq,
        };
        self.users.lock().unwrap().insert(user.to_string(), access);
    }
}

impl AccessProvider for MemoryAccess {
    fn user_access(&self, user: &str) -> UserAccess {
        self.users
            .lock()
            .unwrap()
            .get(user)
            .cloned()
            .unwrap_or_default()
    }
}
