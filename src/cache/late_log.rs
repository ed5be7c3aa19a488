//! Reference-counted log of late-arriving sequences for one channel.
//!
//! Continuous feeds can't see a late arrival through the normal cache read:
//! their cursor has already advanced past its sequence. Instead each channel
//! keeps an ordered log of late arrivals, and every feed pins the node its
//! cursor sits on. Purging stops at the first pinned node, so a reader
//! slower than the purge cadence still observes every late arrival.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::core::LogEntry;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LateLogError {
    /// The node a client's cursor pointed at was purged. Should not happen
    /// while the client holds its reference; indicates a listener accounting
    /// bug. The client must re-init from the current tail.
    #[error("late-sequence cursor {since} no longer in the log")]
    ListenerExpired { since: u64 },
}

#[derive(Debug)]
struct LateLogNode {
    seq: u64,
    /// `None` only for the construction-time sentinel clients attach to
    /// before any late arrival exists.
    entry: Option<Arc<LogEntry>>,
    listeners: u64,
}

/// Ordered late arrivals with per-client cursor pinning.
///
/// Guarded by the owning channel cache's lock, so a late append is atomic
/// with the cache insertion it accompanies.
#[derive(Debug)]
pub struct LateSequenceLog {
    nodes: VecDeque<LateLogNode>,
}

impl LateSequenceLog {
    pub fn new() -> Self {
        let mut nodes = VecDeque::new();
        nodes.push_back(LateLogNode {
            seq: 0,
            entry: None,
            listeners: 0,
        });
        Self { nodes }
    }

    /// Attach a new client at the current tail; returns its starting cursor.
    pub fn init_client(&mut self) -> u64 {
        let tail = self.tail_mut();
        tail.listeners += 1;
        tail.seq
    }

    /// Append a late arrival and opportunistically drop unpinned history.
    pub fn add(&mut self, entry: Arc<LogEntry>) {
        self.nodes.push_back(LateLogNode {
            seq: entry.sequence,
            entry: Some(entry),
            listeners: 0,
        });
        self.purge();
    }

    /// Everything appended after the client's cursor, in arrival order.
    ///
    /// Moves the client's pin from its old node to the tail.
    pub fn get_since(&mut self, since: u64) -> Result<(Vec<Arc<LogEntry>>, u64), LateLogError> {
        let Some(position) = self.nodes.iter().position(|node| node.seq == since) else {
            return Err(LateLogError::ListenerExpired { since });
        };

        let entries: Vec<Arc<LogEntry>> = self
            .nodes
            .iter()
            .skip(position + 1)
            .filter_map(|node| node.entry.clone())
            .collect();
        let last_seq = entries.last().map_or(since, |entry| entry.sequence);

        self.nodes[position].listeners = self.nodes[position].listeners.saturating_sub(1);
        self.tail_mut().listeners += 1;
        Ok((entries, last_seq))
    }

    /// Drop a client's pin. Saturating: counts reach zero but never cross it.
    pub fn release_client(&mut self, since: u64) {
        if let Some(node) = self.nodes.iter_mut().find(|node| node.seq == since) {
            node.listeners = node.listeners.saturating_sub(1);
        }
    }

    /// Unlink zero-listener heads. The tail always survives so new clients
    /// have a node to attach to.
    pub fn purge(&mut self) {
        while self.nodes.len() > 1 && self.nodes[0].listeners == 0 {
            self.nodes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[cfg(test)]
    fn listeners_at(&self, index: usize) -> u64 {
        self.nodes[index].listeners
    }

    #[cfg(test)]
    fn sequences(&self) -> Vec<u64> {
        self.nodes.iter().map(|node| node.seq).collect()
    }

    fn tail_mut(&mut self) -> &mut LateLogNode {
        self.nodes.back_mut().expect("late log never empty")
    }
}

impl Default for LateSequenceLog {
    fn default() -> Self {
        Self::new()
    }
}
