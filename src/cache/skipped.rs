//! Ordered queue of gap sequences awaiting late arrival.

use std::time::Instant;

use thiserror::Error;

/// One sequence the dispatcher gave up waiting for, with the moment it was
/// abandoned into the queue.
#[derive(Clone, Copy, Debug)]
pub struct SkippedSequence {
    pub seq: u64,
    pub time_added: Instant,
}

impl SkippedSequence {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            time_added: Instant::now(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SkippedSequenceError {
    /// The ingest path discovers gaps walking forward, so pushes arrive
    /// strictly increasing; anything else is an ingest bug and is refused.
    #[error("skipped sequence {pushed} not after {last}")]
    OutOfOrder { pushed: u64, last: u64 },
    #[error("sequence {seq} not in the skipped queue")]
    NotFound { seq: u64 },
}

/// Gap sequences in strictly increasing order.
#[derive(Debug, Default)]
pub struct SkippedSequenceQueue {
    entries: Vec<SkippedSequence>,
}

impl SkippedSequenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, skipped: SkippedSequence) -> Result<(), SkippedSequenceError> {
        if let Some(last) = self.entries.last()
            && skipped.seq <= last.seq
        {
            return Err(SkippedSequenceError::OutOfOrder {
                pushed: skipped.seq,
                last: last.seq,
            });
        }
        self.entries.push(skipped);
        Ok(())
    }

    pub fn remove(&mut self, seq: u64) -> Result<(), SkippedSequenceError> {
        match self.entries.binary_search_by_key(&seq, |s| s.seq) {
            Ok(index) => {
                self.entries.remove(index);
                Ok(())
            }
            Err(_) => Err(SkippedSequenceError::NotFound { seq }),
        }
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.entries.binary_search_by_key(&seq, |s| s.seq).is_ok()
    }

    pub fn oldest(&self) -> Option<&SkippedSequence> {
        self.entries.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkippedSequence> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
