//! Bounded per-channel cache of recent entries plus the channel's late log.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::cache::late_log::{LateLogError, LateSequenceLog};
use crate::core::{CacheOptions, EntryFlags, LogEntry};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelCacheError {
    #[error("channel cache lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Late(#[from] LateLogError),
}

/// Recent entries for one channel, sorted strictly by sequence, bounded to
/// `[min_length, max_length]`.
///
/// One lock guards both the entry window and the late log, making a late
/// append atomic with the cache insertion it accompanies. Lock order is
/// dispatcher before channel cache, never the reverse.
pub struct ChannelCache {
    channel: String,
    min_length: usize,
    max_length: usize,
    inner: Mutex<ChannelCacheState>,
}

struct ChannelCacheState {
    logs: Vec<Arc<LogEntry>>,
    /// Lowest sequence the window is complete from. Reads below it must
    /// fall back to the storage view.
    valid_from: u64,
    late_log: LateSequenceLog,
}

impl ChannelCache {
    pub fn new(channel: impl Into<String>, valid_from: u64, options: &CacheOptions) -> Self {
        Self {
            channel: channel.into(),
            min_length: options.channel_cache_min_length,
            max_length: options.channel_cache_max_length.max(1),
            inner: Mutex::new(ChannelCacheState {
                logs: Vec::new(),
                valid_from,
                late_log: LateSequenceLog::new(),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Insert an entry into the window in sequence order.
    ///
    /// Removals store a flagged copy so the shared entry stays pristine.
    /// Duplicates by sequence and entries below `valid_from` are ignored;
    /// the latter reach clients through the late log instead.
    pub fn add_to_cache(
        &self,
        entry: Arc<LogEntry>,
        is_removal: bool,
    ) -> Result<(), ChannelCacheError> {
        let mut state = self.lock_state()?;

        let entry = if is_removal {
            let mut removal = (*entry).clone();
            removal.flags = removal.flags.with(EntryFlags::REMOVED);
            Arc::new(removal)
        } else {
            entry
        };

        if entry.sequence < state.valid_from {
            tracing::debug!(
                channel = %self.channel,
                seq = entry.sequence,
                valid_from = state.valid_from,
                "entry below cache window, left to the late log"
            );
            return Ok(());
        }

        match state
            .logs
            .binary_search_by_key(&entry.sequence, |e| e.sequence)
        {
            Ok(_) => return Ok(()),
            Err(position) => state.logs.insert(position, entry),
        }

        if state.logs.len() > self.max_length {
            let excess = state.logs.len() - self.min_length.min(state.logs.len());
            state.logs.drain(..excess);
            if let Some(front) = state.logs.first() {
                state.valid_from = front.sequence;
            }
        }
        Ok(())
    }

    /// Record a late arrival for feeds following this channel's late log.
    pub fn add_late_sequence(&self, entry: Arc<LogEntry>) -> Result<(), ChannelCacheError> {
        let mut state = self.lock_state()?;
        state.late_log.add(entry);
        Ok(())
    }

    /// Cached entries with `sequence > since`, plus the window floor.
    ///
    /// When `since + 1 < valid_from` the result may be incomplete and the
    /// caller must backfill from storage.
    pub fn get_changes(&self, since: u64) -> Result<(u64, Vec<Arc<LogEntry>>), ChannelCacheError> {
        let state = self.lock_state()?;
        let start = state.logs.partition_point(|e| e.sequence <= since);
        Ok((state.valid_from, state.logs[start..].to_vec()))
    }

    /// Merge an older slice fetched from storage into the front of the
    /// window. `valid_from` is the sequence the slice is complete from.
    /// Returns the number of entries inserted.
    pub fn prepend_changes(
        &self,
        older: &[Arc<LogEntry>],
        valid_from: u64,
    ) -> Result<usize, ChannelCacheError> {
        let mut state = self.lock_state()?;

        let front = state.logs.first().map(|e| e.sequence);
        let mut candidates: Vec<Arc<LogEntry>> = older
            .iter()
            .filter(|e| front.is_none_or(|f| e.sequence < f))
            .cloned()
            .collect();
        candidates.sort_by_key(|e| e.sequence);
        candidates.dedup_by_key(|e| e.sequence);

        let capacity = self.max_length.saturating_sub(state.logs.len());
        if capacity == 0 {
            return Ok(0);
        }
        let new_valid_from = if candidates.len() > capacity {
            // Keep the newest slice that fits; the window is only complete
            // from its first kept entry.
            candidates.drain(..candidates.len() - capacity);
            candidates.first().map_or(valid_from, |e| e.sequence)
        } else {
            valid_from
        };

        let inserted = candidates.len();
        state.logs.splice(0..0, candidates);
        if new_valid_from < state.valid_from {
            state.valid_from = new_valid_from;
        }
        Ok(inserted)
    }

    pub fn init_late_sequence_client(&self) -> Result<u64, ChannelCacheError> {
        let mut state = self.lock_state()?;
        Ok(state.late_log.init_client())
    }

    pub fn get_late_sequences_since(
        &self,
        since: u64,
    ) -> Result<(Vec<Arc<LogEntry>>, u64), ChannelCacheError> {
        let mut state = self.lock_state()?;
        Ok(state.late_log.get_since(since)?)
    }

    pub fn release_late_sequence_client(&self, since: u64) -> Result<(), ChannelCacheError> {
        let mut state = self.lock_state()?;
        state.late_log.release_client(since);
        Ok(())
    }

    /// Sequences currently in the window, for introspection and tests.
    pub fn cached_sequences(&self) -> Result<Vec<u64>, ChannelCacheError> {
        let state = self.lock_state()?;
        Ok(state.logs.iter().map(|e| e.sequence).collect())
    }

    pub fn valid_from(&self) -> Result<u64, ChannelCacheError> {
        Ok(self.lock_state()?.valid_from)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ChannelCacheState>, ChannelCacheError> {
        self.inner
            .lock()
            .map_err(|_| ChannelCacheError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(valid_from: u64) -> ChannelCache {
        ChannelCache::new("Test1", valid_from, &CacheOptions::default())
    }

    fn bounded_cache(valid_from: u64, min: usize, max: usize) -> ChannelCache {
        let options = CacheOptions {
            channel_cache_min_length: min,
            channel_cache_max_length: max,
            ..CacheOptions::default()
        };
        ChannelCache::new("Test1", valid_from, &options)
    }

    fn entry(seq: u64) -> Arc<LogEntry> {
        Arc::new(LogEntry::new(seq, format!("doc-{seq}"), "1-a").with_channels(["Test1"]))
    }

    #[test]
    fn inserts_at_start_middle_end_and_empty() {
        // Middle insert.
        let abc = cache(1);
        for seq in [1, 2, 5, 6] {
            abc.add_to_cache(entry(seq), false).unwrap();
        }
        abc.add_to_cache(entry(3), false).unwrap();
        assert_eq!(abc.cached_sequences().unwrap(), vec![1, 2, 3, 5, 6]);

        // Front insert.
        let pbs = cache(1);
        for seq in [5, 6] {
            pbs.add_to_cache(entry(seq), false).unwrap();
        }
        pbs.add_to_cache(entry(3), false).unwrap();
        assert_eq!(pbs.cached_sequences().unwrap(), vec![3, 5, 6]);

        // Back insert.
        let nbc = cache(1);
        nbc.add_to_cache(entry(1), false).unwrap();
        nbc.add_to_cache(entry(3), false).unwrap();
        assert_eq!(nbc.cached_sequences().unwrap(), vec![1, 3]);

        // Empty cache.
        let tbs = cache(1);
        tbs.add_to_cache(entry(3), false).unwrap();
        assert_eq!(tbs.cached_sequences().unwrap(), vec![3]);
    }

    #[test]
    fn duplicate_sequences_are_ignored() {
        let cache = cache(1);
        cache.add_to_cache(entry(4), false).unwrap();
        cache.add_to_cache(entry(4), false).unwrap();
        assert_eq!(cache.cached_sequences().unwrap(), vec![4]);
    }

    #[test]
    fn overflow_trims_to_min_and_advances_valid_from() {
        let cache = bounded_cache(1, 2, 5);
        for seq in 1..=6 {
            cache.add_to_cache(entry(seq), false).unwrap();
        }
        assert_eq!(cache.cached_sequences().unwrap(), vec![5, 6]);
        assert_eq!(cache.valid_from().unwrap(), 5);
    }

    #[test]
    fn entries_below_the_window_are_not_inserted() {
        let cache = cache(5);
        cache.add_to_cache(entry(6), false).unwrap();
        cache.add_to_cache(entry(3), false).unwrap();
        assert_eq!(cache.cached_sequences().unwrap(), vec![6]);
    }

    #[test]
    fn removal_stores_a_flagged_copy() {
        let cache = cache(1);
        let original = entry(7);
        cache.add_to_cache(Arc::clone(&original), true).unwrap();
        let (_, cached) = cache.get_changes(0).unwrap();
        assert!(cached[0].flags.contains(EntryFlags::REMOVED));
        assert!(!original.flags.contains(EntryFlags::REMOVED));
    }

    #[test]
    fn get_changes_filters_by_since() {
        let cache = cache(1);
        for seq in [2, 4, 6] {
            cache.add_to_cache(entry(seq), false).unwrap();
        }
        let (valid_from, entries) = cache.get_changes(4).unwrap();
        assert_eq!(valid_from, 1);
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), [6]);
        let (_, all) = cache.get_changes(0).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn prepend_merges_older_storage_results() {
        let cache = bounded_cache(8, 2, 10);
        for seq in [8, 9] {
            cache.add_to_cache(entry(seq), false).unwrap();
        }
        let older = vec![entry(3), entry(5), entry(8)];
        let inserted = cache.prepend_changes(&older, 1).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(cache.cached_sequences().unwrap(), vec![3, 5, 8, 9]);
        assert_eq!(cache.valid_from().unwrap(), 1);
    }

    #[test]
    fn prepend_respects_the_length_bound() {
        let cache = bounded_cache(8, 2, 4);
        for seq in [8, 9] {
            cache.add_to_cache(entry(seq), false).unwrap();
        }
        let older = vec![entry(2), entry(3), entry(5), entry(6)];
        let inserted = cache.prepend_changes(&older, 1).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(cache.cached_sequences().unwrap(), vec![5, 6, 8, 9]);
        // Incomplete below the kept slice, so the floor stays at its front.
        assert_eq!(cache.valid_from().unwrap(), 5);
    }

    #[test]
    fn late_clients_delegate_to_the_log() {
        let cache = cache(1);
        let start = cache.init_late_sequence_client().unwrap();
        assert_eq!(start, 0);
        cache.add_late_sequence(entry(5)).unwrap();
        let (entries, last) = cache.get_late_sequences_since(start).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(last, 5);
        cache.release_late_sequence_client(last).unwrap();
    }
}
