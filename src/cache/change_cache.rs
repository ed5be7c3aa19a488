//! Ingest hub: reconciles the out-of-order upstream feed into per-channel
//! caches and wakes the listening feeds.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use thiserror::Error;

use crate::cache::channel::{ChannelCache, ChannelCacheError};
use crate::cache::notifier::{ChangeNotifier, PRINCIPALS_CHANNEL};
use crate::cache::pending::PendingHeap;
use crate::cache::skipped::{SkippedSequence, SkippedSequenceQueue};
use crate::core::{CacheOptions, LogEntry};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChangeCacheError {
    #[error("change cache lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Channel(#[from] ChannelCacheError),
}

/// Point-in-time counters for introspection and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub next_sequence: u64,
    pub pending: usize,
    pub skipped: usize,
    pub abandoned: u64,
}

struct DispatchState {
    /// Next contiguous sequence expected from upstream. Never regresses.
    next_sequence: u64,
    /// Frontier observed at startup; arrivals at or below it are permanently
    /// abandoned.
    initial_sequence: u64,
    pending: PendingHeap,
    /// Mirror of the pending heap's sequences, for duplicate drops.
    received: HashSet<u64>,
    skipped: SkippedSequenceQueue,
    channel_caches: HashMap<String, Arc<ChannelCache>>,
}

/// The change cache dispatcher.
///
/// `doc_changed` is the single entry point for upstream mutations. A
/// contiguous arrival is dispatched immediately and drains whatever it
/// unblocks from the pending heap; an early arrival waits in the heap until
/// the gap below it fills or times out; a late arrival fills its skipped
/// slot and reaches feeds through the channel late logs.
pub struct ChangeCache {
    options: CacheOptions,
    inner: Mutex<DispatchState>,
    notifier: ChangeNotifier,
    abandoned: AtomicU64,
}

impl ChangeCache {
    /// `initial_sequence` is the upstream sequence counter as read at
    /// startup; the cache shadows it and may lag but never lead.
    pub fn new(options: CacheOptions, initial_sequence: u64) -> Self {
        Self {
            options,
            inner: Mutex::new(DispatchState {
                next_sequence: initial_sequence + 1,
                initial_sequence,
                pending: PendingHeap::new(),
                received: HashSet::new(),
                skipped: SkippedSequenceQueue::new(),
                channel_caches: HashMap::new(),
            }),
            notifier: ChangeNotifier::new(),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Upstream mutation callback. Invoked once per mutation; duplicate
    /// sequences are dropped here.
    pub fn doc_changed(&self, entry: Arc<LogEntry>) -> Result<(), ChangeCacheError> {
        let mut notified = BTreeSet::new();
        {
            let mut state = self.lock_state()?;
            let sequence = entry.sequence;

            if sequence <= state.initial_sequence {
                tracing::debug!(seq = sequence, "arrival below the startup frontier, dropped");
                return Ok(());
            }
            if state.received.contains(&sequence) {
                tracing::debug!(seq = sequence, "duplicate pending sequence, dropped");
                return Ok(());
            }

            if sequence == state.next_sequence {
                state.next_sequence += 1;
                self.process_entry(&mut state, entry, false, &mut notified)?;
                self.drain_contiguous(&mut state, &mut notified)?;
            } else if sequence > state.next_sequence {
                state.received.insert(sequence);
                state.pending.push(entry);
                self.relieve_pending_pressure(&mut state, &mut notified)?;
            } else {
                match state.skipped.remove(sequence) {
                    Ok(()) => {
                        tracing::info!(seq = sequence, "skipped sequence filled late");
                        self.process_entry(&mut state, entry, true, &mut notified)?;
                    }
                    Err(_) => {
                        tracing::debug!(
                            seq = sequence,
                            "late arrival not in the skipped queue, dropped"
                        );
                    }
                }
            }
        }
        self.notifier.notify(notified.iter().map(String::as_str));
        Ok(())
    }

    /// Force-advance pendings whose gap has aged out. Called from the
    /// maintenance worker; a no-op when the heap is empty.
    pub fn process_pending_by_age(&self) -> Result<(), ChangeCacheError> {
        let mut notified = BTreeSet::new();
        {
            let mut state = self.lock_state()?;
            self.relieve_pending_pressure(&mut state, &mut notified)?;
        }
        self.notifier.notify(notified.iter().map(String::as_str));
        Ok(())
    }

    /// Abandon skipped sequences older than the configured wait. Their late
    /// arrival, if it ever comes, will be dropped. Returns how many were
    /// given up on.
    pub fn clean_skipped(&self) -> Result<usize, ChangeCacheError> {
        let max_wait = self.options.skipped_seq_max_wait();
        let mut abandoned = Vec::new();
        {
            let mut state = self.lock_state()?;
            while let Some(oldest) = state.skipped.oldest() {
                if oldest.time_added.elapsed() < max_wait {
                    break;
                }
                let seq = oldest.seq;
                abandoned.push(seq);
                let _ = state.skipped.remove(seq);
            }
        }
        for seq in &abandoned {
            tracing::warn!(seq, "abandoned skipped sequence; it will never be delivered");
        }
        self.abandoned.fetch_add(abandoned.len() as u64, Ordering::Relaxed);
        Ok(abandoned.len())
    }

    /// The cache for `channel`, created on first use. Creation happens under
    /// the dispatcher lock; the handle outlives it.
    pub fn channel_cache(&self, channel: &str) -> Result<Arc<ChannelCache>, ChangeCacheError> {
        let mut state = self.lock_state()?;
        let initial = state.initial_sequence;
        Ok(Arc::clone(
            state
                .channel_caches
                .entry(channel.to_string())
                .or_insert_with(|| {
                    Arc::new(ChannelCache::new(channel, initial + 1, &self.options))
                }),
        ))
    }

    /// Highest contiguously ingested sequence.
    pub fn current_sequence(&self) -> Result<u64, ChangeCacheError> {
        Ok(self.lock_state()?.next_sequence - 1)
    }

    /// Highest sequence below which nothing can still arrive: everything at
    /// or under it is cached or abandoned.
    pub fn stable_sequence(&self) -> Result<u64, ChangeCacheError> {
        let state = self.lock_state()?;
        Ok(Self::stable_of(&state))
    }

    /// The low-sequence floor to stamp on emitted entries: the stable
    /// sequence while anything is in flight, zero when the stream is
    /// contiguous (plain sequences on the wire).
    pub fn low_sequence_hint(&self) -> Result<u64, ChangeCacheError> {
        let state = self.lock_state()?;
        if state.skipped.is_empty() && state.pending.is_empty() {
            Ok(0)
        } else {
            Ok(Self::stable_of(&state))
        }
    }

    /// Sequences abandoned by `clean_skipped` since startup.
    pub fn abandoned_sequences(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Result<CacheStats, ChangeCacheError> {
        let state = self.lock_state()?;
        Ok(CacheStats {
            next_sequence: state.next_sequence,
            pending: state.pending.len(),
            skipped: state.skipped.len(),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        })
    }

    /// Poll until `sequence` has been contiguously ingested. Test support.
    pub fn wait_for_sequence(&self, sequence: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.next_sequence > sequence)
    }

    /// Poll until `sequence` has been ingested or force-advanced past, i.e.
    /// it is no longer pending or skipped. Test support.
    pub fn wait_for_sequence_with_missing(&self, sequence: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state.next_sequence > sequence && !state.skipped.contains(sequence)
        })
    }

    /// Spawn the maintenance worker: force-advances aged pendings and
    /// abandons expired skipped sequences on a `pending_seq_max_wait` tick.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceWorker {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cache = Arc::clone(self);
        let tick = self
            .options
            .pending_seq_max_wait()
            .max(Duration::from_millis(1));
        let handle = thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = cache.process_pending_by_age() {
                            tracing::warn!("pending maintenance failed: {err}");
                            break;
                        }
                        if let Err(err) = cache.clean_skipped() {
                            tracing::warn!("skipped maintenance failed: {err}");
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        MaintenanceWorker {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&DispatchState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.lock() {
                Ok(state) => {
                    if done(&state) {
                        return true;
                    }
                }
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn stable_of(state: &DispatchState) -> u64 {
        let mut floor = state.next_sequence;
        if let Some(skipped) = state.skipped.oldest() {
            floor = floor.min(skipped.seq);
        }
        if let Some(pending) = state.pending.min_sequence() {
            floor = floor.min(pending);
        }
        floor - 1
    }

    /// Accept pendings while the heap's min continues the contiguous run.
    fn drain_contiguous(
        &self,
        state: &mut DispatchState,
        notified: &mut BTreeSet<String>,
    ) -> Result<(), ChangeCacheError> {
        while state.pending.min_sequence() == Some(state.next_sequence) {
            let entry = state.pending.pop().expect("peeked entry present");
            state.received.remove(&entry.sequence);
            state.next_sequence += 1;
            self.process_entry(state, entry, false, notified)?;
        }
        Ok(())
    }

    /// While the heap is over its size bound or its oldest entry has aged
    /// out, give up on the gap below it: every missing sequence in between
    /// goes to the skipped queue and the run above it is accepted.
    fn relieve_pending_pressure(
        &self,
        state: &mut DispatchState,
        notified: &mut BTreeSet<String>,
    ) -> Result<(), ChangeCacheError> {
        let max_wait = self.options.pending_seq_max_wait();
        loop {
            let over_count = state.pending.len() > self.options.pending_seq_max_num;
            let over_age = state
                .pending
                .min_time_received()
                .is_some_and(|received| received.elapsed() >= max_wait);
            if !(over_count || over_age) {
                return Ok(());
            }

            let oldest = state
                .pending
                .min_sequence()
                .expect("pressure implies a pending entry");
            debug_assert!(oldest > state.next_sequence);
            tracing::warn!(
                from = state.next_sequence,
                to = oldest - 1,
                "gave up waiting on sequence gap"
            );
            for gap in state.next_sequence..oldest {
                if let Err(err) = state.skipped.push(SkippedSequence::new(gap)) {
                    // Gaps are discovered walking forward; a refused push is
                    // an accounting bug, not a recoverable state.
                    tracing::error!(gap, "skipped queue rejected gap: {err}");
                }
            }
            state.next_sequence = oldest;
            self.drain_contiguous(state, notified)?;
        }
    }

    fn process_entry(
        &self,
        state: &mut DispatchState,
        entry: Arc<LogEntry>,
        is_late: bool,
        notified: &mut BTreeSet<String>,
    ) -> Result<(), ChangeCacheError> {
        if entry.is_principal() {
            tracing::debug!(seq = entry.sequence, doc = %entry.doc_id, "principal record");
            notified.insert(PRINCIPALS_CHANNEL.to_string());
            return Ok(());
        }

        let initial = state.initial_sequence;
        let targets: Vec<(String, bool)> = entry
            .channels
            .iter()
            .map(|c| (c.clone(), false))
            .chain(entry.removed_channels.iter().map(|c| (c.clone(), true)))
            .collect();

        for (channel, is_removal) in targets {
            let cache = Arc::clone(
                state
                    .channel_caches
                    .entry(channel.clone())
                    .or_insert_with(|| {
                        Arc::new(ChannelCache::new(&channel, initial + 1, &self.options))
                    }),
            );
            if is_late {
                cache.add_late_sequence(Arc::clone(&entry))?;
            }
            cache.add_to_cache(Arc::clone(&entry), is_removal)?;
            tracing::debug!(seq = entry.sequence, channel = %channel, is_late, "cached");
            notified.insert(channel);
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DispatchState>, ChangeCacheError> {
        self.inner.lock().map_err(|_| ChangeCacheError::LockPoisoned)
    }
}

/// Handle to the background maintenance thread; stops it on drop.
pub struct MaintenanceWorker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
