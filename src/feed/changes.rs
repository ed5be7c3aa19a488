//! The changes-feed multiplexer: merges channel caches, late logs, storage
//! backfill, and access grants into one resumable stream.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::access::AccessProvider;
use crate::cache::channel::ChannelCache;
use crate::cache::notifier::{PRINCIPALS_CHANNEL, WaitOutcome};
use crate::cache::{ChangeCache, ChangeCacheError, ChannelCacheError, LateLogError};
use crate::core::{EntryFlags, LogEntry, SequenceId};
use crate::feed::entry::ChangeEntry;
use crate::feed::options::ChangesOptions;
use crate::store::ChannelStore;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error(transparent)]
    Cache(#[from] ChangeCacheError),
    #[error(transparent)]
    Channel(#[from] ChannelCacheError),
}

/// One candidate row before merge: the shared entry, the grant that caused
/// its re-send (zero for normal flow), and the backfill-degraded marker.
struct Candidate {
    entry: Arc<LogEntry>,
    triggered_by: u64,
    warning: bool,
}

/// Per-subscription state for a changes request.
///
/// A one-shot request runs a single merge pass (optionally long-polling
/// once); a continuous subscription runs the same pass in a loop on its own
/// thread, with a late-sequence client per channel so late fills reach it
/// without re-reading the whole window.
pub struct ChangesFeed {
    cache: Arc<ChangeCache>,
    store: Arc<dyn ChannelStore>,
    access: Arc<dyn AccessProvider>,
    user: String,
    requested: BTreeSet<String>,
    options: ChangesOptions,
    since: SequenceId,
    last_principal_seq: u64,
    /// Channel name to this feed's cursor in that channel's late log.
    late_cursors: HashMap<String, u64>,
    /// Late sequences already emitted. A fill lands in every matching
    /// channel's late log; the per-channel cursors can surface the copies
    /// across different passes.
    seen_late: HashSet<u64>,
    use_late_feeds: bool,
    first_iteration: bool,
    remaining: Option<usize>,
    exhausted: bool,
}

impl ChangesFeed {
    pub fn new(
        cache: Arc<ChangeCache>,
        store: Arc<dyn ChannelStore>,
        access: Arc<dyn AccessProvider>,
        user: impl Into<String>,
        requested: BTreeSet<String>,
        options: ChangesOptions,
    ) -> Self {
        let user = user.into();
        let last_principal_seq = access.user_access(&user).principal_seq;
        let since = options.since;
        let use_late_feeds = options.continuous;
        let remaining = (options.limit > 0).then_some(options.limit);
        Self {
            cache,
            store,
            access,
            user,
            requested,
            options,
            since,
            last_principal_seq,
            late_cursors: HashMap::new(),
            seen_late: HashSet::new(),
            use_late_feeds,
            first_iteration: true,
            remaining,
            exhausted: false,
        }
    }

    /// One-shot request. With `wait` set, long-polls until data arrives or
    /// the wait bound elapses; a timeout is an empty batch, not an error.
    pub fn run_once(mut self) -> Result<Vec<ChangeEntry>, FeedError> {
        let deadline = Instant::now() + self.cache.options().wait_timeout();
        loop {
            let watched = self.watched_channels();
            let snapshot = self.cache.notifier().snapshot(&watched);
            let rows = self.iteration()?;
            if !rows.is_empty() || !self.options.wait {
                self.release_late_clients();
                return Ok(rows);
            }

            let now = Instant::now();
            if now >= deadline {
                self.release_late_clients();
                return Ok(rows);
            }
            let outcome = self.cache.notifier().wait_for_change(
                &watched,
                snapshot,
                deadline - now,
                self.options.terminator.as_ref(),
            );
            match outcome {
                WaitOutcome::Changed => {}
                WaitOutcome::Timeout | WaitOutcome::Terminated => {
                    self.release_late_clients();
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Continuous subscription body; runs until terminated, disconnected,
    /// or the limit is reached.
    pub(crate) fn run_continuous(mut self, sender: Sender<ChangeEntry>) {
        let heartbeat = self.cache.options().wait_timeout();
        loop {
            if self.terminated() {
                break;
            }
            let watched = self.watched_channels();
            let snapshot = self.cache.notifier().snapshot(&watched);
            let rows = match self.iteration() {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(user = %self.user, "changes feed iteration failed: {err}");
                    break;
                }
            };

            let mut disconnected = false;
            for row in rows {
                if sender.send(row).is_err() {
                    disconnected = true;
                    break;
                }
            }
            if disconnected || self.exhausted {
                break;
            }

            match self.cache.notifier().wait_for_change(
                &watched,
                snapshot,
                heartbeat,
                self.options.terminator.as_ref(),
            ) {
                WaitOutcome::Terminated => break,
                WaitOutcome::Changed | WaitOutcome::Timeout => {}
            }
        }
        self.release_late_clients();
    }

    /// One merge pass over every visible channel.
    fn iteration(&mut self) -> Result<Vec<ChangeEntry>, FeedError> {
        // The frontier bounds this pass: an entry ingested after this point
        // waits for the next pass, so a sequence landing in an already-read
        // channel mid-merge cannot be jumped over.
        let frontier = self.cache.current_sequence()?;
        let low_seq = self.cache.low_sequence_hint()?;
        let access = self.access.user_access(&self.user);
        let available = access.filter_to_available(&self.requested);

        let mut candidates: Vec<Candidate> = Vec::new();

        for (channel, grant_seq) in &available {
            let channel_cache = self.cache.channel_cache(channel)?;
            if self.use_late_feeds && !self.late_cursors.contains_key(channel) {
                let cursor = channel_cache.init_late_sequence_client()?;
                self.late_cursors.insert(channel.clone(), cursor);
            }

            // A grant newer than the cursor re-sends the channel's history,
            // stamped with the grant sequence.
            let triggered = *grant_seq > self.since.seq && self.since.triggered_by == 0;
            let from = if triggered {
                0
            } else if self.first_iteration {
                self.since.safe_sequence()
            } else {
                self.since.seq
            };

            let (entries, warning) = self.channel_changes(&channel_cache, channel, from)?;
            let triggered_by = if triggered { *grant_seq } else { 0 };
            candidates.extend(entries.into_iter().map(|entry| Candidate {
                entry,
                triggered_by,
                warning,
            }));
        }

        if self.use_late_feeds {
            for channel in available.keys() {
                self.collect_late(channel, &mut candidates)?;
            }
        }

        let mut rows = self.assemble(candidates, frontier, low_seq);

        // The principal row waits until its sequence has actually been
        // ingested, so it merges at the right position.
        if access.principal_seq > self.last_principal_seq && access.principal_seq <= frontier {
            if access.principal_seq > self.since.seq {
                let id = SequenceId {
                    seq: access.principal_seq,
                    triggered_by: 0,
                    low_seq,
                };
                rows.push(ChangeEntry::principal(&self.user, id));
            }
            self.last_principal_seq = access.principal_seq;
        }

        rows.sort_by(|a, b| a.seq.cmp(&b.seq));
        dedup_by_doc(&mut rows);

        if let Some(remaining) = self.remaining {
            if rows.len() >= remaining {
                rows.truncate(remaining);
                self.exhausted = true;
            }
            self.remaining = Some(remaining - rows.len());
        }

        for row in &rows {
            if self.since < row.seq {
                self.since = row.seq;
            }
        }
        self.first_iteration = false;
        Ok(rows)
    }

    /// Cached entries above `since`, backfilled from storage when the
    /// window doesn't reach down far enough. Storage failure degrades to
    /// the cached slice with the warning marker set.
    fn channel_changes(
        &self,
        channel_cache: &ChannelCache,
        channel: &str,
        since: u64,
    ) -> Result<(Vec<Arc<LogEntry>>, bool), FeedError> {
        let (valid_from, cached) = channel_cache.get_changes(since)?;
        if since + 1 >= valid_from {
            return Ok((cached, false));
        }

        match self.store.changes_in_channel(channel, since, valid_from) {
            Ok(older) => {
                let mut merged = older.clone();
                merged.extend(cached);
                merged.sort_by_key(|e| e.sequence);
                merged.dedup_by_key(|e| e.sequence);
                channel_cache.prepend_changes(&older, since + 1)?;
                Ok((merged, false))
            }
            Err(err) => {
                tracing::warn!(
                    channel,
                    since,
                    "storage backfill failed, serving the cached window: {err}"
                );
                Ok((cached, true))
            }
        }
    }

    fn collect_late(
        &mut self,
        channel: &str,
        candidates: &mut Vec<Candidate>,
    ) -> Result<(), FeedError> {
        let Some(cursor) = self.late_cursors.get(channel).copied() else {
            return Ok(());
        };
        let channel_cache = self.cache.channel_cache(channel)?;
        match channel_cache.get_late_sequences_since(cursor) {
            Ok((entries, next_cursor)) => {
                self.late_cursors.insert(channel.to_string(), next_cursor);
                candidates.extend(
                    entries
                        .into_iter()
                        .filter(|entry| self.seen_late.insert(entry.sequence))
                        .map(|entry| Candidate {
                            entry,
                            triggered_by: 0,
                            warning: false,
                        }),
                );
                Ok(())
            }
            Err(ChannelCacheError::Late(LateLogError::ListenerExpired { since })) => {
                // Listener accounting kept the node alive for us; landing
                // here means the pin was lost and so were any late fills
                // between the old cursor and now.
                tracing::warn!(
                    channel,
                    since,
                    "late-sequence cursor expired, re-attaching at the tail"
                );
                let cursor = channel_cache.init_late_sequence_client()?;
                self.late_cursors.insert(channel.to_string(), cursor);
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    fn assemble(
        &self,
        candidates: Vec<Candidate>,
        frontier: u64,
        low_seq: u64,
    ) -> Vec<ChangeEntry> {
        let mut rows = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let entry = &candidate.entry;
            if entry.sequence > frontier {
                continue;
            }
            if self.options.active_only
                && (entry.flags.contains(EntryFlags::DELETED)
                    || entry.flags.contains(EntryFlags::REMOVED))
            {
                continue;
            }
            let id = SequenceId {
                seq: entry.sequence,
                triggered_by: candidate.triggered_by,
                low_seq,
            };
            let mut row = ChangeEntry::from_log_entry(entry, id);
            row.warning = candidate.warning;
            if self.options.include_docs {
                row.doc = self.store.doc_body(&entry.doc_id, &entry.rev_id);
            }
            rows.push(row);
        }
        rows
    }

    fn watched_channels(&self) -> BTreeSet<String> {
        let access = self.access.user_access(&self.user);
        let mut watched: BTreeSet<String> = access
            .filter_to_available(&self.requested)
            .into_keys()
            .collect();
        watched.insert(PRINCIPALS_CHANNEL.to_string());
        watched
    }

    fn terminated(&self) -> bool {
        self.options
            .terminator
            .as_ref()
            .is_some_and(|t| t.is_fired())
    }

    fn release_late_clients(&mut self) {
        for (channel, cursor) in self.late_cursors.drain() {
            if let Ok(channel_cache) = self.cache.channel_cache(&channel)
                && let Err(err) = channel_cache.release_late_sequence_client(cursor)
            {
                tracing::warn!(channel, "late-sequence release failed: {err}");
            }
        }
    }
}

/// Keep the highest-sequence row per document, first occurrence on ties.
/// Assumes `rows` is already sorted by sequence id.
fn dedup_by_doc(rows: &mut Vec<ChangeEntry>) {
    let mut best: HashMap<String, SequenceId> = HashMap::new();
    for row in rows.iter() {
        best.entry(row.id.clone())
            .and_modify(|seq| {
                if row.seq > *seq {
                    *seq = row.seq;
                }
            })
            .or_insert(row.seq);
    }
    let mut seen: BTreeSet<String> = BTreeSet::new();
    rows.retain(|row| best[&row.id] == row.seq && seen.insert(row.id.clone()));
}
