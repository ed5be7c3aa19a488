//! Per-request options for changes feeds.

use crate::cache::Terminator;
use crate::core::SequenceId;

/// Knobs for one changes request or subscription.
#[derive(Clone, Default)]
pub struct ChangesOptions {
    /// Resume point; compound values re-send the catch-up range below their
    /// own sequence.
    pub since: SequenceId,
    /// Keep the feed open and stream new arrivals as they land.
    pub continuous: bool,
    /// One-shot long-poll: block once for new data before returning. A
    /// timeout returns an empty batch, not an error.
    pub wait: bool,
    /// Stop after this many entries; zero means unbounded.
    pub limit: usize,
    /// Attach current document bodies to emitted rows.
    pub include_docs: bool,
    /// Drop deletions and channel removals from the stream.
    pub active_only: bool,
    /// Cancellation signal; firing ends the feed and releases its
    /// late-sequence clients.
    pub terminator: Option<Terminator>,
}

impl ChangesOptions {
    pub fn since(mut self, since: SequenceId) -> Self {
        self.since = since;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self.wait = true;
        self
    }
}
