//! Mutation records flowing from the upstream feed into the caches.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

/// Prefix marking principal (user) records in the mutation stream.
pub const PRINCIPAL_DOC_PREFIX: &str = "_user/";

/// Per-entry status bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// The revision is a deletion tombstone.
    pub const DELETED: EntryFlags = EntryFlags(1);
    /// The document left the channel this entry was cached under.
    pub const REMOVED: EntryFlags = EntryFlags(1 << 1);
    /// The revision lost a conflict and is not the winning branch.
    pub const HIDDEN: EntryFlags = EntryFlags(1 << 2);

    pub fn contains(self, flag: EntryFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[must_use]
    pub fn with(self, flag: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 | flag.0)
    }
}

impl fmt::Debug for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(EntryFlags::DELETED) {
            set.entry(&"deleted");
        }
        if self.contains(EntryFlags::REMOVED) {
            set.entry(&"removed");
        }
        if self.contains(EntryFlags::HIDDEN) {
            set.entry(&"hidden");
        }
        set.finish()
    }
}

/// One document mutation as observed on the upstream feed.
///
/// Created once by the ingest path and shared by reference across every
/// channel cache it belongs to; never mutated after construction. The one
/// exception is channel removal, where the cache stores a flagged copy so
/// the shared original stays pristine.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub sequence: u64,
    pub doc_id: String,
    pub rev_id: String,
    pub channels: BTreeSet<String>,
    pub removed_channels: BTreeSet<String>,
    pub flags: EntryFlags,
    pub time_received: Instant,
}

impl LogEntry {
    pub fn new(sequence: u64, doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            sequence,
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            channels: BTreeSet::new(),
            removed_channels: BTreeSet::new(),
            flags: EntryFlags::default(),
            time_received: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_removed_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.removed_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.flags = self.flags.with(EntryFlags::DELETED);
        self
    }

    /// True for user-principal records, which take part in sequence
    /// accounting but never land in channel caches.
    pub fn is_principal(&self) -> bool {
        self.doc_id.starts_with(PRINCIPAL_DOC_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = EntryFlags::default()
            .with(EntryFlags::DELETED)
            .with(EntryFlags::REMOVED);
        assert!(flags.contains(EntryFlags::DELETED));
        assert!(flags.contains(EntryFlags::REMOVED));
        assert!(!flags.contains(EntryFlags::HIDDEN));
    }

    #[test]
    fn builder_collects_channels() {
        let entry = LogEntry::new(4, "doc-4", "1-a")
            .with_channels(["ABC", "NBC"])
            .with_removed_channels(["PBS"]);
        assert_eq!(entry.sequence, 4);
        assert!(entry.channels.contains("ABC"));
        assert!(entry.channels.contains("NBC"));
        assert!(entry.removed_channels.contains("PBS"));
        assert!(!entry.flags.contains(EntryFlags::DELETED));
    }

    #[test]
    fn principal_records_are_detected() {
        assert!(LogEntry::new(8, "_user/naomi", "").is_principal());
        assert!(!LogEntry::new(8, "doc-8", "1-a").is_principal());
    }
}
