//! The changes-row wire format.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::{EntryFlags, LogEntry, PRINCIPAL_DOC_PREFIX, SequenceId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// One row of a changes response:
/// `{"seq": ..., "id": ..., "changes": [{"rev": ...}], ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub seq: SequenceId,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
    /// Set when a storage backfill failed and the row's batch may be
    /// incomplete below the cache window.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub warning: bool,
}

impl ChangeEntry {
    pub fn from_log_entry(entry: &LogEntry, seq: SequenceId) -> Self {
        let removed = if entry.flags.contains(EntryFlags::REMOVED)
            && !entry.removed_channels.is_empty()
        {
            Some(entry.removed_channels.clone())
        } else {
            None
        };
        Self {
            seq,
            id: entry.doc_id.clone(),
            changes: vec![ChangeRev {
                rev: entry.rev_id.clone(),
            }],
            deleted: entry.flags.contains(EntryFlags::DELETED),
            removed,
            doc: None,
            warning: false,
        }
    }

    /// Synthetic row for a user's principal record after an access change.
    pub fn principal(name: &str, seq: SequenceId) -> Self {
        Self {
            seq,
            id: format!("{PRINCIPAL_DOC_PREFIX}{name}"),
            changes: Vec::new(),
            deleted: false,
            removed: None,
            doc: None,
            warning: false,
        }
    }
}
