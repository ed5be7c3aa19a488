//! Authorization facade: which channels a user can read, and since when.

use std::collections::{BTreeMap, BTreeSet};

/// Requested-channel wildcard: every channel the user has access to.
pub const ALL_CHANNELS: &str = "*";

/// One user's channel access as of now.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAccess {
    /// Channel name to the sequence of the grant that opened it. A feed
    /// cursor below a grant re-sends that channel's history.
    pub channels: BTreeMap<String, u64>,
    /// Sequence of the user's principal record's last update; advances when
    /// access changes.
    pub principal_seq: u64,
}

impl UserAccess {
    /// Restrict a requested channel set to what the user can actually read.
    /// The `"*"` wildcard expands to the user's full set.
    pub fn filter_to_available(&self, requested: &BTreeSet<String>) -> BTreeMap<String, u64> {
        if requested.contains(ALL_CHANNELS) {
            return self.channels.clone();
        }
        self.channels
            .iter()
            .filter(|(channel, _)| requested.contains(*channel))
            .map(|(channel, grant)| (channel.clone(), *grant))
            .collect()
    }
}

/// Authentication/authorization seam, queried on feed init and re-queried
/// when a principal record moves through the dispatcher.
pub trait AccessProvider: Send + Sync {
    fn user_access(&self, user: &str) -> UserAccess;
}
