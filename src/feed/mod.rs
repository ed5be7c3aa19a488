//! Changes feeds: per-request merge of channel caches, late logs, and
//! access state into a resumable client stream.

pub mod changes;
pub mod entry;
pub mod options;

pub use changes::{ChangesFeed, FeedError};
pub use entry::{ChangeEntry, ChangeRev};
pub use options::ChangesOptions;
