//! The change cache: dispatcher, per-channel windows, late logs, and the
//! listener wakeup machinery.

pub mod change_cache;
pub mod channel;
pub mod late_log;
pub mod notifier;
pub mod pending;
pub mod skipped;

pub use change_cache::{CacheStats, ChangeCache, ChangeCacheError, MaintenanceWorker};
pub use channel::{ChannelCache, ChannelCacheError};
pub use late_log::{LateLogError, LateSequenceLog};
pub use notifier::{ChangeNotifier, PRINCIPALS_CHANNEL, Terminator, WaitOutcome};
pub use pending::PendingHeap;
pub use skipped::{SkippedSequence, SkippedSequenceError, SkippedSequenceQueue};
