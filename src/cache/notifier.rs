//! Broadcast-on-new-data signalling between the dispatcher and feeds.
//!
//! Each channel carries a monotonic version counter. A feed reads its
//! watched counters *before* fetching, and later waits for the sum to move
//! past that snapshot; an arrival between fetch and wait bumps the counter
//! first, so wakeups are never lost.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Reserved channel bumped when a principal record passes through the
/// dispatcher, so feeds re-read their user's access.
pub const PRINCIPALS_CHANNEL: &str = "!principals";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    Timeout,
    Terminated,
}

#[derive(Default)]
struct NotifierState {
    counters: HashMap<String, u64>,
}

/// Per-channel version counters with condvar broadcast.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<(Mutex<NotifierState>, Condvar)>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump every named channel and wake all waiters.
    pub fn notify<'a, I>(&self, channels: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let (lock, condvar) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            for channel in channels {
                *state.counters.entry(channel.to_string()).or_insert(0) += 1;
            }
        }
        condvar.notify_all();
    }

    /// Sum of the watched counters. Monotonic: any bump to any watched
    /// channel changes the sum.
    pub fn snapshot(&self, channels: &BTreeSet<String>) -> u64 {
        let (lock, _) = &*self.inner;
        match lock.lock() {
            Ok(state) => channels
                .iter()
                .map(|c| state.counters.get(c).copied().unwrap_or(0))
                .sum(),
            Err(_) => 0,
        }
    }

    /// Block until a watched counter moves past `snapshot`, the timeout
    /// elapses, or the terminator fires.
    pub fn wait_for_change(
        &self,
        channels: &BTreeSet<String>,
        snapshot: u64,
        timeout: Duration,
        terminator: Option<&Terminator>,
    ) -> WaitOutcome {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = lock.lock() else {
            return WaitOutcome::Timeout;
        };
        loop {
            if terminator.is_some_and(Terminator::is_fired) {
                return WaitOutcome::Terminated;
            }
            let current: u64 = channels
                .iter()
                .map(|c| state.counters.get(c).copied().unwrap_or(0))
                .sum();
            if current != snapshot {
                return WaitOutcome::Changed;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Timeout;
            }
            match condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => state = guard,
                Err(_) => return WaitOutcome::Timeout,
            }
        }
    }

    /// A cancellation handle whose firing wakes every waiter on this
    /// notifier.
    pub fn terminator(&self) -> Terminator {
        Terminator {
            fired: Arc::new(AtomicBool::new(false)),
            notifier: self.clone(),
        }
    }
}

/// Cloneable cancellation signal for one feed.
#[derive(Clone)]
pub struct Terminator {
    fired: Arc<AtomicBool>,
    notifier: ChangeNotifier,
}

impl Terminator {
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        let (_, condvar) = &*self.notifier.inner;
        condvar.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn watched(channels: &[&str]) -> BTreeSet<String> {
        channels.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn notify_changes_the_snapshot() {
        let notifier = ChangeNotifier::new();
        let channels = watched(&["ABC", "PBS"]);
        let before = notifier.snapshot(&channels);
        notifier.notify(["ABC"]);
        assert_ne!(notifier.snapshot(&channels), before);
        // Unwatched channels don't move the snapshot.
        let after = notifier.snapshot(&channels);
        notifier.notify(["CBS"]);
        assert_eq!(notifier.snapshot(&channels), after);
    }

    #[test]
    fn waiter_wakes_on_notify() {
        let notifier = ChangeNotifier::new();
        let channels = watched(&["ABC"]);
        let snapshot = notifier.snapshot(&channels);

        let waiter = {
            let notifier = notifier.clone();
            let channels = channels.clone();
            thread::spawn(move || {
                notifier.wait_for_change(&channels, snapshot, Duration::from_secs(5), None)
            })
        };
        thread::sleep(Duration::from_millis(20));
        notifier.notify(["ABC"]);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Changed);
    }

    #[test]
    fn wait_times_out_without_changes() {
        let notifier = ChangeNotifier::new();
        let channels = watched(&["ABC"]);
        let snapshot = notifier.snapshot(&channels);
        let outcome =
            notifier.wait_for_change(&channels, snapshot, Duration::from_millis(10), None);
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn terminator_interrupts_the_wait() {
        let notifier = ChangeNotifier::new();
        let terminator = notifier.terminator();
        let channels = watched(&["ABC"]);
        let snapshot = notifier.snapshot(&channels);

        let waiter = {
            let notifier = notifier.clone();
            let channels = channels.clone();
            let terminator = terminator.clone();
            thread::spawn(move || {
                notifier.wait_for_change(
                    &channels,
                    snapshot,
                    Duration::from_secs(5),
                    Some(&terminator),
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        terminator.fire();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Terminated);
        assert!(terminator.is_fired());
    }

    #[test]
    fn missed_wakeup_is_impossible_with_a_pre_read_snapshot() {
        let notifier = ChangeNotifier::new();
        let channels = watched(&["ABC"]);
        let snapshot = notifier.snapshot(&channels);
        // The change lands before the wait starts; the stale snapshot makes
        // the wait return immediately instead of sleeping through it.
        notifier.notify(["ABC"]);
        let outcome = notifier.wait_for_change(&channels, snapshot, Duration::from_secs(5), None);
        assert_eq!(outcome, WaitOutcome::Changed);
    }
}
