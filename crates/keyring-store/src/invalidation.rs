//! Table-change bus for continuous queries.
//!
//! An [`InvalidationTracker`] maps each [`Table`] to the registrations that
//! depend on it.  The transactional writer calls [`record_write`] once per
//! committed transaction; every registration whose table set intersects the
//! written set has its version counter bumped.  Counters live in
//! `tokio::sync::watch` channels, so several commits landing before a
//! subscriber wakes up collapse into a single pending change.
//!
//! The tracker is an ordinary value owned by one [`Database`]; independent
//! databases never see each other's writes.
//!
//! [`record_write`]: InvalidationTracker::record_write
//! [`Database`]: crate::Database

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::schema::Table;

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    observers: HashMap<u64, watch::Sender<u64>>,
    by_table: HashMap<Table, HashSet<u64>>,
}

/// Shared handle to the change bus.  Cloning is cheap.
#[derive(Clone, Default)]
pub struct InvalidationTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `tables`.  The registration stays active until
    /// the returned guard is dropped.
    pub fn register(&self, tables: &[Table]) -> Registration {
        let tables: BTreeSet<Table> = tables.iter().copied().collect();
        let (tx, rx) = watch::channel(0u64);

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.observers.insert(id, tx);
        for table in &tables {
            state.by_table.entry(*table).or_default().insert(id);
        }
        drop(state);

        debug!(observer = id, ?tables, "registered table observer");

        Registration {
            id,
            tables,
            rx,
            tracker: self.clone(),
        }
    }

    /// Mark `tables` as changed by a committed transaction.
    pub fn record_write(&self, tables: &[Table]) {
        let state = self.lock();

        let mut targets: HashSet<u64> = HashSet::new();
        for table in tables {
            if let Some(ids) = state.by_table.get(table) {
                targets.extend(ids);
            }
        }

        for id in &targets {
            if let Some(tx) = state.observers.get(id) {
                tx.send_modify(|version| *version = version.wrapping_add(1));
            }
        }

        trace!(?tables, notified = targets.len(), "recorded write");
    }

    /// Number of live registrations.
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Number of live registrations depending on `table`.
    pub fn observers_for(&self, table: Table) -> usize {
        self.lock().by_table.get(&table).map_or(0, HashSet::len)
    }

    fn deregister(&self, id: u64, tables: &BTreeSet<Table>) {
        let mut state = self.lock();
        state.observers.remove(&id);
        for table in tables {
            if let Some(ids) = state.by_table.get_mut(table) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.by_table.remove(table);
                }
            }
        }
        drop(state);
        debug!(observer = id, "deregistered table observer");
    }

    // Poisoning is ignored: no mutation spans a panic point.
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Guard for one registration.  Dropping it deregisters.
pub struct Registration {
    id: u64,
    tables: BTreeSet<Table>,
    rx: watch::Receiver<u64>,
    tracker: InvalidationTracker,
}

impl Registration {
    pub fn tables(&self) -> impl Iterator<Item = Table> + '_ {
        self.tables.iter().copied()
    }

    /// Wait until a write touching one of the registered tables commits.
    ///
    /// Returns immediately if such a write happened since the last call (or
    /// since [`mark_seen`](Self::mark_seen)); any number of intervening writes
    /// count as one.
    pub async fn invalidated(&mut self) {
        // The sender lives in the tracker until this guard is dropped, so
        // `changed` cannot observe a closed channel here.
        let _ = self.rx.changed().await;
    }

    /// Whether a relevant write is pending.
    pub fn is_invalidated(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Acknowledge all writes recorded so far.
    pub fn mark_seen(&mut self) {
        let _ = self.rx.borrow_and_update();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.deregister(self.id, &self.tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_intersecting_registrations_are_invalidated() {
        let tracker = InvalidationTracker::new();
        let keys = tracker.register(&[Table::Keyring]);
        let members = tracker.register(&[Table::ChannelMembers]);
        let both = tracker.register(&[Table::Keyring, Table::ChannelMembers]);

        tracker.record_write(&[Table::ChannelMembers]);

        assert!(!keys.is_invalidated());
        assert!(members.is_invalidated());
        assert!(both.is_invalidated());
    }

    #[test]
    fn dropping_a_registration_deregisters_it() {
        let tracker = InvalidationTracker::new();
        let a = tracker.register(&[Table::Keyring, Table::ChannelMembers]);
        let b = tracker.register(&[Table::Keyring]);
        assert_eq!(tracker.observer_count(), 2);
        assert_eq!(tracker.observers_for(Table::Keyring), 2);

        drop(a);
        assert_eq!(tracker.observer_count(), 1);
        assert_eq!(tracker.observers_for(Table::ChannelMembers), 0);

        drop(b);
        assert_eq!(tracker.observer_count(), 0);
        // Writes with nobody listening are fine.
        tracker.record_write(&Table::ALL);
    }

    #[test]
    fn independent_trackers_do_not_share_writes() {
        let first = InvalidationTracker::new();
        let second = InvalidationTracker::new();
        let reg = second.register(&[Table::Keyring]);

        first.record_write(&[Table::Keyring]);
        assert!(!reg.is_invalidated());
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_change() {
        let tracker = InvalidationTracker::new();
        let mut reg = tracker.register(&[Table::Keyring]);

        for _ in 0..10 {
            tracker.record_write(&[Table::Keyring]);
        }

        tokio::time::timeout(Duration::from_millis(100), reg.invalidated())
            .await
            .expect("pending change should be delivered");
        assert!(!reg.is_invalidated());

        let second = tokio::time::timeout(Duration::from_millis(50), reg.invalidated()).await;
        assert!(second.is_err(), "burst must not be delivered twice");
    }

    #[test]
    fn mark_seen_clears_pending_change() {
        let tracker = InvalidationTracker::new();
        let mut reg = tracker.register(&[Table::ChannelMembers]);
        tracker.record_write(&[Table::ChannelMembers]);
        assert!(reg.is_invalidated());

        reg.mark_seen();
        assert!(!reg.is_invalidated());
    }
}
