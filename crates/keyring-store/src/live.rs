//! Continuous queries.
//!
//! A [`LiveQuery`] pairs a read with the tables it depends on.  Each call to
//! [`LiveQuery::subscribe`] yields an independent [`Subscription`], a
//! `futures::Stream` that emits the current result and then a new one every
//! time a committed write touches one of those tables and changes the result.
//!
//! Invalidation is per table, publication is per value: a re-run whose
//! result equals the last emission is swallowed, so a write to another
//! channel's members never wakes a consumer watching this channel.
//!
//! Nothing is registered until the stream is first polled, and dropping the
//! stream deregisters it.  Subscribing again starts from scratch.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use rusqlite::Connection;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::invalidation::{InvalidationTracker, Registration};
use crate::pool::ReaderPool;
use crate::schema::Table;

type QueryFn<T> = dyn Fn(&Connection) -> Result<T> + Send + Sync;

/// A re-runnable read and the tables it depends on.  Cloning is cheap.
pub struct LiveQuery<T> {
    label: &'static str,
    tables: Arc<[Table]>,
    readers: ReaderPool,
    tracker: InvalidationTracker,
    coalesce: Duration,
    query: Arc<QueryFn<T>>,
}

impl<T> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            tables: Arc::clone(&self.tables),
            readers: self.readers.clone(),
            tracker: self.tracker.clone(),
            coalesce: self.coalesce,
            query: Arc::clone(&self.query),
        }
    }
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("label", &self.label)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> LiveQuery<T> {
    pub(crate) fn new<F>(
        label: &'static str,
        tables: &[Table],
        readers: ReaderPool,
        tracker: InvalidationTracker,
        coalesce: Duration,
        query: F,
    ) -> Self
    where
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            label,
            tables: tables.into(),
            readers,
            tracker,
            coalesce,
            query: Arc::new(query),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Run the query once on a blocking worker.
    pub async fn fetch(&self) -> Result<T> {
        let readers = self.readers.clone();
        let query = Arc::clone(&self.query);
        tokio::task::spawn_blocking(move || {
            let conn = readers.checkout()?;
            (*query)(&*conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl<T> LiveQuery<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Start a new subscription.
    pub fn subscribe(&self) -> Subscription<T> {
        let state = SubscriptionState {
            query: self.clone(),
            registration: None,
            last: None,
            finished: false,
        };
        Subscription {
            label: self.label,
            inner: stream::unfold(state, advance).boxed(),
        }
    }
}

/// Stream of results for one [`LiveQuery`].
///
/// Yields `Ok` snapshots indefinitely.  A failed re-run is yielded as `Err`
/// once and ends the stream.
pub struct Subscription<T> {
    label: &'static str,
    inner: BoxStream<'static, Result<T>>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct SubscriptionState<T> {
    query: LiveQuery<T>,
    registration: Option<Registration>,
    last: Option<T>,
    finished: bool,
}

async fn advance<T>(mut state: SubscriptionState<T>) -> Option<(Result<T>, SubscriptionState<T>)>
where
    T: Clone + PartialEq + Send + 'static,
{
    if state.finished {
        return None;
    }

    // Register before the first read so a commit racing it is not lost.
    let primed = state.registration.is_some();
    let query = &state.query;
    let registration = state.registration.get_or_insert_with(|| {
        debug!(query = query.label, "subscribing");
        query.tracker.register(&query.tables)
    });

    let mut wait = primed;
    loop {
        if wait {
            registration.invalidated().await;
            if !state.query.coalesce.is_zero() {
                tokio::time::sleep(state.query.coalesce).await;
            }
        }
        wait = true;
        registration.mark_seen();

        match state.query.fetch().await {
            Ok(value) => {
                if state.last.as_ref() == Some(&value) {
                    trace!(query = state.query.label, "result unchanged");
                    continue;
                }
                state.last = Some(value.clone());
                return Some((Ok(value), state));
            }
            Err(e) => {
                debug!(query = state.query.label, error = %e, "subscription failed");
                state.finished = true;
                return Some((Err(e), state));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelMember;
    use crate::test_support::{key, member, open_temp, open_temp_with};
    use crate::StoreConfig;

    const QUIET: Duration = Duration::from_millis(150);

    async fn next<T>(sub: &mut Subscription<T>) -> Result<T> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("subscription should emit")
            .expect("subscription should not end")
    }

    fn phones(members: &[ChannelMember]) -> Vec<&str> {
        members.iter().map(|m| m.phone_number.as_str()).collect()
    }

    #[tokio::test]
    async fn emits_initial_result_immediately() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        let mut sub = db.all_active_keys().subscribe();
        let keys = next(&mut sub).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, "k1");
    }

    #[tokio::test]
    async fn relevant_write_emits_and_unrelated_write_does_not() {
        let (_dir, db) = open_temp();
        let mut sub = db.members_for_channel("c1").subscribe();
        assert!(next(&mut sub).await.unwrap().is_empty());

        db.insert_member(&member("c1", "Ana", "+100")).unwrap();
        let members = next(&mut sub).await.unwrap();
        assert_eq!(phones(&members), vec!["+100"]);

        db.insert_member(&member("c2", "Ben", "+200")).unwrap();
        let spurious = tokio::time::timeout(QUIET, sub.next()).await;
        assert!(spurious.is_err(), "c2 write must not emit for c1");

        // Still live afterwards.
        db.insert_member(&member("c1", "Cy", "+300")).unwrap();
        let members = next(&mut sub).await.unwrap();
        assert_eq!(phones(&members), vec!["+100", "+300"]);
    }

    #[tokio::test]
    async fn writes_to_other_tables_are_ignored() {
        let (_dir, db) = open_temp();
        let mut sub = db.member_count("c1").subscribe();
        assert_eq!(next(&mut sub).await.unwrap(), 0);

        db.insert_key(&key("c1", "Alpha")).unwrap();
        assert!(tokio::time::timeout(QUIET, sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn registration_is_lazy_and_released_on_drop() {
        let (_dir, db) = open_temp();
        let tracker = db.tracker().clone();

        let mut sub = db.active_channel_count().subscribe();
        assert_eq!(tracker.observer_count(), 0);

        assert_eq!(next(&mut sub).await.unwrap(), 0);
        assert_eq!(tracker.observers_for(Table::Keyring), 1);

        drop(sub);
        assert_eq!(tracker.observer_count(), 0);
    }

    #[tokio::test]
    async fn burst_of_writes_is_delivered_once() {
        let config = StoreConfig::default().with_coalesce_window(Duration::from_millis(40));
        let (_dir, db) = open_temp_with(config);

        let mut sub = db.member_count("c1").subscribe();
        assert_eq!(next(&mut sub).await.unwrap(), 0);

        for i in 0..5 {
            db.insert_member(&member("c1", "Burst", &format!("+40{i}")))
                .unwrap();
        }

        assert_eq!(next(&mut sub).await.unwrap(), 5);
        assert!(tokio::time::timeout(QUIET, sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn subscribing_again_restarts_from_current_state() {
        let (_dir, db) = open_temp();
        let query = db.all_keys();

        let mut first = query.subscribe();
        assert!(next(&mut first).await.unwrap().is_empty());
        drop(first);

        db.insert_key(&key("k1", "Alpha")).unwrap();
        db.deactivate_key("k1").unwrap();

        let mut second = query.subscribe();
        let keys = next(&mut second).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(!keys[0].is_active);
    }

    #[tokio::test]
    async fn read_error_is_yielded_once_then_ends() {
        let (dir, db) = open_temp();
        db.insert_member(&member("c1", "Ana", "+100")).unwrap();

        let raw = Connection::open(dir.path().join("keyring.db")).unwrap();
        raw.execute("UPDATE channel_members SET role = 'OWNER'", [])
            .unwrap();
        drop(raw);

        let mut sub = db.members_for_channel("c1").subscribe();
        let err = next(&mut sub).await.unwrap_err();
        assert!(matches!(err, StoreError::Decoding { .. }), "{err:?}");
        assert!(sub.next().await.is_none());
        assert_eq!(db.tracker().observer_count(), 0);
    }

    #[tokio::test]
    async fn fetch_runs_once_without_registering() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        let count = db.active_channel_count().fetch().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.tracker().observer_count(), 0);
    }
}
