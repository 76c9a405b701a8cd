use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};

use serde_json::Value;
use time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    now_utc, DebounceError, DebounceStore, DebounceTransaction, Revision, Thread, ThreadKey,
    ThreadUpdate, UpdateId, UpdateStatus,
};

/// Buffer duration that makes every pending update immediately eligible.
pub const NO_BUFFER: Duration = Duration::ZERO;

/// Outcome of the coalescing rule for one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescePlan {
    /// The update to deliver, if any pending update is newer than the last
    /// delivered revision.
    pub chosen: Option<ThreadUpdate>,
    /// Every pending update at or below the delivered revision, including
    /// the chosen one.
    pub retired: Vec<UpdateId>,
}

/// Picks the newest pending update strictly above `last_delivered`.
///
/// Equal maximal revisions resolve to the lowest update id, i.e. the
/// earliest ingested one.
#[must_use]
pub fn coalesce(pending: &[ThreadUpdate], last_delivered: Option<Revision>) -> CoalescePlan {
    let pending_rows = || {
        pending
            .iter()
            .filter(|update| update.status == UpdateStatus::Pending)
    };

    let chosen = pending_rows()
        .filter(|update| last_delivered.map_or(true, |last| update.revision > last))
        .min_by(|lhs, rhs| {
            rhs.revision
                .cmp(&lhs.revision)
                .then_with(|| lhs.id.cmp(&rhs.id))
        })
        .cloned();

    let retired = match chosen.as_ref().map(|update| update.revision).or(last_delivered) {
        Some(cutoff) => pending_rows()
            .filter(|update| update.revision <= cutoff)
            .map(|update| update.id)
            .collect(),
        None => Vec::new(),
    };

    CoalescePlan { chosen, retired }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError<E> {
    /// The handler failed; its update is now `error`.
    #[error("update handler failed: {0}")]
    Handler(E),
    #[error(transparent)]
    Debounce(#[from] DebounceError),
    /// The handler failed and recording the failure failed too.
    #[error("update handler failed ({handler}); recording the failure also failed: {store}")]
    Finalize { store: DebounceError, handler: E },
}

/// Hands out at most one coalesced update per call, one consumer per thread.
#[derive(Debug)]
pub struct DebounceEngine<S> {
    store: S,
}

impl<S: DebounceStore> DebounceEngine<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Claims one thread with a pending update older than `buffer` and
    /// returns its newest pending update inside a scope that keeps the
    /// thread locked until finalized.
    ///
    /// `Ok(None)` means nothing is eligible right now.
    ///
    /// # Errors
    /// Returns [`DebounceError::Validation`] for a negative buffer and
    /// propagates store failures; no partial mutation survives them.
    pub fn acquire(&self, buffer: Duration) -> Result<Option<ScopedUpdate<'_, S>>, DebounceError> {
        if buffer.is_negative() {
            return Err(DebounceError::Validation(
                "buffer duration MUST be >= 0".to_string(),
            ));
        }

        let mut contended: BTreeSet<ThreadKey> = BTreeSet::new();

        loop {
            let due_at_or_before = now_utc() - buffer;
            let mut tx = self.store.begin()?;

            let Some(candidate) = tx.lock_due_update(due_at_or_before, &contended)? else {
                tx.rollback()?;
                debug!(contended = contended.len(), "no eligible update");
                return Ok(None);
            };

            let key = candidate.thread_key.clone();
            let Some(thread) = tx.try_lock_thread(&key)? else {
                tx.rollback()?;
                debug!(
                    webhook = %key.webhook_name,
                    thread_id = %key.thread_id,
                    update_id = %candidate.id,
                    "thread held by another consumer, trying next candidate"
                );
                contended.insert(key);
                continue;
            };

            let pending = tx.lock_pending_updates(&key)?;
            let plan = coalesce(&pending, thread.last_delivered_revision);
            if !plan.retired.is_empty() {
                tx.set_status(&plan.retired, UpdateStatus::Skipped)?;
            }

            let Some(chosen) = plan.chosen else {
                tx.commit()?;
                debug!(
                    webhook = %key.webhook_name,
                    thread_id = %key.thread_id,
                    retired = plan.retired.len(),
                    "only stale updates pending, retired them"
                );
                continue;
            };

            info!(
                webhook = %key.webhook_name,
                thread_id = %key.thread_id,
                update_id = %chosen.id,
                revision = %chosen.revision,
                superseded = plan.retired.len().saturating_sub(1),
                "claimed update"
            );

            return Ok(Some(ScopedUpdate {
                tx: Some(tx),
                thread,
                update: chosen,
            }));
        }
    }

    /// Runs `handler` on the next eligible update and finalizes it:
    /// `success` when the handler returns `Ok`, `error` otherwise.
    ///
    /// # Errors
    /// Returns [`ProcessError::Handler`] with the handler's error after the
    /// update was recorded as `error`, and [`ProcessError::Debounce`] or
    /// [`ProcessError::Finalize`] when the store fails.
    pub fn process<T, E, F>(&self, buffer: Duration, handler: F) -> Result<Option<T>, ProcessError<E>>
    where
        F: FnOnce(&ThreadUpdate) -> Result<T, E>,
        E: Display,
    {
        let Some(scope) = self.acquire(buffer)? else {
            return Ok(None);
        };

        match handler(scope.update()) {
            Ok(value) => {
                scope.complete()?;
                Ok(Some(value))
            }
            Err(handler_error) => {
                warn!(
                    update_id = %scope.update().id,
                    error = %handler_error,
                    "update handler failed"
                );
                match scope.fail() {
                    Ok(()) => Err(ProcessError::Handler(handler_error)),
                    Err(store) => Err(ProcessError::Finalize {
                        store,
                        handler: handler_error,
                    }),
                }
            }
        }
    }
}

/// A claimed update. The thread stays locked until [`ScopedUpdate::complete`]
/// or [`ScopedUpdate::fail`]; dropping the scope without either records the
/// update as failed.
pub struct ScopedUpdate<'a, S: DebounceStore + 'a> {
    tx: Option<S::Transaction<'a>>,
    thread: Thread,
    update: ThreadUpdate,
}

impl<'a, S: DebounceStore + 'a> ScopedUpdate<'a, S> {
    #[must_use]
    pub fn update(&self) -> &ThreadUpdate {
        &self.update
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.update.payload
    }

    /// The thread as it was when claimed, before this delivery.
    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    #[must_use]
    pub fn thread_key(&self) -> &ThreadKey {
        &self.update.thread_key
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.update.revision
    }

    /// Records successful delivery: the update becomes `success` and the
    /// thread's last delivered revision advances to it.
    ///
    /// # Errors
    /// Propagates store failures; the transaction is rolled back and the
    /// update stays `pending`.
    pub fn complete(mut self) -> Result<(), DebounceError> {
        let mut tx = self.take_transaction()?;
        tx.set_last_delivered_revision(&self.update.thread_key, self.update.revision)?;
        tx.set_status(&[self.update.id], UpdateStatus::Success)?;
        tx.commit()?;

        info!(
            webhook = %self.update.thread_key.webhook_name,
            thread_id = %self.update.thread_key.thread_id,
            update_id = %self.update.id,
            revision = %self.update.revision,
            "update delivered"
        );
        Ok(())
    }

    /// Records failed processing: the update becomes `error` and the
    /// thread's last delivered revision is left unchanged.
    ///
    /// # Errors
    /// Propagates store failures; the transaction is rolled back and the
    /// update stays `pending`.
    pub fn fail(mut self) -> Result<(), DebounceError> {
        let tx = self.take_transaction()?;
        record_failure(tx, &self.update)
    }

    fn take_transaction(&mut self) -> Result<S::Transaction<'a>, DebounceError> {
        self.tx.take().ok_or_else(|| {
            DebounceError::Store(format!("update {} was already finalized", self.update.id))
        })
    }
}

fn record_failure<T: DebounceTransaction>(
    mut tx: T,
    update: &ThreadUpdate,
) -> Result<(), DebounceError> {
    tx.set_status(&[update.id], UpdateStatus::Error)?;
    tx.commit()?;

    info!(
        webhook = %update.thread_key.webhook_name,
        thread_id = %update.thread_key.thread_id,
        update_id = %update.id,
        revision = %update.revision,
        "update recorded as failed"
    );
    Ok(())
}

impl<'a, S: DebounceStore + 'a> Drop for ScopedUpdate<'a, S> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        warn!(
            update_id = %self.update.id,
            panicking = std::thread::panicking(),
            "scoped update dropped without an outcome, recording failure"
        );
        if let Err(err) = record_failure(tx, &self.update) {
            error!(update_id = %self.update.id, error = %err, "failed to record dropped update");
        }
    }
}

impl<'a, S: DebounceStore + 'a> Debug for ScopedUpdate<'a, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedUpdate")
            .field("thread", &self.thread)
            .field("update", &self.update)
            .field("finalized", &self.tx.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::NewUpdate;

    fn must<T, E: Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn revision(value: f64) -> Revision {
        must(Revision::new(value))
    }

    fn append(store: &MemoryStore, thread_id: &str, value: f64) -> ThreadUpdate {
        must(store.append_update(&NewUpdate {
            thread_key: ThreadKey::new("test", thread_id),
            revision: revision(value),
            payload: json!({"thread_id": thread_id, "revision": value}),
        }))
    }

    fn statuses(store: &MemoryStore, thread_id: &str) -> Vec<(f64, UpdateStatus)> {
        must(store.updates_for(&ThreadKey::new("test", thread_id)))
            .into_iter()
            .map(|update| (update.revision.value(), update.status))
            .collect()
    }

    fn last_delivered(store: &MemoryStore, thread_id: &str) -> Option<f64> {
        must_some(must(store.thread(&ThreadKey::new("test", thread_id))))
            .last_delivered_revision
            .map(Revision::value)
    }

    fn fixture_update(id: i64, value: f64) -> ThreadUpdate {
        ThreadUpdate {
            id: UpdateId(id),
            thread_key: ThreadKey::new("test", "t"),
            revision: revision(value),
            payload: json!({}),
            arrived_at: now_utc(),
            status: UpdateStatus::Pending,
        }
    }

    #[test]
    fn coalesce_picks_max_revision_above_last_delivered() {
        let pending = vec![
            fixture_update(1, 3.0),
            fixture_update(2, 1.0),
            fixture_update(3, 5.0),
            fixture_update(4, 2.0),
        ];

        let plan = coalesce(&pending, Some(revision(2.5)));
        assert_eq!(must_some(plan.chosen).id, UpdateId(3));
        assert_eq!(
            plan.retired,
            vec![UpdateId(1), UpdateId(2), UpdateId(3), UpdateId(4)]
        );
    }

    proptest! {
        #[test]
        fn prop_coalesce_delivers_newest_and_retires_the_rest(
            revisions in prop::collection::vec(-5i32..15, 0..32),
            last in prop::option::of(-5i32..15),
        ) {
            let pending: Vec<ThreadUpdate> = revisions
                .iter()
                .zip(1_i64..)
                .map(|(value, id)| fixture_update(id, f64::from(*value)))
                .collect();
            let last_delivered = last.map(|value| revision(f64::from(value)));

            let plan = coalesce(&pending, last_delivered);
            let expected = revisions
                .iter()
                .copied()
                .filter(|value| last.map_or(true, |last| *value > last))
                .max();

            match (expected, &plan.chosen) {
                (None, None) => {}
                (Some(max), Some(chosen)) => {
                    prop_assert_eq!(chosen.revision, revision(f64::from(max)));
                    let first = revisions.iter().position(|value| *value == max);
                    prop_assert_eq!(first.and_then(|index| i64::try_from(index + 1).ok()), Some(chosen.id.0));
                    prop_assert!(plan.retired.contains(&chosen.id));
                }
                (expected, chosen) => {
                    prop_assert!(false, "expected max {:?}, chose {:?}", expected, chosen);
                }
            }

            let cutoff = plan.chosen.as_ref().map(|chosen| chosen.revision).or(last_delivered);
            for update in &pending {
                let retired = plan.retired.contains(&update.id);
                prop_assert_eq!(retired, cutoff.is_some_and(|cutoff| update.revision <= cutoff));
            }
        }
    }

    #[test]
    fn coalesce_breaks_revision_ties_by_lowest_id() {
        let pending = vec![
            fixture_update(7, 4.0),
            fixture_update(3, 4.0),
            fixture_update(5, 1.0),
        ];

        let plan = coalesce(&pending, None);
        assert_eq!(must_some(plan.chosen).id, UpdateId(3));
    }

    #[test]
    fn coalesce_retires_stale_rows_without_choosing() {
        let pending = vec![fixture_update(1, 1.0), fixture_update(2, 2.0)];

        let plan = coalesce(&pending, Some(revision(2.0)));
        assert!(plan.chosen.is_none());
        assert_eq!(plan.retired, vec![UpdateId(1), UpdateId(2)]);

        let empty = coalesce(&[], None);
        assert!(empty.chosen.is_none());
        assert!(empty.retired.is_empty());
    }

    #[test]
    fn out_of_order_revisions_deliver_only_the_newest() {
        let store = MemoryStore::new();
        for value in [3.0, 1.0, 5.0, 2.0, 4.0] {
            let _ = append(&store, "thread-3", value);
        }
        let engine = DebounceEngine::new(store.clone());

        let scope = must_some(must(engine.acquire(NO_BUFFER)));
        assert_eq!(scope.payload()["revision"], json!(5.0));
        assert_eq!(scope.thread().last_delivered_revision, None);
        must(scope.complete());

        let mut rows = statuses(&store, "thread-3");
        rows.sort_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
        assert_eq!(
            rows,
            vec![
                (1.0, UpdateStatus::Skipped),
                (2.0, UpdateStatus::Skipped),
                (3.0, UpdateStatus::Skipped),
                (4.0, UpdateStatus::Skipped),
                (5.0, UpdateStatus::Success),
            ]
        );
        assert_eq!(last_delivered(&store, "thread-3"), Some(5.0));
        assert!(must(engine.acquire(NO_BUFFER)).is_none());
    }

    #[test]
    fn stale_revision_after_delivery_is_skipped_and_yields_none() {
        let store = MemoryStore::new();
        let _ = append(&store, "thread-2", 2.0);
        let engine = DebounceEngine::new(store.clone());

        must(must_some(must(engine.acquire(NO_BUFFER))).complete());

        let _ = append(&store, "thread-2", 1.0);
        assert!(must(engine.acquire(NO_BUFFER)).is_none());
        assert_eq!(
            statuses(&store, "thread-2"),
            vec![(2.0, UpdateStatus::Success), (1.0, UpdateStatus::Skipped)]
        );
        assert_eq!(last_delivered(&store, "thread-2"), Some(2.0));
    }

    #[test]
    fn stale_thread_does_not_hide_work_on_other_threads() {
        let store = MemoryStore::new();
        let _ = append(&store, "stale", 2.0);
        let engine = DebounceEngine::new(store.clone());
        must(must_some(must(engine.acquire(NO_BUFFER))).complete());

        let _ = append(&store, "stale", 1.0);
        let _ = append(&store, "fresh", 1.0);

        let scope = must_some(must(engine.acquire(NO_BUFFER)));
        assert_eq!(scope.thread_key().thread_id, "fresh");
        must(scope.complete());
        assert_eq!(
            statuses(&store, "stale"),
            vec![(2.0, UpdateStatus::Success), (1.0, UpdateStatus::Skipped)]
        );
    }

    #[test]
    fn failed_processing_marks_error_and_keeps_last_revision() {
        let store = MemoryStore::new();
        let _ = append(&store, "thread-4", 1.0);
        let engine = DebounceEngine::new(store.clone());

        let result: Result<Option<()>, ProcessError<String>> =
            engine.process(NO_BUFFER, |_| Err("Processing failed".to_string()));
        match result {
            Err(ProcessError::Handler(message)) => assert_eq!(message, "Processing failed"),
            other => panic!("expected handler error, got {other:?}"),
        }

        assert_eq!(
            statuses(&store, "thread-4"),
            vec![(1.0, UpdateStatus::Error)]
        );
        assert_eq!(last_delivered(&store, "thread-4"), None);
        assert!(must(engine.acquire(NO_BUFFER)).is_none());
    }

    #[test]
    fn newer_update_after_failure_is_delivered() {
        let store = MemoryStore::new();
        let _ = append(&store, "t", 1.0);
        let engine = DebounceEngine::new(store.clone());
        must(must_some(must(engine.acquire(NO_BUFFER))).fail());

        let _ = append(&store, "t", 2.0);
        let delivered = must(engine.process(NO_BUFFER, |update| {
            Ok::<_, String>(update.revision.value())
        }));
        assert_eq!(delivered, Some(2.0));
        assert_eq!(
            statuses(&store, "t"),
            vec![(1.0, UpdateStatus::Error), (2.0, UpdateStatus::Success)]
        );
        assert_eq!(last_delivered(&store, "t"), Some(2.0));
    }

    #[test]
    fn dropping_scope_records_error() {
        let store = MemoryStore::new();
        let _ = append(&store, "t", 1.0);
        let engine = DebounceEngine::new(store.clone());

        {
            let scope = must_some(must(engine.acquire(NO_BUFFER)));
            assert_eq!(scope.revision().value(), 1.0);
        }

        assert_eq!(statuses(&store, "t"), vec![(1.0, UpdateStatus::Error)]);
        assert_eq!(last_delivered(&store, "t"), None);
    }

    #[test]
    fn panicking_handler_records_error() {
        let store = MemoryStore::new();
        let _ = append(&store, "t", 1.0);
        let engine = DebounceEngine::new(store.clone());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = engine.process(NO_BUFFER, |_| -> Result<(), String> {
                panic!("handler blew up")
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(statuses(&store, "t"), vec![(1.0, UpdateStatus::Error)]);
    }

    #[test]
    fn buffer_excludes_recent_arrivals() {
        let store = MemoryStore::new();
        let _ = append(&store, "t", 1.0);
        let engine = DebounceEngine::new(store.clone());

        assert!(must(engine.acquire(Duration::hours(1))).is_none());
        assert_eq!(statuses(&store, "t"), vec![(1.0, UpdateStatus::Pending)]);

        let aged = must(store.append_update_at(
            &NewUpdate {
                thread_key: ThreadKey::new("test", "aged"),
                revision: revision(1.0),
                payload: json!({}),
            },
            now_utc() - Duration::hours(2),
        ));
        let scope = must_some(must(engine.acquire(Duration::hours(1))));
        assert_eq!(scope.update().id, aged.id);
        must(scope.complete());
    }

    #[test]
    fn buffered_candidate_still_coalesces_with_recent_siblings() {
        let store = MemoryStore::new();
        let key = ThreadKey::new("test", "t");
        let _ = must(store.append_update_at(
            &NewUpdate {
                thread_key: key.clone(),
                revision: revision(1.0),
                payload: json!({"revision": 1.0}),
            },
            now_utc() - Duration::minutes(10),
        ));
        let _ = append(&store, "t", 2.0);
        let engine = DebounceEngine::new(store.clone());

        let scope = must_some(must(engine.acquire(Duration::minutes(5))));
        assert_eq!(scope.revision().value(), 2.0);
        must(scope.complete());
    }

    #[test]
    fn negative_buffer_is_rejected() {
        let engine = DebounceEngine::new(MemoryStore::new());
        assert!(matches!(
            engine.acquire(Duration::seconds(-1)),
            Err(DebounceError::Validation(_))
        ));
    }

    #[test]
    fn held_thread_is_skipped_in_favor_of_other_threads() {
        let store = MemoryStore::new();
        let _ = append(&store, "a", 1.0);
        let _ = append(&store, "b", 1.0);
        let first = DebounceEngine::new(store.clone());
        let second = DebounceEngine::new(store.clone());

        let held = must_some(must(first.acquire(NO_BUFFER)));
        assert_eq!(held.thread_key().thread_id, "a");

        let _ = append(&store, "a", 2.0);
        let other = must_some(must(second.acquire(NO_BUFFER)));
        assert_eq!(other.thread_key().thread_id, "b");
        assert!(must(second.acquire(NO_BUFFER)).is_none());

        must(other.complete());
        must(held.complete());

        let next = must_some(must(second.acquire(NO_BUFFER)));
        assert_eq!(next.thread_key().thread_id, "a");
        assert_eq!(next.revision().value(), 2.0);
        must(next.complete());
        assert_eq!(last_delivered(&store, "a"), Some(2.0));
    }

    #[test]
    fn concurrent_consumers_receive_a_thread_at_most_once() {
        const CONSUMERS: usize = 8;

        let store = MemoryStore::new();
        let _ = append(&store, "only", 1.0);
        let start = Arc::new(Barrier::new(CONSUMERS));
        let attempted = Arc::new(Barrier::new(CONSUMERS));

        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let engine = DebounceEngine::new(store.clone());
                let start = Arc::clone(&start);
                let attempted = Arc::clone(&attempted);
                std::thread::spawn(move || {
                    start.wait();
                    let scope = must(engine.acquire(NO_BUFFER));
                    let received = scope.as_ref().map(|item| item.update().id);
                    attempted.wait();
                    if let Some(scope) = scope {
                        must(scope.complete());
                    }
                    received
                })
            })
            .collect();

        let received: Vec<UpdateId> = handles
            .into_iter()
            .filter_map(|handle| match handle.join() {
                Ok(value) => value,
                Err(err) => panic!("consumer thread panicked: {err:?}"),
            })
            .collect();

        assert_eq!(received.len(), 1);
        assert_eq!(statuses(&store, "only"), vec![(1.0, UpdateStatus::Success)]);
    }
}
