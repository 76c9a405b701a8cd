//! An in-process [`DebounceStore`] with the same lease semantics as the
//! SQLite store. Useful for tests and for embedding the engine without a
//! database file.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::{
    now_utc, DebounceError, DebounceStore, DebounceTransaction, NewUpdate, Revision, Thread,
    ThreadKey, ThreadUpdate, UpdateId, UpdateStatus,
};

/// Default lifetime of a lock held by an unfinished transaction.
pub const DEFAULT_LOCK_TTL: Duration = Duration::minutes(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    owner: u64,
    expires_at: OffsetDateTime,
}

impl Lease {
    fn blocks(self, owner: u64, now: OffsetDateTime) -> bool {
        self.owner != owner && self.expires_at >= now
    }
}

#[derive(Debug)]
struct StoredUpdate {
    update: ThreadUpdate,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct StoredThread {
    last_delivered_revision: Option<Revision>,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    next_owner: u64,
    updates: BTreeMap<UpdateId, StoredUpdate>,
    threads: BTreeMap<ThreadKey, StoredThread>,
}

impl MemoryState {
    fn release(&mut self, owner: u64) {
        let leases = self
            .updates
            .values_mut()
            .map(|stored| &mut stored.lease)
            .chain(self.threads.values_mut().map(|stored| &mut stored.lease));
        for lease in leases {
            if lease.is_some_and(|held| held.owner == owner) {
                *lease = None;
            }
        }
    }
}

/// Shared in-memory store. Clones share state, so each consumer can hold
/// its own handle.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lock_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// A store whose locks expire `lock_ttl` after they are taken.
    ///
    /// # Errors
    /// Returns [`DebounceError::Configuration`] unless `lock_ttl` is positive.
    pub fn with_lock_ttl(lock_ttl: Duration) -> Result<Self, DebounceError> {
        if !lock_ttl.is_positive() {
            return Err(DebounceError::Configuration(
                "lock_ttl MUST be > 0".to_string(),
            ));
        }
        Ok(Self {
            lock_ttl,
            ..Self::new()
        })
    }

    /// Appends a `pending` update arriving now.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] if the state lock is poisoned.
    pub fn append_update(&self, new: &NewUpdate) -> Result<ThreadUpdate, DebounceError> {
        self.append_update_at(new, now_utc())
    }

    /// Appends a `pending` update with an explicit arrival time.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] if the state lock is poisoned.
    pub fn append_update_at(
        &self,
        new: &NewUpdate,
        arrived_at: OffsetDateTime,
    ) -> Result<ThreadUpdate, DebounceError> {
        let mut state = self.lock_state()?;
        state.next_id += 1;
        let update = ThreadUpdate {
            id: UpdateId(state.next_id),
            thread_key: new.thread_key.clone(),
            revision: new.revision,
            payload: new.payload.clone(),
            arrived_at,
            status: UpdateStatus::Pending,
        };
        state
            .threads
            .entry(new.thread_key.clone())
            .or_default();
        state.updates.insert(
            update.id,
            StoredUpdate {
                update: update.clone(),
                lease: None,
            },
        );
        Ok(update)
    }

    /// # Errors
    /// Returns [`DebounceError::Store`] if the state lock is poisoned.
    pub fn thread(&self, key: &ThreadKey) -> Result<Option<Thread>, DebounceError> {
        let state = self.lock_state()?;
        Ok(state.threads.get(key).map(|stored| Thread {
            key: key.clone(),
            last_delivered_revision: stored.last_delivered_revision,
        }))
    }

    /// Every update of `key` in ingestion order.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] if the state lock is poisoned.
    pub fn updates_for(&self, key: &ThreadKey) -> Result<Vec<ThreadUpdate>, DebounceError> {
        let state = self.lock_state()?;
        Ok(state
            .updates
            .values()
            .filter(|stored| &stored.update.thread_key == key)
            .map(|stored| stored.update.clone())
            .collect())
    }

    /// # Errors
    /// Returns [`DebounceError::Store`] if the state lock is poisoned.
    pub fn update(&self, id: UpdateId) -> Result<Option<ThreadUpdate>, DebounceError> {
        let state = self.lock_state()?;
        Ok(state.updates.get(&id).map(|stored| stored.update.clone()))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MemoryState>, DebounceError> {
        self.state
            .lock()
            .map_err(|_| DebounceError::Store("memory store state lock poisoned".to_string()))
    }
}

impl DebounceStore for MemoryStore {
    type Transaction<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> Result<Self::Transaction<'_>, DebounceError> {
        let owner = {
            let mut state = self.lock_state()?;
            state.next_owner += 1;
            state.next_owner
        };

        Ok(MemoryTransaction {
            store: self,
            owner,
            staged_statuses: BTreeMap::new(),
            staged_revisions: BTreeMap::new(),
            locked_threads: BTreeSet::new(),
            finished: false,
        })
    }
}

#[derive(Debug)]
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    owner: u64,
    staged_statuses: BTreeMap<UpdateId, UpdateStatus>,
    staged_revisions: BTreeMap<ThreadKey, Revision>,
    locked_threads: BTreeSet<ThreadKey>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn lease(&self, now: OffsetDateTime) -> Lease {
        Lease {
            owner: self.owner,
            expires_at: now + self.store.lock_ttl,
        }
    }

    fn effective(&self, update: &ThreadUpdate) -> ThreadUpdate {
        let mut visible = update.clone();
        if let Some(status) = self.staged_statuses.get(&update.id) {
            visible.status = *status;
        }
        visible
    }

    fn finish(&mut self) -> Result<(), DebounceError> {
        self.finished = true;
        let mut state = self.store.lock_state()?;
        state.release(self.owner);
        Ok(())
    }
}

impl DebounceTransaction for MemoryTransaction<'_> {
    fn lock_due_update(
        &mut self,
        due_at_or_before: OffsetDateTime,
        excluded_threads: &BTreeSet<ThreadKey>,
    ) -> Result<Option<ThreadUpdate>, DebounceError> {
        let now = now_utc();
        let lease = self.lease(now);
        let owner = self.owner;
        let mut state = self.store.lock_state()?;

        let candidate = state
            .updates
            .values()
            .filter(|stored| {
                let visible_status = self
                    .staged_statuses
                    .get(&stored.update.id)
                    .copied()
                    .unwrap_or(stored.update.status);
                visible_status == UpdateStatus::Pending
                    && stored.update.arrived_at <= due_at_or_before
                    && !stored.lease.is_some_and(|held| held.blocks(owner, now))
                    && !excluded_threads.contains(&stored.update.thread_key)
            })
            .min_by_key(|stored| (stored.update.arrived_at, stored.update.id))
            .map(|stored| stored.update.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(stored) = state.updates.get_mut(&id) else {
            return Ok(None);
        };
        stored.lease = Some(lease);
        let update = stored.update.clone();
        drop(state);

        Ok(Some(self.effective(&update)))
    }

    fn try_lock_thread(&mut self, key: &ThreadKey) -> Result<Option<Thread>, DebounceError> {
        let now = now_utc();
        let lease = self.lease(now);
        let owner = self.owner;
        let mut state = self.store.lock_state()?;

        let stored = state.threads.entry(key.clone()).or_default();
        if stored.lease.is_some_and(|held| held.blocks(owner, now)) {
            return Ok(None);
        }
        stored.lease = Some(lease);
        let last_delivered_revision = self
            .staged_revisions
            .get(key)
            .copied()
            .max(stored.last_delivered_revision);
        drop(state);

        self.locked_threads.insert(key.clone());
        Ok(Some(Thread {
            key: key.clone(),
            last_delivered_revision,
        }))
    }

    fn lock_pending_updates(
        &mut self,
        key: &ThreadKey,
    ) -> Result<Vec<ThreadUpdate>, DebounceError> {
        if !self.locked_threads.contains(key) {
            return Err(DebounceError::Store(format!(
                "thread {key} MUST be locked before its updates"
            )));
        }

        let now = now_utc();
        let lease = self.lease(now);
        let owner = self.owner;
        let mut state = self.store.lock_state()?;

        let mut pending = Vec::new();
        for stored in state.updates.values_mut() {
            if &stored.update.thread_key != key {
                continue;
            }
            let visible = self.effective(&stored.update);
            if visible.status != UpdateStatus::Pending {
                continue;
            }
            if !stored.lease.is_some_and(|held| held.blocks(owner, now)) {
                stored.lease = Some(lease);
            }
            pending.push(visible);
        }
        Ok(pending)
    }

    fn set_status(&mut self, ids: &[UpdateId], status: UpdateStatus) -> Result<(), DebounceError> {
        if status == UpdateStatus::Pending {
            return Err(DebounceError::Validation(
                "status transitions MUST target a terminal status".to_string(),
            ));
        }
        for id in ids {
            self.staged_statuses.insert(*id, status);
        }
        Ok(())
    }

    fn set_last_delivered_revision(
        &mut self,
        key: &ThreadKey,
        revision: Revision,
    ) -> Result<(), DebounceError> {
        self.staged_revisions.insert(key.clone(), revision);
        Ok(())
    }

    fn commit(mut self) -> Result<(), DebounceError> {
        let mut state = self.store.lock_state()?;

        let lost = self
            .locked_threads
            .iter()
            .find(|key| {
                !state
                    .threads
                    .get(*key)
                    .and_then(|stored| stored.lease)
                    .is_some_and(|held| held.owner == self.owner)
            })
            .cloned();
        if let Some(key) = lost {
            drop(state);
            self.finish()?;
            return Err(DebounceError::LockLost(format!(
                "lock on thread {key} expired and was taken over"
            )));
        }

        for (id, status) in &self.staged_statuses {
            if let Some(stored) = state.updates.get_mut(id) {
                if stored.update.status == UpdateStatus::Pending {
                    stored.update.status = *status;
                }
            }
        }
        for (key, revision) in &self.staged_revisions {
            let stored = state.threads.entry(key.clone()).or_default();
            if stored.last_delivered_revision.map_or(true, |last| *revision > last) {
                stored.last_delivered_revision = Some(*revision);
            }
        }

        state.release(self.owner);
        drop(state);
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), DebounceError> {
        self.finish()
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.finish() {
            warn!(owner = self.owner, error = %err, "failed to release leases");
        }
    }
}
