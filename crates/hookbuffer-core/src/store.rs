use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::{DebounceError, Revision, Thread, ThreadKey, ThreadUpdate, UpdateId, UpdateStatus};

/// A persistent store able to host the debounce engine.
///
/// Every consumer calls [`DebounceStore::begin`] on its own handle; the
/// returned transaction is the unit of atomicity and the owner of every
/// lock it acquires.
pub trait DebounceStore {
    type Transaction<'a>: DebounceTransaction
    where
        Self: 'a;

    /// Opens a new transaction.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] when the store is unreachable.
    fn begin(&self) -> Result<Self::Transaction<'_>, DebounceError>;
}

/// Locking and mutation primitives used by the engine.
///
/// Lock methods never wait on a lock held by another transaction: they
/// either acquire it immediately or report the row as unavailable.
/// Mutations are visible to the transaction that made them and to nobody
/// else until [`DebounceTransaction::commit`]. Dropping a transaction
/// without committing must behave like [`DebounceTransaction::rollback`].
pub trait DebounceTransaction {
    /// Locks one `pending` update that arrived at or before
    /// `due_at_or_before`, skipping rows locked elsewhere and rows whose
    /// thread is in `excluded_threads`. Oldest arrival first.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] on storage failure.
    fn lock_due_update(
        &mut self,
        due_at_or_before: OffsetDateTime,
        excluded_threads: &BTreeSet<ThreadKey>,
    ) -> Result<Option<ThreadUpdate>, DebounceError>;

    /// Locks the thread row for `key`, creating it first if absent.
    /// Returns `None` when another transaction holds it.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] on storage failure.
    fn try_lock_thread(&mut self, key: &ThreadKey) -> Result<Option<Thread>, DebounceError>;

    /// Returns every `pending` update of `key`, locking the ones not
    /// already locked elsewhere. Requires the thread lock.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] on storage failure.
    fn lock_pending_updates(&mut self, key: &ThreadKey)
        -> Result<Vec<ThreadUpdate>, DebounceError>;

    /// Stages a status for each id. A later call for the same id replaces
    /// the earlier one.
    ///
    /// # Errors
    /// Returns [`DebounceError::Validation`] when `status` is `pending`.
    fn set_status(&mut self, ids: &[UpdateId], status: UpdateStatus)
        -> Result<(), DebounceError>;

    /// Stages the thread's new last delivered revision.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] on storage failure.
    fn set_last_delivered_revision(
        &mut self,
        key: &ThreadKey,
        revision: Revision,
    ) -> Result<(), DebounceError>;

    /// Applies all staged mutations atomically and releases every lock.
    ///
    /// # Errors
    /// Returns [`DebounceError::LockLost`] when a thread lock expired and was
    /// taken over before commit, or [`DebounceError::Store`] on storage
    /// failure. Nothing is applied in either case.
    fn commit(self) -> Result<(), DebounceError>
    where
        Self: Sized;

    /// Discards staged mutations and releases every lock.
    ///
    /// # Errors
    /// Returns [`DebounceError::Store`] on storage failure.
    fn rollback(self) -> Result<(), DebounceError>
    where
        Self: Sized;
}
