//! Lease-based row locks. A lock is a `(lock_owner, lock_expires_at_ms)`
//! pair claimed with one conditional UPDATE; it never waits on another
//! holder. Writes are staged per transaction and applied in a single
//! `BEGIN IMMEDIATE` at commit.

use std::collections::{BTreeMap, BTreeSet};

use hookbuffer_core::{
    now_utc, unix_millis, DebounceError, DebounceStore, DebounceTransaction, Revision, Thread,
    ThreadKey, ThreadUpdate, UpdateId, UpdateStatus,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::{parse_thread_row, parse_update_row, SqliteUpdateStore, UPDATE_COLUMNS};

const LEASE_AVAILABLE: &str =
    "(lock_owner IS NULL OR lock_owner = :owner OR lock_expires_at_ms < :now_ms)";

impl DebounceStore for SqliteUpdateStore {
    type Transaction<'a> = SqliteTransaction<'a>;

    fn begin(&self) -> Result<Self::Transaction<'_>, DebounceError> {
        Ok(SqliteTransaction {
            conn: &self.conn,
            owner: Ulid::new().to_string(),
            lock_ttl: self.config.lock_ttl,
            staged_statuses: BTreeMap::new(),
            staged_revisions: BTreeMap::new(),
            locked_threads: BTreeSet::new(),
            finished: false,
        })
    }
}

/// One logical unit of work against [`SqliteUpdateStore`].
#[derive(Debug)]
pub struct SqliteTransaction<'a> {
    conn: &'a Connection,
    owner: String,
    lock_ttl: time::Duration,
    staged_statuses: BTreeMap<UpdateId, UpdateStatus>,
    staged_revisions: BTreeMap<ThreadKey, Revision>,
    locked_threads: BTreeSet<ThreadKey>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lease_window(&self) -> (i64, i64) {
        let now = now_utc();
        (unix_millis(now), unix_millis(now + self.lock_ttl))
    }

    fn staged_ids_json(&self) -> Result<String, DebounceError> {
        let ids: Vec<i64> = self.staged_statuses.keys().map(|id| id.0).collect();
        serde_json::to_string(&ids)
            .map_err(|err| DebounceError::Store(format!("failed to encode staged ids: {err}")))
    }

    fn release(&self) -> Result<(), DebounceError> {
        release_leases(self.conn, &self.owner)
    }
}

fn release_leases(conn: &Connection, owner: &str) -> Result<(), DebounceError> {
    conn.execute(
        "UPDATE thread_updates SET lock_owner = NULL, lock_expires_at_ms = NULL
         WHERE lock_owner = ?1",
        params![owner],
    )
    .map_err(store_error("release update leases"))?;
    conn.execute(
        "UPDATE threads SET lock_owner = NULL, lock_expires_at_ms = NULL
         WHERE lock_owner = ?1",
        params![owner],
    )
    .map_err(store_error("release thread leases"))?;
    Ok(())
}

fn store_error(step: &'static str) -> impl Fn(rusqlite::Error) -> DebounceError {
    move |err| DebounceError::Store(format!("failed to {step}: {err}"))
}

impl DebounceTransaction for SqliteTransaction<'_> {
    fn lock_due_update(
        &mut self,
        due_at_or_before: OffsetDateTime,
        excluded_threads: &BTreeSet<ThreadKey>,
    ) -> Result<Option<ThreadUpdate>, DebounceError> {
        let (now_ms, expires_ms) = self.lease_window();
        let excluded: Vec<[&str; 2]> = excluded_threads
            .iter()
            .map(|key| [key.webhook_name.as_str(), key.thread_id.as_str()])
            .collect();
        let excluded_json = serde_json::to_string(&excluded).map_err(|err| {
            DebounceError::Store(format!("failed to encode excluded threads: {err}"))
        })?;
        let staged_json = self.staged_ids_json()?;

        let sql = format!(
            "UPDATE thread_updates
             SET lock_owner = :owner, lock_expires_at_ms = :expires_ms
             WHERE id = (
               SELECT u.id FROM thread_updates u
               WHERE u.status = 'pending'
                 AND u.arrived_at_ms <= :due_ms
                 AND (u.lock_owner IS NULL OR u.lock_owner = :owner OR u.lock_expires_at_ms < :now_ms)
                 AND u.id NOT IN (SELECT value FROM json_each(:staged))
                 AND NOT EXISTS (
                   SELECT 1 FROM json_each(:excluded) ex
                   WHERE json_extract(ex.value, '$[0]') = u.webhook_name
                     AND json_extract(ex.value, '$[1]') = u.thread_id
                 )
               ORDER BY u.arrived_at_ms ASC, u.id ASC
               LIMIT 1
             )
               AND {LEASE_AVAILABLE}
             RETURNING {UPDATE_COLUMNS}"
        );

        let update = self
            .conn
            .query_row(
                &sql,
                rusqlite::named_params! {
                    ":owner": self.owner,
                    ":expires_ms": expires_ms,
                    ":due_ms": unix_millis(due_at_or_before),
                    ":now_ms": now_ms,
                    ":staged": staged_json,
                    ":excluded": excluded_json,
                },
                parse_update_row,
            )
            .optional()
            .map_err(store_error("lock due update"))?;

        if let Some(update) = &update {
            debug!(owner = %self.owner, update_id = %update.id, "update lease acquired");
        }
        Ok(update)
    }

    fn try_lock_thread(&mut self, key: &ThreadKey) -> Result<Option<Thread>, DebounceError> {
        let (now_ms, expires_ms) = self.lease_window();
        let created_at = hookbuffer_core::format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO threads(webhook_name, thread_id, last_delivered_revision, created_at)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT(webhook_name, thread_id) DO NOTHING",
                params![key.webhook_name, key.thread_id, created_at],
            )
            .map_err(store_error("ensure thread row"))?;

        let thread = self
            .conn
            .query_row(
                &format!(
                    "UPDATE threads
                     SET lock_owner = :owner, lock_expires_at_ms = :expires_ms
                     WHERE webhook_name = :webhook AND thread_id = :thread_id
                       AND {LEASE_AVAILABLE}
                     RETURNING webhook_name, thread_id, last_delivered_revision"
                ),
                rusqlite::named_params! {
                    ":owner": self.owner,
                    ":expires_ms": expires_ms,
                    ":webhook": key.webhook_name,
                    ":thread_id": key.thread_id,
                    ":now_ms": now_ms,
                },
                parse_thread_row,
            )
            .optional()
            .map_err(store_error("lock thread"))?;

        let Some(mut thread) = thread else {
            return Ok(None);
        };
        if let Some(staged) = self.staged_revisions.get(key) {
            thread.last_delivered_revision = thread.last_delivered_revision.max(Some(*staged));
        }
        self.locked_threads.insert(key.clone());
        Ok(Some(thread))
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
        let (now_ms, expires_ms) = self.lease_window();

        self.conn
            .execute(
                &format!(
                    "UPDATE thread_updates
                     SET lock_owner = :owner, lock_expires_at_ms = :expires_ms
                     WHERE webhook_name = :webhook AND thread_id = :thread_id
                       AND status = 'pending'
                       AND {LEASE_AVAILABLE}"
                ),
                rusqlite::named_params! {
                    ":owner": self.owner,
                    ":expires_ms": expires_ms,
                    ":webhook": key.webhook_name,
                    ":thread_id": key.thread_id,
                    ":now_ms": now_ms,
                },
            )
            .map_err(store_error("lock pending updates"))?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {UPDATE_COLUMNS} FROM thread_updates
                 WHERE webhook_name = ?1 AND thread_id = ?2 AND status = 'pending'
                 ORDER BY id ASC"
            ))
            .map_err(store_error("prepare pending updates query"))?;
        let rows = stmt
            .query_map(params![key.webhook_name, key.thread_id], parse_update_row)
            .map_err(store_error("query pending updates"))?;

        let mut pending = Vec::new();
        for row in rows {
            let update = row.map_err(store_error("read pending update"))?;
            if !self.staged_statuses.contains_key(&update.id) {
                pending.push(update);
            }
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
        let tx = rusqlite::Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(store_error("begin commit"))?;

        for key in &self.locked_threads {
            let holder: Option<String> = tx
                .query_row(
                    "SELECT lock_owner FROM threads WHERE webhook_name = ?1 AND thread_id = ?2",
                    params![key.webhook_name, key.thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error("verify thread lease"))?
                .flatten();

            if holder.as_deref() != Some(self.owner.as_str()) {
                warn!(
                    owner = %self.owner,
                    webhook = %key.webhook_name,
                    thread_id = %key.thread_id,
                    "thread lease lost before commit"
                );
                return Err(DebounceError::LockLost(format!(
                    "lock on thread {key} expired and was taken over"
                )));
            }
        }

        for (id, status) in &self.staged_statuses {
            tx.execute(
                "UPDATE thread_updates SET status = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.0, status.as_str()],
            )
            .map_err(store_error("apply update status"))?;
        }

        for (key, revision) in &self.staged_revisions {
            tx.execute(
                "UPDATE threads SET last_delivered_revision = ?3
                 WHERE webhook_name = ?1 AND thread_id = ?2
                   AND (last_delivered_revision IS NULL OR last_delivered_revision < ?3)",
                params![key.webhook_name, key.thread_id, revision.value()],
            )
            .map_err(store_error("apply last delivered revision"))?;
        }

        release_leases(&tx, &self.owner)?;
        tx.commit().map_err(store_error("commit"))?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), DebounceError> {
        self.finished = true;
        self.release()
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.release() {
            warn!(owner = %self.owner, error = %err, "failed to release leases");
        }
    }
}
