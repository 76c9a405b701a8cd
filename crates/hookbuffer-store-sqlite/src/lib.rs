#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hookbuffer_core::{
    format_rfc3339, from_unix_millis, now_utc, resolve_update, unix_millis, DebounceError,
    NewUpdate, Revision, Thread, ThreadKey, ThreadUpdate, UpdateId, UpdateStatus, WebhookConfig,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

mod lease;

pub use lease::SqliteTransaction;

const SCHEMA_MIGRATION_VERSION: i64 = 1;
const MAX_PER_PAGE: u32 = 500;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS webhooks (
  name TEXT PRIMARY KEY CHECK (length(name) > 0),
  thread_id_path_json TEXT NOT NULL,
  revision_path_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS threads (
  webhook_name TEXT NOT NULL,
  thread_id TEXT NOT NULL,
  last_delivered_revision REAL,
  created_at TEXT NOT NULL,
  lock_owner TEXT,
  lock_expires_at_ms INTEGER,
  PRIMARY KEY (webhook_name, thread_id)
);

CREATE TABLE IF NOT EXISTS thread_updates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  webhook_name TEXT NOT NULL,
  thread_id TEXT NOT NULL,
  revision REAL NOT NULL,
  payload_json TEXT NOT NULL,
  arrived_at_ms INTEGER NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending' CHECK (
    status IN ('pending', 'skipped', 'success', 'error')
  ),
  lock_owner TEXT,
  lock_expires_at_ms INTEGER,
  FOREIGN KEY (webhook_name, thread_id) REFERENCES threads(webhook_name, thread_id)
);

CREATE TRIGGER IF NOT EXISTS trg_thread_updates_terminal_status
BEFORE UPDATE OF status ON thread_updates
WHEN OLD.status <> 'pending'
BEGIN
  SELECT RAISE(FAIL, 'thread_updates status is terminal once it leaves pending');
END;

CREATE TRIGGER IF NOT EXISTS trg_thread_updates_content_immutable
BEFORE UPDATE OF webhook_name, thread_id, revision, payload_json, arrived_at_ms ON thread_updates
BEGIN
  SELECT RAISE(FAIL, 'thread_updates content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_threads_revision_monotonic
BEFORE UPDATE OF last_delivered_revision ON threads
WHEN OLD.last_delivered_revision IS NOT NULL
  AND (
    NEW.last_delivered_revision IS NULL
    OR NEW.last_delivered_revision < OLD.last_delivered_revision
  )
BEGIN
  SELECT RAISE(FAIL, 'threads.last_delivered_revision never decreases');
END;

CREATE INDEX IF NOT EXISTS idx_thread_updates_status_arrival
  ON thread_updates(status, arrived_at_ms, id);
CREATE INDEX IF NOT EXISTS idx_thread_updates_thread_status
  ON thread_updates(webhook_name, thread_id, status);
CREATE INDEX IF NOT EXISTS idx_thread_updates_lock_owner
  ON thread_updates(lock_owner);
CREATE INDEX IF NOT EXISTS idx_threads_lock_owner
  ON threads(lock_owner);
";

const UPDATE_COLUMNS: &str =
    "id, webhook_name, thread_id, revision, payload_json, arrived_at_ms, status";

/// Tuning for the lease-based locks and the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a lock survives a holder that never commits or rolls back.
    /// MUST be positive.
    ///
    /// A consumer that keeps its scope open longer than this can be taken
    /// over: a second consumer may then claim the same thread and run its
    /// handler concurrently. Only the stale holder's commit fails, with
    /// [`DebounceError::LockLost`], so size it above the slowest handler.
    pub lock_ttl: time::Duration,
    pub busy_timeout: std::time::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl: time::Duration::minutes(15),
            busy_timeout: std::time::Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), DebounceError> {
        if !self.lock_ttl.is_positive() {
            return Err(DebounceError::Configuration(
                "lock_ttl MUST be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filters and paging for [`SqliteUpdateStore::list_updates`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQuery {
    pub webhook_name: Option<String>,
    pub thread_id: Option<String>,
    pub status: Option<UpdateStatus>,
    pub page: u32,
    pub per_page: u32,
    pub newest_first: bool,
}

impl Default for UpdateQuery {
    fn default() -> Self {
        Self {
            webhook_name: None,
            thread_id: None,
            status: None,
            page: 1,
            per_page: 50,
            newest_first: true,
        }
    }
}

impl UpdateQuery {
    pub fn validate(&self) -> Result<(), DebounceError> {
        if self.page == 0 {
            return Err(DebounceError::Validation("page MUST be >= 1".to_string()));
        }
        if !(1..=MAX_PER_PAGE).contains(&self.per_page) {
            return Err(DebounceError::Validation(format!(
                "per_page MUST be between 1 and {MAX_PER_PAGE}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePage {
    pub updates: Vec<ThreadUpdate>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
}

/// SQLite-backed update buffer. One value per connection; open one per
/// consumer thread against the same file.
pub struct SqliteUpdateStore {
    conn: Connection,
    config: StoreConfig,
}

impl SqliteUpdateStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid store configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(config.busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply hookbuffer schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register hookbuffer schema migration")?;

        Ok(())
    }

    pub fn register_webhook(&self, webhook: &WebhookConfig) -> Result<()> {
        webhook
            .validate()
            .map_err(|err| anyhow!("invalid webhook configuration: {err}"))?;

        let thread_id_path = serde_json::to_string(&webhook.thread_id_path)
            .context("failed to serialize thread_id_path")?;
        let revision_path = serde_json::to_string(&webhook.revision_path)
            .context("failed to serialize revision_path")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO webhooks(name, thread_id_path_json, revision_path_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                   thread_id_path_json = excluded.thread_id_path_json,
                   revision_path_json = excluded.revision_path_json,
                   updated_at = excluded.updated_at",
                params![webhook.name, thread_id_path, revision_path, now],
            )
            .with_context(|| format!("failed to register webhook {}", webhook.name))?;

        debug!(webhook = %webhook.name, "webhook registered");
        Ok(())
    }

    pub fn get_webhook(&self, name: &str) -> Result<Option<WebhookConfig>> {
        self.conn
            .query_row(
                "SELECT name, thread_id_path_json, revision_path_json FROM webhooks WHERE name = ?1",
                params![name],
                parse_webhook_row,
            )
            .optional()
            .with_context(|| format!("failed to read webhook {name}"))
    }

    pub fn list_webhooks(&self) -> Result<Vec<WebhookConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, thread_id_path_json, revision_path_json FROM webhooks ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], parse_webhook_row)?;
        collect_rows(rows)
    }

    /// Buffers one update arriving now.
    pub fn append_update(&self, update: &NewUpdate) -> Result<ThreadUpdate> {
        self.append_update_at(update, now_utc())
    }

    /// Buffers one update with an explicit arrival time.
    pub fn append_update_at(
        &self,
        update: &NewUpdate,
        arrived_at: OffsetDateTime,
    ) -> Result<ThreadUpdate> {
        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let payload_json =
            serde_json::to_string(&update.payload).context("failed to serialize payload")?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        tx.execute(
            "INSERT INTO threads(webhook_name, thread_id, last_delivered_revision, created_at)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(webhook_name, thread_id) DO NOTHING",
            params![
                update.thread_key.webhook_name,
                update.thread_key.thread_id,
                created_at
            ],
        )
        .context("failed to ensure thread row")?;

        tx.execute(
            "INSERT INTO thread_updates(
                webhook_name, thread_id, revision, payload_json, arrived_at_ms, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                update.thread_key.webhook_name,
                update.thread_key.thread_id,
                update.revision.value(),
                payload_json,
                unix_millis(arrived_at),
            ],
        )
        .context("failed to append thread update")?;

        let id = UpdateId(tx.last_insert_rowid());
        tx.commit().context("failed to commit append transaction")?;

        debug!(
            webhook = %update.thread_key.webhook_name,
            thread_id = %update.thread_key.thread_id,
            update_id = %id,
            revision = %update.revision,
            "update buffered"
        );

        Ok(ThreadUpdate {
            id,
            thread_key: update.thread_key.clone(),
            revision: update.revision,
            payload: update.payload.clone(),
            arrived_at: from_unix_millis(unix_millis(arrived_at))
                .map_err(|err| anyhow!(err.to_string()))?,
            status: UpdateStatus::Pending,
        })
    }

    /// Resolves `payload` through the named webhook's paths and buffers it.
    pub fn ingest(&self, webhook_name: &str, payload: serde_json::Value) -> Result<ThreadUpdate> {
        let webhook = self.get_webhook(webhook_name)?.ok_or_else(|| {
            anyhow::Error::new(DebounceError::NotFound(format!(
                "webhook {webhook_name} is not registered"
            )))
        })?;

        let received_at = now_utc();
        let update = resolve_update(&webhook, payload, received_at);
        self.append_update_at(&update, received_at)
    }

    pub fn get_thread(&self, key: &ThreadKey) -> Result<Option<Thread>> {
        self.conn
            .query_row(
                "SELECT webhook_name, thread_id, last_delivered_revision
                 FROM threads WHERE webhook_name = ?1 AND thread_id = ?2",
                params![key.webhook_name, key.thread_id],
                parse_thread_row,
            )
            .optional()
            .with_context(|| format!("failed to read thread {key}"))
    }

    pub fn get_update(&self, id: UpdateId) -> Result<Option<ThreadUpdate>> {
        self.conn
            .query_row(
                &format!("SELECT {UPDATE_COLUMNS} FROM thread_updates WHERE id = ?1"),
                params![id.0],
                parse_update_row,
            )
            .optional()
            .with_context(|| format!("failed to read update {id}"))
    }

    pub fn list_updates(&self, query: &UpdateQuery) -> Result<UpdatePage> {
        query
            .validate()
            .map_err(|err| anyhow!("invalid update query: {err}"))?;

        let filter = "(?1 IS NULL OR webhook_name = ?1)
             AND (?2 IS NULL OR thread_id = ?2)
             AND (?3 IS NULL OR status = ?3)";
        let status = query.status.map(UpdateStatus::as_str);

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM thread_updates WHERE {filter}"),
                params![query.webhook_name, query.thread_id, status],
                |row| row.get(0),
            )
            .context("failed to count updates")?;
        let total = u64::try_from(total).with_context(|| format!("invalid update count: {total}"))?;

        let direction = if query.newest_first { "DESC" } else { "ASC" };
        let offset = i64::from(query.page - 1) * i64::from(query.per_page);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {UPDATE_COLUMNS} FROM thread_updates
             WHERE {filter}
             ORDER BY arrived_at_ms {direction}, id {direction}
             LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                query.webhook_name,
                query.thread_id,
                status,
                i64::from(query.per_page),
                offset
            ],
            parse_update_row,
        )?;
        let updates = collect_rows(rows)?;

        Ok(UpdatePage {
            updates,
            total,
            page: query.page,
            per_page: query.per_page,
            total_pages: total.div_ceil(u64::from(query.per_page)),
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_webhook_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookConfig> {
    let name: String = row.get(0)?;
    let thread_id_path_raw: String = row.get(1)?;
    let revision_path_raw: String = row.get(2)?;

    let thread_id_path: Vec<String> = serde_json::from_str(&thread_id_path_raw)
        .map_err(|err| conversion_error(1, rusqlite::types::Type::Text, err.to_string()))?;
    let revision_path: Vec<String> = serde_json::from_str(&revision_path_raw)
        .map_err(|err| conversion_error(2, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(WebhookConfig {
        name,
        thread_id_path,
        revision_path,
    })
}

fn parse_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let webhook_name: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let last_delivered_revision: Option<f64> = row.get(2)?;

    let last_delivered_revision = last_delivered_revision
        .map(Revision::new)
        .transpose()
        .map_err(|err| conversion_error(2, rusqlite::types::Type::Real, err.to_string()))?;

    Ok(Thread {
        key: ThreadKey::new(webhook_name, thread_id),
        last_delivered_revision,
    })
}

/// Parses a row selected with [`UPDATE_COLUMNS`].
fn parse_update_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadUpdate> {
    let id: i64 = row.get(0)?;
    let webhook_name: String = row.get(1)?;
    let thread_id: String = row.get(2)?;
    let revision_raw: f64 = row.get(3)?;
    let payload_json: String = row.get(4)?;
    let arrived_at_ms: i64 = row.get(5)?;
    let status_raw: String = row.get(6)?;

    let revision = Revision::new(revision_raw)
        .map_err(|err| conversion_error(3, rusqlite::types::Type::Real, err.to_string()))?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|err| conversion_error(4, rusqlite::types::Type::Text, err.to_string()))?;
    let arrived_at = from_unix_millis(arrived_at_ms)
        .map_err(|err| conversion_error(5, rusqlite::types::Type::Integer, err.to_string()))?;
    let status = UpdateStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(
            6,
            rusqlite::types::Type::Text,
            format!("invalid status: {status_raw}"),
        )
    })?;

    Ok(ThreadUpdate {
        id: UpdateId(id),
        thread_key: ThreadKey::new(webhook_name, thread_id),
        revision,
        payload,
        arrived_at,
        status,
    })
}

fn conversion_error(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
