//! The row-store-backed storage engine.
//!
//! `Kv` owns a pooled SQLite handle plus the in-process registries
//! (triggers, FTS catalog cache, versionstamp source, metrics). Each logical
//! operation checks one connection out of the pool for its duration; writes
//! run inside a single row-store transaction.

pub mod engine;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde_derive::Serialize;
use serde_json::Value;

use crate::codec::key::Key;
use crate::error::{CResult, Error};
use crate::fts::FtsRegistry;
use crate::metrics::Metrics;
use crate::trigger::TriggerRegistry;
use crate::version::VersionstampSource;

/// Default page size for `list` and `paginate`.
pub const DEFAULT_LIMIT: u32 = 100;
/// Hard cap on page size.
pub const MAX_LIMIT: u32 = 1000;

/// One stored entry, or a miss (`value` and `versionstamp` both `None`).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub key: Key,
    pub value: Option<Value>,
    pub versionstamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Entry {
    pub fn miss(key: Key) -> Self {
        Entry { key, value: None, versionstamp: None, expires_at: None }
    }

    pub fn exists(&self) -> bool {
        self.versionstamp.is_some()
    }
}

/// Options for `set`.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Relative time-to-live in milliseconds.
    pub expire_in_ms: Option<u64>,
}

/// Options for `list`.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Inclusive physical start key, applied in ascending key space.
    pub start: Option<Key>,
    /// Exclusive physical end key, applied in ascending key space.
    pub end: Option<Key>,
    pub limit: Option<u32>,
    pub reverse: bool,
    pub r#where: Option<Value>,
}

/// Options for `paginate`.
#[derive(Clone, Debug, Default)]
pub struct PaginateOptions {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub reverse: bool,
}

/// One page of entries plus the continuation cursor.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub entries: Vec<Entry>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Result of a `set` or atomic commit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommitResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versionstamp: Option<String>,
}

impl CommitResult {
    pub fn committed(versionstamp: String) -> Self {
        CommitResult { ok: true, versionstamp: Some(versionstamp) }
    }

    pub fn conflict() -> Self {
        CommitResult { ok: false, versionstamp: None }
    }
}

/// Engine status, exposed for operators.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub name: String,
    /// Live (unexpired) entry count.
    pub keys: u64,
    /// Logical size of live values, bytes.
    pub size: u64,
    pub queue_pending: u64,
    pub queue_processing: u64,
    pub dlq: u64,
}

/// Engine construction options.
#[derive(Clone, Debug)]
pub struct KvOptions {
    pub pool_size: u32,
}

impl Default for KvOptions {
    fn default() -> Self {
        KvOptions { pool_size: 8 }
    }
}

/// The versionstamped key-value engine.
#[derive(Clone)]
pub struct Kv {
    pool: Pool<SqliteConnectionManager>,
    pub(crate) stamps: VersionstampSource,
    pub(crate) triggers: TriggerRegistry,
    pub(crate) fts: FtsRegistry,
    pub metrics: Metrics,
}

impl Kv {
    /// Opens (creating if needed) a database file and initializes the schema.
    pub fn open(path: impl AsRef<Path>) -> CResult<Kv> {
        Self::open_with(path, KvOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: KvOptions) -> CResult<Kv> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(init_connection);
        Self::from_manager(manager, options)
    }

    /// Opens a process-private in-memory database (shared across the pool's
    /// connections). Used by tests and throwaway instances.
    pub fn open_in_memory() -> CResult<Kv> {
        let name = format!(
            "file:tidekv-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let manager = SqliteConnectionManager::file(&name)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(init_connection);
        Self::from_manager(manager, KvOptions { pool_size: 4 })
    }

    fn from_manager(manager: SqliteConnectionManager, options: KvOptions) -> CResult<Kv> {
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)
            .map_err(|e| Error::Io(e.to_string()))?;
        let kv = Kv {
            pool,
            stamps: VersionstampSource::new(),
            triggers: TriggerRegistry::new(),
            fts: FtsRegistry::new(),
            metrics: Metrics::new(),
        };
        kv.init_schema()?;
        Ok(kv)
    }

    pub(crate) fn conn(&self) -> CResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(Error::from)
    }

    fn init_schema(&self) -> CResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key          BLOB PRIMARY KEY,
                value        BLOB NOT NULL,
                versionstamp TEXT NOT NULL,
                expires_at   INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_entries_expires
                ON kv_entries (expires_at) WHERE expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS kv_queue (
                id                  TEXT PRIMARY KEY,
                value               BLOB NOT NULL,
                ready_at            INTEGER NOT NULL,
                attempts            INTEGER NOT NULL DEFAULT 0,
                max_attempts        INTEGER NOT NULL,
                backoff_schedule    TEXT NOT NULL,
                keys_if_undelivered TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'pending',
                locked_until        INTEGER,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_queue_ready
                ON kv_queue (status, ready_at, created_at);

            CREATE TABLE IF NOT EXISTS kv_dlq (
                id                  TEXT PRIMARY KEY,
                original_id         TEXT NOT NULL,
                value               BLOB NOT NULL,
                error_message       TEXT NOT NULL,
                attempts            INTEGER NOT NULL,
                original_created_at INTEGER NOT NULL,
                failed_at           INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_indexes (
                prefix     BLOB PRIMARY KEY,
                fields     TEXT NOT NULL,
                tokenizer  TEXT NOT NULL,
                table_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_metrics (
                op         TEXT PRIMARY KEY,
                count      INTEGER NOT NULL,
                errors     INTEGER NOT NULL,
                latency_ms REAL NOT NULL,
                flushed_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

fn init_connection(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )
}

/// Current wall clock, epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall clock, epoch seconds. Entry expiry deadlines use seconds.
pub(crate) fn now_s() -> i64 {
    now_ms() / 1000
}

/// Converts a relative TTL in milliseconds to the absolute epoch-second
/// deadline, rounding up so short TTLs do not expire instantly.
pub(crate) fn ttl_deadline(expire_in_ms: u64) -> i64 {
    (now_ms() + expire_in_ms as i64 + 999) / 1000
}
