use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use roll_core::{
    DEFAULT_DIMENSION, DEFAULT_LOCK_WAIT, Identity, IdentityDirectory, IdentityKey, now_iso8601,
};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, StoreError};
use crate::schema;

/// Connections opened per file-backed store.
pub const DEFAULT_CONNECTIONS: usize = 4;

const SLOT_WAIT: Duration = Duration::from_millis(5);

/// SQLite-backed embedding store, attendance ledger and identity directory.
///
/// A small pool of WAL connections, each behind a mutex. A caller takes any
/// idle connection and waits at most `lock_wait` for one to free up, so a
/// slow call holds one connection, not the store. Readers never wait on the
/// writer; concurrent writers are ordered by SQLite under `busy_timeout`.
/// Each contract operation is a single statement or an IMMEDIATE
/// transaction, so other connections and processes see only committed
/// states.
pub struct Store {
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    pub(crate) dimension: usize,
    lock_wait: Duration,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_connections(path, DEFAULT_CONNECTIONS)
    }

    /// Opens `connections` handles on `path` (at least one).
    pub fn open_with_connections(path: &Path, connections: usize) -> Result<Self> {
        let mut pool = Vec::with_capacity(connections.max(1));
        for _ in 0..connections.max(1) {
            let conn = Connection::open(path)?;
            schema::initialize(&conn)?;
            pool.push(conn);
        }
        tracing::debug!(path = %path.display(), connections = pool.len(), "opened store");
        Ok(Self::from_pool(pool))
    }

    /// Single connection: separate in-memory connections are separate databases.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self::from_pool(vec![conn]))
    }

    fn from_pool(pool: Vec<Connection>) -> Self {
        Self {
            pool: pool.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            dimension: DEFAULT_DIMENSION,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Expected embedding length for enrollments. Panics if 0.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        assert!(dimension > 0, "roll-store: embedding dimension must be positive");
        self.dimension = dimension;
        self
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn connections(&self) -> usize {
        self.pool.len()
    }

    /// Any idle pooled connection, waiting at most `lock_wait`.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            if let Some(guard) = self.pool.iter().find_map(|slot| slot.try_lock()) {
                return Ok(guard);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::Contention);
            }
            let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
            if let Some(guard) = self.pool[slot].try_lock_for(remaining.min(SLOT_WAIT)) {
                return Ok(guard);
            }
        }
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Students (identity directory) ---

    /// Adds a student or updates the display name of an existing one.
    pub fn add_student(&self, key: &IdentityKey, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidData("student name is empty".into()));
        }
        self.conn()?.execute(
            "INSERT INTO students (reg_no, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(reg_no) DO UPDATE SET name = excluded.name",
            params![key.as_str(), name, now_iso8601()],
        )?;
        tracing::info!(identity = %key, "saved student");
        Ok(())
    }

    pub fn get_student(&self, key: &IdentityKey) -> Result<Option<Identity>> {
        let conn = self.conn()?;
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM students WHERE reg_no = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.map(|name| Identity::new(key.clone(), name)))
    }

    pub fn list_students(&self) -> Result<Vec<Identity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT reg_no, name FROM students ORDER BY reg_no")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(reg_no, name)| Ok(Identity::new(parse_key(&reg_no)?, name)))
            .collect()
    }

    /// Flush the WAL into the main database file.
    pub fn checkpoint_truncate(&self) -> Result<()> {
        self.conn()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

pub(crate) fn parse_key(raw: &str) -> Result<IdentityKey> {
    IdentityKey::parse(raw)
        .map_err(|e| StoreError::InvalidData(format!("stored identity {raw:?}: {e}")))
}

impl IdentityDirectory for Store {
    fn lookup(&self, key: &IdentityKey) -> roll_core::Result<Option<Identity>> {
        Ok(self.get_student(key)?)
    }

    fn list(&self) -> roll_core::Result<Vec<Identity>> {
        Ok(self.list_students()?)
    }
}
