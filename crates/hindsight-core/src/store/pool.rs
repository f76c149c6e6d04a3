//! Connection pool: one writer, a small reader pool, with a
//! retry-on-transient-failure acquisition wrapper (spec.md §4.1).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::Semaphore;

use crate::error::{EngineError, RetryPolicy};

/// Number of pooled reader connections. The recall pipeline's seed sources
/// (semantic, lexical, entity-mention) run as concurrent candidate queries
/// (§4.8), so a single shared reader connection would serialize them; a
/// small reader pool is sized for that fan-out instead.
const READER_POOL_SIZE: usize = 4;

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )
}

/// Bounded connection pool wrapping one writer and `READER_POOL_SIZE`
/// readers, with retry-wrapped acquisition (spec.md §4.1, §5 "Shared
/// resources").
pub struct ConnectionPool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_permits: Semaphore,
    pub retry: RetryPolicy,
    db_path: Option<PathBuf>,
}

impl ConnectionPool {
    pub fn open(db_path: Option<&Path>, retry: RetryPolicy) -> Result<Self, EngineError> {
        // `Connection::open_in_memory()` gives each connection its own
        // isolated database, which would leave the reader pool unable to
        // see anything the writer inserts. A named shared-cache URI keeps
        // every connection in this pool pointed at the same in-memory
        // database, unique per pool so concurrent tests don't collide.
        let memory_uri = db_path.is_none().then(|| {
            let id = MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("file:hindsight-mem-{id}?mode=memory&cache=shared")
        });

        let writer = open_connection(db_path, memory_uri.as_deref())?;
        configure_connection(&writer).map_err(EngineError::Database)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let reader = open_connection(db_path, memory_uri.as_deref())?;
            configure_connection(&reader).map_err(EngineError::Database)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_permits: Semaphore::new(READER_POOL_SIZE),
            retry,
            db_path: db_path.map(Path::to_path_buf),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Runs `f` against the writer connection, retrying on transient
    /// failure per [`ConnectionPool::retry`]. The closure is synchronous;
    /// callers invoke this from within an async context (spec.md §5: CPU/IO
    /// bound store calls run directly, no `spawn_blocking` at this scale).
    pub async fn with_writer<T, F>(&self, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut(&Connection) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let guard = self
                .writer
                .lock()
                .map_err(|_| EngineError::Fatal("writer connection mutex poisoned".into()))?;
            match f(&guard) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    drop(guard);
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `f` against a pooled reader connection, round-robin-ish via the
    /// semaphore's fairness, retrying on transient failure.
    pub async fn with_reader<T, F>(&self, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut(&Connection) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let _permit = self
                .reader_permits
                .acquire()
                .await
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
            let index = (attempt as usize) % self.readers.len();
            let guard = self.readers[index]
                .lock()
                .map_err(|_| EngineError::Fatal("reader connection mutex poisoned".into()))?;
            match f(&guard) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    drop(guard);
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn apply_migrations(&self) -> Result<(), EngineError> {
        let guard = self
            .writer
            .lock()
            .map_err(|_| EngineError::Fatal("writer connection mutex poisoned".into()))?;
        guard
            .execute_batch("CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY)")
            .map_err(EngineError::Database)?;
        for migration in super::migrations::MIGRATIONS {
            let already_applied: bool = guard
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                    [migration.version],
                    |row| row.get(0),
                )
                .map_err(EngineError::Database)?;
            if already_applied {
                continue;
            }
            guard.execute_batch(migration.up).map_err(EngineError::Database)?;
            guard
                .execute(
                    "INSERT INTO schema_migrations (version) VALUES (?1)",
                    [migration.version],
                )
                .map_err(EngineError::Database)?;
            tracing::info!(version = migration.version, description = migration.description, "applied migration");
        }
        Ok(())
    }
}

static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn open_connection(db_path: Option<&Path>, memory_uri: Option<&str>) -> Result<Connection, EngineError> {
    match db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path).map_err(EngineError::Database)
        }
        None => {
            let uri = memory_uri.expect("memory_uri required when db_path is None");
            Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
            )
            .map_err(EngineError::Database)
        }
    }
}

/// Resolves the default database path via the platform's data directory
/// using `directories::ProjectDirs`.
pub fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "hindsight", "hindsight")
        .map(|dirs| dirs.data_dir().join("hindsight.db"))
        .unwrap_or_else(|| PathBuf::from("hindsight.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_and_migrate() {
        let pool = ConnectionPool::open(None, RetryPolicy::default()).unwrap();
        pool.apply_migrations().unwrap();
        let count: i64 = pool
            .with_reader(|conn| {
                conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
                    .map_err(EngineError::Database)
            })
            .await
            .unwrap();
        assert_eq!(count as usize, super::super::migrations::MIGRATIONS.len());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = ConnectionPool::open(None, RetryPolicy::default()).unwrap();
        pool.apply_migrations().unwrap();
        pool.apply_migrations().unwrap();
    }
}
