use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::StoreError;

const DB_FILE: &str = "monolog.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS topics (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    latest_offset INTEGER NOT NULL DEFAULT -1
);

CREATE TABLE IF NOT EXISTS messages (
    topic TEXT NOT NULL,
    offset INTEGER NOT NULL,
    last_offset INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    key BLOB,
    value BLOB,
    codec INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (topic, offset)
);
CREATE INDEX IF NOT EXISTS idx_messages_topic_ts ON messages(topic, timestamp);

CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'empty',
    generation INTEGER NOT NULL DEFAULT 0,
    leader_id TEXT,
    protocol TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    member_id TEXT NOT NULL,
    client_id TEXT,
    last_heartbeat INTEGER NOT NULL,
    metadata BLOB,
    assignment BLOB,
    PRIMARY KEY (group_id, member_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS group_offsets (
    group_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    committed_offset INTEGER NOT NULL,
    PRIMARY KEY (group_id, topic),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);
";

/// Handle to the broker database.  There is exactly one writer connection,
/// serialized behind a mutex; `synchronous=FULL` forces an fsync on every
/// committed transaction so a successful append survives a crash-restart.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(StoreError::Io)?;
        let conn = Connection::open(data_dir.join(DB_FILE))?;
        Self::init(conn)
    }

    /// Open an in-memory database (the `sqlite:memory` backend and tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode answers with the mode it settled on (an in-memory
        // database stays on "memory"), so it cannot go through pragma_update.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the writer connection.  Poisoned locks are unrecoverable
    /// here: a panic mid-transaction leaves no safe way to keep serving.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| {
            panic!("database mutex poisoned: {poisoned}");
        });
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstraps_and_is_idempotent() {
        let db = Db::open_in_memory().expect("open");
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA).map_err(StoreError::from)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                     ('topics', 'messages', 'groups', 'group_members', 'group_offsets')",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)?;
            assert_eq!(count, 5);
            Ok(())
        })
        .expect("query");
    }

    #[test]
    fn open_creates_the_data_dir_and_file() {
        let dir = std::env::temp_dir().join(format!(
            "monolog-db-unit-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock after unix epoch")
                .as_nanos()
        ));
        let _db = Db::open(&dir).expect("open");
        assert!(dir.join("monolog.db").exists());
        drop(_db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
