//! Embedded per-identity store: single SQLite connection, WAL mode, all
//! tables created on open. The DB file lives at {data_dir}/webmux.db.
//!
//! The gateway and REST surface treat values as opaque bytes; namespacing
//! (settings key, session name, file path) is the schema's concern.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

const DB_FILE: &str = "webmux.db";

/// Drafts and annotations older than this are purged at startup.
pub const PURGE_AFTER_DAYS: i64 = 7;

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Process-wide store handle. rusqlite connections are not Sync, so the
/// connection sits behind a mutex; every operation is a short transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database under `data_dir` and ensure all
    /// tables exist. Records past the retention window are purged here so
    /// the store never grows unbounded across restarts.
    pub fn open(data_dir: &Path) -> rusqlite::Result<Self> {
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            tracing::warn!(dir = %data_dir.display(), error = %e, "failed to create data dir");
        }
        let conn = Connection::open(data_dir.join(DB_FILE))?;
        let store = Self::with_connection(conn)?;
        store.purge_older_than(PURGE_AFTER_DAYS)?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_setting(&self, identity: &str, key: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex");
        conn.query_row(
            "SELECT value FROM settings WHERE identity_hash = ?1 AND key = ?2",
            params![identity, key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn put_setting(&self, identity: &str, key: &str, value: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO settings (identity_hash, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity_hash, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![identity, key, value, unix_now()],
        )?;
        Ok(())
    }

    pub fn get_draft(&self, identity: &str, session: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex");
        conn.query_row(
            "SELECT content FROM drafts WHERE identity_hash = ?1 AND session_name = ?2",
            params![identity, session],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn put_draft(&self, identity: &str, session: &str, content: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO drafts (identity_hash, session_name, content, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity_hash, session_name)
             DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            params![identity, session, content, unix_now()],
        )?;
        Ok(())
    }

    pub fn delete_draft(&self, identity: &str, session: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "DELETE FROM drafts WHERE identity_hash = ?1 AND session_name = ?2",
            params![identity, session],
        )?;
        Ok(())
    }

    pub fn get_annotation(
        &self,
        identity: &str,
        session: &str,
        file_path: &str,
    ) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex");
        conn.query_row(
            "SELECT content FROM annotations
             WHERE identity_hash = ?1 AND session_name = ?2 AND file_path = ?3",
            params![identity, session, file_path],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn put_annotation(
        &self,
        identity: &str,
        session: &str,
        file_path: &str,
        content: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO annotations (identity_hash, session_name, file_path, content, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity_hash, session_name, file_path)
             DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            params![identity, session, file_path, content, unix_now()],
        )?;
        Ok(())
    }

    /// Drop drafts and annotations not updated in `days`. Settings are
    /// kept indefinitely.
    pub fn purge_older_than(&self, days: i64) -> rusqlite::Result<usize> {
        let cutoff = unix_now() - days * 24 * 3600;
        let conn = self.conn.lock().expect("store mutex");
        let mut purged = conn.execute("DELETE FROM drafts WHERE updated_at < ?1", params![cutoff])?;
        purged += conn.execute(
            "DELETE FROM annotations WHERE updated_at < ?1",
            params![cutoff],
        )?;
        Ok(purged)
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
            identity_hash TEXT NOT NULL,
            key           TEXT NOT NULL,
            value         TEXT NOT NULL,
            updated_at    INTEGER NOT NULL,
            PRIMARY KEY (identity_hash, key)
        );

        CREATE TABLE IF NOT EXISTS drafts (
            identity_hash TEXT NOT NULL,
            session_name  TEXT NOT NULL,
            content       TEXT NOT NULL,
            updated_at    INTEGER NOT NULL,
            PRIMARY KEY (identity_hash, session_name)
        );

        CREATE TABLE IF NOT EXISTS annotations (
            identity_hash TEXT NOT NULL,
            session_name  TEXT NOT NULL,
            file_path     TEXT NOT NULL,
            content       TEXT NOT NULL,
            updated_at    INTEGER NOT NULL,
            PRIMARY KEY (identity_hash, session_name, file_path)
        );
        ",
    )
}
