//! The SQLite handle shared by every CRUD module.
//!
//! Opening a [`Database`] always brings the schema up to date first, so the
//! typed helpers never see an old layout.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const DB_FILE: &str = "skylink.db";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the bridge database in the platform data directory
    /// (`~/.local/share/skylink/skylink.db` on Linux).
    pub fn new() -> Result<Self> {
        let dirs = ProjectDirs::from("net", "skylink", "skylink").ok_or(StoreError::NoDataDir)?;
        let path = dirs.data_dir().join(DB_FILE);
        tracing::info!(path = %path.display(), "Opening bridge database");
        Self::open_at(&path)
    }

    /// Open the database file at `path`, creating missing parent directories.
    pub fn open_at(path: &Path) -> Result<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// A private database that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, for opening transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// File backing the database, `None` when in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().filter(|p| !p.is_empty()).map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_an_existing_file_works() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).unwrap();
        assert!(db.path().is_some());
        drop(db);

        Database::open_at(&path).unwrap();
    }

    #[test]
    fn in_memory_has_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('portal', 'puppet', 'user', 'message', 'user_portal')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }
}
