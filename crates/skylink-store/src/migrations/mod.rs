//! Schema migrations, applied in order when a [`Database`](crate::Database)
//! is opened. SQLite's `user_version` pragma records the last one applied.

pub mod v001_initial;
pub mod v002_user_credentials;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = (&'static str, fn(&Connection) -> rusqlite::Result<()>);

/// Index `i` moves the schema from version `i` to `i + 1`.
const MIGRATIONS: &[Migration] = &[
    ("v001_initial", v001_initial::up),
    ("v002_user_credentials", v002_user_credentials::up),
];

const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(current, target = CURRENT_VERSION, "Checking bridge schema");

    for (version, (name, up)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        tracing::info!(migration = *name, "Applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version as u32 + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
