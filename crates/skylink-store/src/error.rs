use thiserror::Error;

/// Errors produced by the bridge store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No platform data directory to put the default database in.
    #[error("Could not determine the bridge data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An update or lookup addressed a row that does not exist.
    #[error("No stored {0}")]
    NotFound(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
