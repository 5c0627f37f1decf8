//! SQLite connection pools.
//!
//! Two databases are used: the record store (addressed by a connection
//! string, usually from `RECORD_MANAGER_DB_URL`) and, when the local vector
//! backend is selected, the vector database file.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Connect to a SQLite database file, creating it and its parent directory.
pub async fn connect_path(path: &Path) -> Result<SqlitePool> {
    connect_url(&format!("sqlite:{}", path.display())).await
}

/// Connect using a `sqlite:` connection string.
pub async fn connect_url(url: &str) -> Result<SqlitePool> {
    if let Some(file) = file_path_of(url) {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid SQLite connection string: {}", url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open {}", url))?;

    Ok(pool)
}

/// The on-disk file behind a `sqlite:` URL, if any.
fn file_path_of(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() || rest == ":memory:" {
        return None;
    }
    Some(Path::new(rest))
}
