//! Local mirror of reference-library records.
//!
//! Keeps a SQLite copy of one or more libraries' items with an FTS5 index over
//! titles and creator names, so the first matcher in the cascade can answer
//! without touching the network. Items are stored as the library's raw item
//! JSON; callers decode rows themselves.

mod db;
mod import;
mod query;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

pub use db::extract_year;
pub use import::{BATCH_SIZE, ImportProgress};
pub use query::{TITLE_WORDS_IN_QUERY, build_match_expression};

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mirror not initialized: {0}")]
    NotInitialized(String),
}

/// One raw row returned from a mirror query.
#[derive(Debug, Clone)]
pub struct MirrorRow {
    pub library_id: String,
    pub key: String,
    pub version: i64,
    pub item_type: String,
    pub title: String,
    pub creators: String,
    pub year: Option<i64>,
    /// The item's `data` object as stored in the library.
    pub data: serde_json::Value,
}

/// A full-text query against the mirror.
#[derive(Debug, Clone)]
pub struct MirrorQuery {
    /// FTS5 match expression, see [`build_match_expression`].
    pub expression: String,
    /// Exact publication year filter.
    pub year: Option<i64>,
    /// Libraries to search, in preference order. Empty searches all.
    pub library_ids: Vec<String>,
    pub limit: usize,
}

impl MirrorQuery {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            year: None,
            library_ids: Vec::new(),
            limit: 50,
        }
    }

    pub fn year(mut self, year: i64) -> Self {
        self.year = Some(year);
        self
    }

    pub fn libraries(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.library_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Mirror statistics.
#[derive(Debug, Clone)]
pub struct MirrorInfo {
    pub last_updated: Option<String>,
    pub schema_version: Option<String>,
    pub item_counts: Vec<(String, i64)>,
}

/// Result of a staleness check.
#[derive(Debug, Clone)]
pub struct StalenessCheck {
    pub is_stale: bool,
    pub age_days: Option<u64>,
    pub last_updated: Option<String>,
}

/// Handle to an opened mirror database.
pub struct MirrorIndex {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for MirrorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorIndex")
            .field("path", &self.path)
            .finish()
    }
}

impl MirrorIndex {
    /// Open an existing mirror. Verifies that the schema tables exist.
    pub fn open(path: &Path) -> Result<Self, MirrorError> {
        let conn = Connection::open(path)?;

        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='items'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Err(MirrorError::NotInitialized(path.display().to_string()));
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open a mirror, creating the schema if needed.
    pub fn create(path: &Path) -> Result<Self, MirrorError> {
        let conn = Connection::open(path)?;
        db::init_database(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory mirror, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, MirrorError> {
        let conn = Connection::open_in_memory()?;
        db::init_database(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Insert or replace items for one library and refresh the FTS index.
    ///
    /// Returns the number of items stored (child items are skipped).
    pub fn insert_items(
        &self,
        library_id: &str,
        items: &[serde_json::Value],
    ) -> Result<usize, MirrorError> {
        let inserted = db::upsert_items(&self.conn, library_id, items)?;
        db::rebuild_fts_index(&self.conn)?;
        db::set_metadata(&self.conn, "last_updated", &import::now_unix_timestamp())?;
        Ok(inserted)
    }

    /// Run a full-text query, returning raw rows in library preference order.
    pub fn query(&self, query: &MirrorQuery) -> Result<Vec<MirrorRow>, MirrorError> {
        query::query_rows(&self.conn, query)
    }

    /// Import a JSON export file (array or JSON lines) for one library.
    pub fn import_file(
        &self,
        library_id: &str,
        json_path: &Path,
        progress: impl FnMut(ImportProgress),
    ) -> Result<u64, MirrorError> {
        import::import_file(&self.conn, library_id, json_path, progress)
    }

    pub fn info(&self) -> Result<MirrorInfo, MirrorError> {
        Ok(MirrorInfo {
            last_updated: db::get_metadata(&self.conn, "last_updated")?,
            schema_version: db::get_metadata(&self.conn, "schema_version")?,
            item_counts: db::counts_by_library(&self.conn)?,
        })
    }

    /// Check if the mirror is older than `threshold_days`.
    pub fn check_staleness(&self, threshold_days: u64) -> Result<StalenessCheck, MirrorError> {
        let last_updated = db::get_metadata(&self.conn, "last_updated")?;

        let age_days = last_updated.as_ref().and_then(|ts| {
            let built: u64 = ts.parse().ok()?;
            let now: u64 = import::now_unix_timestamp().parse().ok()?;
            Some(now.saturating_sub(built) / 86400)
        });

        let is_stale = age_days.map_or(true, |days| days >= threshold_days);

        Ok(StalenessCheck {
            is_stale,
            age_days,
            last_updated,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
