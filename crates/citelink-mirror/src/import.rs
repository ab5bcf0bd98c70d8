//! Import pipeline for library JSON exports.
//!
//! Reads either a JSON array of items or one item per line (as produced by
//! paging through the library API and appending each page), stores them in
//! batches and rebuilds the FTS index once at the end.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rusqlite::Connection;

use crate::MirrorError;
use crate::db;

/// Items per insert transaction.
pub const BATCH_SIZE: usize = 1_000;

const SCHEMA_VERSION: &str = "1";

/// Progress events emitted during an import.
#[derive(Debug, Clone)]
pub enum ImportProgress {
    Reading {
        bytes_total: u64,
    },
    Inserting {
        /// Items decoded from the file so far.
        items_read: u64,
        /// Items committed to SQLite.
        items_stored: u64,
    },
    RebuildingIndex,
    Complete {
        items_stored: u64,
        /// Child items and malformed lines.
        items_skipped: u64,
    },
}

pub(crate) fn import_file(
    conn: &Connection,
    library_id: &str,
    json_path: &Path,
    mut progress: impl FnMut(ImportProgress),
) -> Result<u64, MirrorError> {
    let file = File::open(json_path)?;
    let bytes_total = file.metadata().map(|m| m.len()).unwrap_or(0);
    progress(ImportProgress::Reading { bytes_total });

    let items = read_items(BufReader::new(file))?;
    let items_read = items.len() as u64;

    let mut items_stored: u64 = 0;
    for chunk in items.chunks(BATCH_SIZE) {
        items_stored += db::upsert_items(conn, library_id, chunk)? as u64;
        progress(ImportProgress::Inserting {
            items_read,
            items_stored,
        });
    }

    progress(ImportProgress::RebuildingIndex);
    db::rebuild_fts_index(conn)?;
    db::set_metadata(conn, "last_updated", &now_unix_timestamp())?;
    db::set_metadata(conn, "schema_version", SCHEMA_VERSION)?;

    tracing::info!(
        library = library_id,
        items_read,
        items_stored,
        "mirror import finished"
    );

    progress(ImportProgress::Complete {
        items_stored,
        items_skipped: items_read.saturating_sub(items_stored),
    });

    Ok(items_stored)
}

/// Decode a JSON array or a JSON-lines stream.
///
/// JSON-lines input may hold whole pages (arrays) per line; those are
/// flattened. Lines that fail to parse are logged and skipped.
fn read_items(mut reader: impl BufRead) -> Result<Vec<serde_json::Value>, MirrorError> {
    let mut first = String::new();
    loop {
        let buf = reader.fill_buf()?;
        match buf.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(&b) => {
                first.push(b as char);
                break;
            }
            None if buf.is_empty() => return Ok(Vec::new()),
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }

    if first == "[" {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| MirrorError::Parse(e.to_string()))?;
        return Ok(value.as_array().cloned().unwrap_or_default());
    }

    let mut items = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Array(page)) => items.extend(page),
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping malformed mirror line");
            }
        }
    }
    Ok(items)
}

/// Unix timestamp as a string (seconds since epoch).
pub(crate) fn now_unix_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_EXPORT: &str = r#"[
  {"key": "K1", "version": 1, "data": {"itemType": "book", "title": "Widgets", "date": "2001",
    "creators": [{"creatorType": "author", "lastName": "Jones", "firstName": "B."}]}},
  {"key": "N1", "version": 1, "data": {"itemType": "note", "note": "reading notes"}}
]"#;

    #[test]
    fn test_import_array_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        std::fs::write(&path, ARRAY_EXPORT).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();

        let mut events = Vec::new();
        let stored = import_file(&conn, "lib1", &path, |evt| events.push(evt)).unwrap();
        assert_eq!(stored, 1);
        assert!(matches!(
            events.last(),
            Some(ImportProgress::Complete {
                items_stored: 1,
                items_skipped: 1
            })
        ));
        assert_eq!(
            db::get_metadata(&conn, "schema_version").unwrap(),
            Some(SCHEMA_VERSION.into())
        );
    }

    #[test]
    fn test_read_json_lines_with_pages_and_garbage() {
        let input = "\n{\"key\":\"A\",\"data\":{\"itemType\":\"book\"}}\nnot json\n[{\"key\":\"B\"},{\"key\":\"C\"}]\n";
        let items = read_items(input.as_bytes()).unwrap();
        let keys: Vec<_> = items.iter().map(|i| i["key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_read_empty_input() {
        assert!(read_items("   \n".as_bytes()).unwrap().is_empty());
    }
}
