//! SQLite schema and row operations for the library mirror.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, params};

use crate::MirrorError;

/// Initialize the database with the required schema.
/// Sets WAL mode and NORMAL synchronous for performance.
pub fn init_database(conn: &Connection) -> Result<(), MirrorError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY,
            library_id TEXT NOT NULL,
            key TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            item_type TEXT NOT NULL,
            title TEXT NOT NULL,
            creators TEXT NOT NULL,
            year INTEGER,
            data TEXT NOT NULL,
            UNIQUE (library_id, key)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
            title,
            creators,
            content='items',
            content_rowid='id',
            tokenize='unicode61 remove_diacritics 2'
        );

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_items_year ON items(year);
        CREATE INDEX IF NOT EXISTS idx_items_library ON items(library_id);
        "#,
    )?;

    Ok(())
}

/// Columns derived from a library item's JSON `data` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemColumns {
    pub key: String,
    pub version: i64,
    pub item_type: String,
    pub title: String,
    pub creators: String,
    pub year: Option<i64>,
}

/// Item types that never represent a citable work.
const CHILD_ITEM_TYPES: &[&str] = &["note", "attachment", "annotation"];

/// Extract the indexed columns from an item.
///
/// Accepts both the API envelope (`{"key", "version", "data": {...}}`) and a
/// bare data object. Returns `None` for child items and items without a key.
pub fn item_columns(item: &serde_json::Value) -> Option<ItemColumns> {
    let data = if item["data"].is_object() {
        &item["data"]
    } else {
        item
    };

    let item_type = data["itemType"].as_str().unwrap_or("");
    if item_type.is_empty() || CHILD_ITEM_TYPES.contains(&item_type) {
        return None;
    }

    let key = item["key"]
        .as_str()
        .or_else(|| data["key"].as_str())?
        .to_string();
    let version = item["version"]
        .as_i64()
        .or_else(|| data["version"].as_i64())
        .unwrap_or(0);

    let creators = data["creators"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    if let Some(last) = c["lastName"].as_str() {
                        let first = c["firstName"].as_str().unwrap_or("");
                        Some(format!("{} {}", last, first).trim().to_string())
                    } else {
                        c["name"].as_str().map(String::from)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default();

    Some(ItemColumns {
        key,
        version,
        item_type: item_type.to_string(),
        title: data["title"].as_str().unwrap_or("").to_string(),
        creators,
        year: data["date"].as_str().and_then(extract_year),
    })
}

/// First four-digit run in a date string.
pub fn extract_year(date: &str) -> Option<i64> {
    static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").unwrap());
    YEAR_RE.find(date).and_then(|m| m.as_str().parse().ok())
}

/// Insert or replace a batch of items for one library in a single transaction.
///
/// The FTS index is not touched; call [`rebuild_fts_index`] afterwards.
pub fn upsert_items(
    conn: &Connection,
    library_id: &str,
    items: &[serde_json::Value],
) -> Result<usize, MirrorError> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO items (library_id, key, version, item_type, title, creators, year, data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(library_id, key) DO UPDATE SET \
                version = excluded.version, item_type = excluded.item_type, \
                title = excluded.title, creators = excluded.creators, \
                year = excluded.year, data = excluded.data",
        )?;
        for item in items {
            let Some(cols) = item_columns(item) else {
                continue;
            };
            let data = if item["data"].is_object() {
                &item["data"]
            } else {
                item
            };
            stmt.execute(params![
                library_id,
                cols.key,
                cols.version,
                cols.item_type,
                cols.title,
                cols.creators,
                cols.year,
                data.to_string(),
            ])?;
            inserted += 1;
        }
    }

    tx.commit()?;
    Ok(inserted)
}

/// Rebuild the FTS5 index from the items table.
pub fn rebuild_fts_index(conn: &Connection) -> Result<(), MirrorError> {
    conn.execute("INSERT INTO items_fts(items_fts) VALUES('rebuild')", [])?;
    Ok(())
}

/// Get a metadata value by key.
pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>, MirrorError> {
    let mut stmt = conn.prepare_cached("SELECT value FROM metadata WHERE key = ?1")?;
    let result = stmt.query_row(params![key], |row| row.get(0)).ok();
    Ok(result)
}

/// Set a metadata value (upsert).
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<(), MirrorError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Item counts per library, ordered by library id.
pub fn counts_by_library(conn: &Connection) -> Result<Vec<(String, i64)>, MirrorError> {
    let mut stmt = conn.prepare_cached(
        "SELECT library_id, COUNT(*) FROM items GROUP BY library_id ORDER BY library_id",
    )?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        conn
    }

    fn article(key: &str, title: &str) -> serde_json::Value {
        json!({
            "key": key,
            "version": 7,
            "data": {
                "itemType": "journalArticle",
                "title": title,
                "date": "March 1998",
                "creators": [
                    {"creatorType": "author", "lastName": "Smith", "firstName": "John"},
                    {"creatorType": "author", "name": "Widget Council"}
                ]
            }
        })
    }

    #[test]
    fn test_item_columns_from_envelope() {
        let cols = item_columns(&article("ABC123", "On Widgets")).unwrap();
        assert_eq!(cols.key, "ABC123");
        assert_eq!(cols.version, 7);
        assert_eq!(cols.year, Some(1998));
        assert_eq!(cols.creators, "Smith John; Widget Council");
    }

    #[test]
    fn test_item_columns_skips_children() {
        let note = json!({"key": "N1", "data": {"itemType": "note", "note": "x"}});
        assert!(item_columns(&note).is_none());
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let conn = setup_db();
        upsert_items(&conn, "lib1", &[article("K1", "Old Title")]).unwrap();
        upsert_items(&conn, "lib1", &[article("K1", "New Title")]).unwrap();

        let title: String = conn
            .query_row(
                "SELECT title FROM items WHERE library_id = ?1 AND key = ?2",
                params!["lib1", "K1"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, "New Title");
        assert_eq!(counts_by_library(&conn).unwrap(), vec![("lib1".into(), 1)]);
    }

    #[test]
    fn test_same_key_in_two_libraries() {
        let conn = setup_db();
        upsert_items(&conn, "lib1", &[article("K1", "On Widgets")]).unwrap();
        upsert_items(&conn, "lib2", &[article("K1", "On Widgets")]).unwrap();
        assert_eq!(counts_by_library(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_metadata() {
        let conn = setup_db();
        assert_eq!(get_metadata(&conn, "foo").unwrap(), None);

        set_metadata(&conn, "foo", "bar").unwrap();
        assert_eq!(get_metadata(&conn, "foo").unwrap(), Some("bar".into()));

        set_metadata(&conn, "foo", "baz").unwrap();
        assert_eq!(get_metadata(&conn, "foo").unwrap(), Some("baz".into()));
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year("1998-03-01"), Some(1998));
        assert_eq!(extract_year("n.d."), None);
    }
}
