//! FTS5 boolean queries against the mirror.

use rusqlite::Connection;
use rusqlite::types::Value;

use crate::{MirrorError, MirrorQuery, MirrorRow};

/// Number of title words combined with AND in a match expression.
pub const TITLE_WORDS_IN_QUERY: usize = 3;

/// Quote a term for FTS5. Embedded double quotes are doubled.
fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Build an FTS5 match expression from title words and last names.
///
/// The most reliable title words are AND-ed against the `title` column and
/// the last names are OR-ed against the `creators` column:
/// `title:("widgets" AND "theory") AND creators:("smith" OR "jones")`.
/// Returns `None` if either list is empty.
pub fn build_match_expression(title_words: &[String], last_names: &[String]) -> Option<String> {
    let words: Vec<String> = title_words
        .iter()
        .filter(|w| !w.trim().is_empty())
        .take(TITLE_WORDS_IN_QUERY)
        .map(|w| quote_term(w.trim()))
        .collect();
    let names: Vec<String> = last_names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .map(|n| quote_term(n.trim()))
        .collect();

    if words.is_empty() || names.is_empty() {
        return None;
    }

    Some(format!(
        "title:({}) AND creators:({})",
        words.join(" AND "),
        names.join(" OR ")
    ))
}

/// Run a mirror query, returning raw rows in library order.
///
/// Rows from libraries earlier in `query.library_ids` come first. An empty
/// `library_ids` list searches every library.
pub fn query_rows(conn: &Connection, query: &MirrorQuery) -> Result<Vec<MirrorRow>, MirrorError> {
    let mut sql = String::from(
        "SELECT i.library_id, i.key, i.version, i.item_type, i.title, i.creators, i.year, i.data \
         FROM items i \
         WHERE i.id IN (SELECT rowid FROM items_fts WHERE items_fts MATCH ?1)",
    );
    let mut values: Vec<Value> = vec![Value::Text(query.expression.clone())];

    if let Some(year) = query.year {
        values.push(Value::Integer(year));
        sql.push_str(&format!(" AND i.year = ?{}", values.len()));
    }

    if !query.library_ids.is_empty() {
        let mut placeholders = Vec::with_capacity(query.library_ids.len());
        for id in &query.library_ids {
            values.push(Value::Text(id.clone()));
            placeholders.push(format!("?{}", values.len()));
        }
        sql.push_str(&format!(" AND i.library_id IN ({})", placeholders.join(", ")));
    }

    values.push(Value::Integer(query.limit as i64));
    sql.push_str(&format!(" ORDER BY i.id LIMIT ?{}", values.len()));

    let mut stmt = conn.prepare(&sql)?;
    let mapped = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
        let data: String = row.get(7)?;
        Ok((
            MirrorRow {
                library_id: row.get(0)?,
                key: row.get(1)?,
                version: row.get(2)?,
                item_type: row.get(3)?,
                title: row.get(4)?,
                creators: row.get(5)?,
                year: row.get(6)?,
                data: serde_json::Value::Null,
            },
            data,
        ))
    })?;

    let mut rows = Vec::new();
    for result in mapped {
        let (mut row, data) = match result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable mirror row");
                continue;
            }
        };
        match serde_json::from_str(&data) {
            Ok(value) => {
                row.data = value;
                rows.push(row);
            }
            Err(e) => {
                tracing::warn!(
                    library_id = %row.library_id,
                    key = %row.key,
                    error = %e,
                    payload = %truncate(&data, 500),
                    "skipping mirror row with malformed JSON"
                );
            }
        }
    }

    let rank = |library_id: &str| {
        query
            .library_ids
            .iter()
            .position(|id| id == library_id)
            .unwrap_or(usize::MAX)
    };
    rows.sort_by_key(|r| rank(&r.library_id));

    tracing::debug!(
        expression = %query.expression,
        hits = rows.len(),
        "mirror query"
    );
    Ok(rows)
}
