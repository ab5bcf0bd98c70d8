//! The authoritative reference library: item templates, record creation,
//! versioned updates, collections and citation relations.

mod memory;
mod zotero;

pub use memory::MemoryLibrary;
pub use zotero::ZoteroLibrary;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::model::{CitationRelation, ItemType};

/// Attempts made by [`update_with_retry`] before giving up on conflicts.
pub const UPDATE_ATTEMPTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LibraryError {
    /// The item changed since it was fetched.
    #[error("version conflict on item {key}")]
    Conflict { key: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("library returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// HTTP 429 after the retry budget was spent.
    #[error("library rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("library request failed: {0}")]
    Transport(String),
    #[error("unexpected library response: {0}")]
    Malformed(String),
}

impl LibraryError {
    /// Rate limiting and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            LibraryError::RateLimited { .. } => true,
            LibraryError::Transport(msg) => msg.starts_with("timeout"),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LibraryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LibraryError::Transport(format!("timeout: {}", e))
        } else {
            LibraryError::Transport(e.to_string())
        }
    }
}

/// An item as stored in the library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryItem {
    pub key: String,
    pub version: i64,
    /// Item JSON (`itemType`, `title`, `creators`, `relations`, ...).
    pub data: Value,
}

pub type LibraryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LibraryError>> + Send + 'a>>;

/// The library service.
pub trait Library: Send + Sync {
    /// URI prefix for item URIs, e.g. `http://zotero.org/groups/123`.
    fn library_uri(&self) -> String;

    /// Empty item JSON for `item_type`, listing every field the type accepts.
    fn item_template(&self, item_type: ItemType) -> LibraryFuture<'_, Value>;

    /// Create an item, filed in the collection at `collection_path` (segments
    /// separated by `/`, created as needed). Returns the new key.
    fn create_item<'a>(
        &'a self,
        collection_path: Option<&'a str>,
        data: Value,
    ) -> LibraryFuture<'a, String>;

    fn fetch<'a>(&'a self, key: &'a str) -> LibraryFuture<'a, LibraryItem>;

    /// Write `item.data` back. Fails with [`LibraryError::Conflict`] when the
    /// stored version is no longer `item.version`. Returns the new version.
    fn save<'a>(&'a self, item: &'a LibraryItem) -> LibraryFuture<'a, i64>;

    /// Key of the collection at `path`, creating missing segments.
    fn collection_by_path<'a>(&'a self, path: &'a str) -> LibraryFuture<'a, String>;

    /// One page of the top-level items in the collection at `path`.
    fn collection_items<'a>(
        &'a self,
        path: &'a str,
        start: usize,
        limit: usize,
    ) -> LibraryFuture<'a, Vec<LibraryItem>>;
}

/// Split a collection path into its non-empty segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Fetch `key`, apply `change`, save; on a version conflict re-fetch and
/// re-apply, up to [`UPDATE_ATTEMPTS`] times.
///
/// `change` returns `false` when the item already has the desired state;
/// nothing is saved then and the result is `Ok(false)`.
pub async fn update_with_retry<L, F>(
    library: &L,
    key: &str,
    mut change: F,
) -> Result<bool, LibraryError>
where
    L: Library + ?Sized,
    F: FnMut(&mut Value) -> bool,
{
    for attempt in 1..=UPDATE_ATTEMPTS {
        let mut item = library.fetch(key).await?;
        if !change(&mut item.data) {
            return Ok(false);
        }
        match library.save(&item).await {
            Ok(version) => {
                tracing::debug!(key, version, "item updated");
                return Ok(true);
            }
            Err(LibraryError::Conflict { .. }) if attempt < UPDATE_ATTEMPTS => {
                tracing::info!(key, attempt, "version conflict, re-fetching");
            }
            Err(e) => return Err(e),
        }
    }
    Err(LibraryError::Conflict {
        key: key.to_string(),
    })
}

/// Insert `uri` under `predicate` in an item's `relations`. Returns `false`
/// when it was already present.
pub fn insert_relation(data: &mut Value, predicate: &str, uri: &str) -> bool {
    if !data["relations"].is_object() {
        data["relations"] = json!({});
    }
    let slot = &mut data["relations"][predicate];
    let mut uris: Vec<Value> = match slot.take() {
        Value::Array(values) => values,
        Value::String(s) => vec![Value::String(s)],
        _ => Vec::new(),
    };
    let present = uris.iter().any(|v| v.as_str() == Some(uri));
    if !present {
        uris.push(Value::String(uri.to_string()));
    }
    *slot = if uris.len() == 1 {
        uris.swap_remove(0)
    } else {
        Value::Array(uris)
    };
    !present
}

/// Object URIs stored under `predicate` on an item.
pub fn relation_uris<'a>(data: &'a Value, predicate: &str) -> Vec<&'a str> {
    match &data["relations"][predicate] {
        Value::String(s) => vec![s.as_str()],
        Value::Array(values) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Record a citation edge on the citing item. Adding an existing edge is a
/// no-op and does not touch the item's version.
pub async fn add_relation<L: Library + ?Sized>(
    library: &L,
    relation: &CitationRelation,
) -> Result<bool, LibraryError> {
    let uri = relation.object_uri(&library.library_uri());
    update_with_retry(library, &relation.citing_key, |data| {
        insert_relation(data, CitationRelation::PREDICATE, &uri)
    })
    .await
}

/// Insert a tag into an item's `tags`. Returns `false` when already present.
pub fn insert_tag(data: &mut Value, tag: &str) -> bool {
    if !data["tags"].is_array() {
        data["tags"] = json!([]);
    }
    let Some(tags) = data["tags"].as_array_mut() else {
        return false;
    };
    if tags.iter().any(|t| t["tag"].as_str() == Some(tag)) {
        return false;
    }
    tags.push(json!({ "tag": tag }));
    true
}

pub async fn add_tag<L: Library + ?Sized>(
    library: &L,
    key: &str,
    tag: &str,
) -> Result<bool, LibraryError> {
    update_with_retry(library, key, |data| insert_tag(data, tag)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_relation_is_idempotent() {
        let mut data = json!({"title": "Citing"});
        assert!(insert_relation(&mut data, "cito:cites", "http://zotero.org/groups/1/items/A"));
        assert_eq!(data["relations"]["cito:cites"], "http://zotero.org/groups/1/items/A");
        assert!(!insert_relation(&mut data, "cito:cites", "http://zotero.org/groups/1/items/A"));
        assert!(insert_relation(&mut data, "cito:cites", "http://zotero.org/groups/1/items/B"));
        assert_eq!(relation_uris(&data, "cito:cites").len(), 2);
    }

    #[test]
    fn test_insert_tag() {
        let mut data = json!({"tags": [{"tag": "a"}]});
        assert!(insert_tag(&mut data, "unidentified"));
        assert!(!insert_tag(&mut data, "unidentified"));
        assert_eq!(data["tags"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("Cited Journals/ Nature /"), vec!["Cited Journals", "Nature"]);
        assert!(path_segments("").is_empty());
    }

    #[tokio::test]
    async fn test_add_relation_does_not_bump_version_when_present() {
        let library = MemoryLibrary::new("http://zotero.org/groups/1");
        library.insert("CITING1", json!({"itemType": "journalArticle", "title": "Citing"}));

        let rel = CitationRelation::new("CITING1", "ABC123");
        assert!(add_relation(&library, &rel).await.unwrap());
        let v1 = library.fetch("CITING1").await.unwrap().version;

        assert!(!add_relation(&library, &rel).await.unwrap());
        let item = library.fetch("CITING1").await.unwrap();
        assert_eq!(item.version, v1);
        assert_eq!(
            relation_uris(&item.data, CitationRelation::PREDICATE),
            vec!["http://zotero.org/groups/1/items/ABC123"]
        );
    }

    #[tokio::test]
    async fn test_update_with_retry_recovers_from_conflicts() {
        let library = MemoryLibrary::new("http://zotero.org/groups/1");
        library.insert("K", json!({"itemType": "book", "title": "T"}));
        library.fail_next_saves(2);
        assert!(add_tag(&library, "K", "checked").await.unwrap());

        library.fail_next_saves(UPDATE_ATTEMPTS);
        let err = add_tag(&library, "K", "again").await.unwrap_err();
        assert_eq!(err, LibraryError::Conflict { key: "K".into() });
    }
}
