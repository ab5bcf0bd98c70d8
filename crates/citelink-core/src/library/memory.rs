use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{Value, json};

use super::{Library, LibraryError, LibraryFuture, LibraryItem, path_segments};
use crate::model::ItemType;

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<String, LibraryItem>,
    /// `(key, name, parent key)`
    collections: Vec<(String, String, Option<String>)>,
    next_id: usize,
    failing_saves: usize,
}

impl State {
    fn next_key(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:04}", prefix, self.next_id)
    }

    fn find_collection(&self, name: &str, parent: Option<&str>) -> Option<String> {
        self.collections
            .iter()
            .find(|(_, n, p)| n == name && p.as_deref() == parent)
            .map(|(k, _, _)| k.clone())
    }

    fn resolve_path(&mut self, path: &str, create: bool) -> Option<String> {
        let mut parent: Option<String> = None;
        for segment in path_segments(path) {
            let key = match self.find_collection(segment, parent.as_deref()) {
                Some(key) => key,
                None if create => {
                    let key = self.next_key("COLL");
                    self.collections
                        .push((key.clone(), segment.to_string(), parent.clone()));
                    key
                }
                None => return None,
            };
            parent = Some(key);
        }
        parent
    }
}

/// In-process library for tests and dry runs.
#[derive(Debug)]
pub struct MemoryLibrary {
    uri: String,
    state: Mutex<State>,
}

impl MemoryLibrary {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, LibraryError> {
        self.state
            .lock()
            .map_err(|_| LibraryError::Transport("memory library lock poisoned".into()))
    }

    /// Seed an item at version 1.
    pub fn insert(&self, key: &str, data: Value) {
        if let Ok(mut state) = self.state() {
            state.items.insert(
                key.to_string(),
                LibraryItem {
                    key: key.to_string(),
                    version: 1,
                    data,
                },
            );
        }
    }

    /// Make the next `n` saves fail with a version conflict.
    pub fn fail_next_saves(&self, n: usize) {
        if let Ok(mut state) = self.state() {
            state.failing_saves = n;
        }
    }

    pub fn items(&self) -> Vec<LibraryItem> {
        self.state()
            .map(|s| s.items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn item(&self, key: &str) -> Option<LibraryItem> {
        self.state().ok().and_then(|s| s.items.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the items filed in the collection at `path`.
    pub fn collection_members(&self, path: &str) -> Vec<String> {
        let Ok(mut state) = self.state() else {
            return Vec::new();
        };
        let Some(coll) = state.resolve_path(path, false) else {
            return Vec::new();
        };
        state
            .items
            .values()
            .filter(|item| in_collection(&item.data, &coll))
            .map(|item| item.key.clone())
            .collect()
    }
}

fn in_collection(data: &Value, collection: &str) -> bool {
    data["collections"]
        .as_array()
        .is_some_and(|c| c.iter().any(|k| k.as_str() == Some(collection)))
}

/// Field lists of the item types the pipeline creates.
pub fn template_for(item_type: ItemType) -> Value {
    let mut template = json!({
        "itemType": item_type.as_str(),
        "title": "",
        "creators": [],
        "abstractNote": "",
        "date": "",
        "url": "",
        "extra": "",
        "tags": [],
        "collections": [],
        "relations": {}
    });
    let specific: &[&str] = match item_type {
        ItemType::JournalArticle => &["publicationTitle", "volume", "issue", "pages", "DOI", "ISSN"],
        ItemType::Book => &["publisher", "place", "edition", "numPages", "ISBN"],
        ItemType::BookSection => &["bookTitle", "publisher", "place", "pages", "ISBN"],
        ItemType::Other => &["publisher"],
    };
    for field in specific {
        template[*field] = json!("");
    }
    template
}

impl Library for MemoryLibrary {
    fn library_uri(&self) -> String {
        self.uri.clone()
    }

    fn item_template(&self, item_type: ItemType) -> LibraryFuture<'_, Value> {
        Box::pin(async move { Ok(template_for(item_type)) })
    }

    fn create_item<'a>(
        &'a self,
        collection_path: Option<&'a str>,
        mut data: Value,
    ) -> LibraryFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state()?;
            if let Some(coll) = collection_path.and_then(|path| state.resolve_path(path, true)) {
                data["collections"] = json!([coll]);
            }
            let key = state.next_key("ITEM");
            if let Some(obj) = data.as_object_mut() {
                obj.insert("key".into(), json!(key));
                obj.remove("version");
            }
            state.items.insert(
                key.clone(),
                LibraryItem {
                    key: key.clone(),
                    version: 1,
                    data,
                },
            );
            Ok(key)
        })
    }

    fn fetch<'a>(&'a self, key: &'a str) -> LibraryFuture<'a, LibraryItem> {
        Box::pin(async move {
            self.state()?
                .items
                .get(key)
                .cloned()
                .ok_or_else(|| LibraryError::NotFound(key.to_string()))
        })
    }

    fn save<'a>(&'a self, item: &'a LibraryItem) -> LibraryFuture<'a, i64> {
        Box::pin(async move {
            let mut state = self.state()?;
            if state.failing_saves > 0 {
                state.failing_saves -= 1;
                // Someone else wrote in between.
                if let Some(stored) = state.items.get_mut(&item.key) {
                    stored.version += 1;
                }
                return Err(LibraryError::Conflict {
                    key: item.key.clone(),
                });
            }
            let stored = state
                .items
                .get_mut(&item.key)
                .ok_or_else(|| LibraryError::NotFound(item.key.clone()))?;
            if stored.version != item.version {
                return Err(LibraryError::Conflict {
                    key: item.key.clone(),
                });
            }
            stored.version += 1;
            stored.data = item.data.clone();
            Ok(stored.version)
        })
    }

    fn collection_by_path<'a>(&'a self, path: &'a str) -> LibraryFuture<'a, String> {
        Box::pin(async move {
            self.state()?
                .resolve_path(path, true)
                .ok_or_else(|| LibraryError::NotFound(format!("collection {:?}", path)))
        })
    }

    fn collection_items<'a>(
        &'a self,
        path: &'a str,
        start: usize,
        limit: usize,
    ) -> LibraryFuture<'a, Vec<LibraryItem>> {
        Box::pin(async move {
            let mut state = self.state()?;
            let Some(coll) = state.resolve_path(path, false) else {
                return Ok(Vec::new());
            };
            Ok(state
                .items
                .values()
                .filter(|item| in_collection(&item.data, &coll))
                .skip(start)
                .take(limit)
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_files_into_nested_collection() {
        let library = MemoryLibrary::new("http://zotero.org/groups/1");
        let key = library
            .create_item(Some("Cited Journals/Journal of Widgets"), json!({"title": "A"}))
            .await
            .unwrap();
        let again = library.collection_by_path("Cited Journals/Journal of Widgets").await.unwrap();

        assert_eq!(library.collection_members("Cited Journals/Journal of Widgets"), vec![key.clone()]);
        assert_eq!(library.item(&key).unwrap().data["collections"][0], json!(again));
        assert!(library.collection_members("Cited Journals").is_empty());
    }

    #[tokio::test]
    async fn test_save_detects_stale_version() {
        let library = MemoryLibrary::new("u");
        library.insert("K", json!({"title": "T"}));
        let mut item = library.fetch("K").await.unwrap();
        item.data["title"] = json!("T2");
        assert_eq!(library.save(&item).await.unwrap(), 2);
        // Same version again is stale now.
        assert!(matches!(
            library.save(&item).await,
            Err(LibraryError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_collection_items_paginates() {
        let library = MemoryLibrary::new("u");
        for i in 0..5 {
            library
                .create_item(Some("Cited Books"), json!({"title": format!("B{}", i)}))
                .await
                .unwrap();
        }
        assert_eq!(library.collection_items("Cited Books", 0, 3).await.unwrap().len(), 3);
        assert_eq!(library.collection_items("Cited Books", 3, 3).await.unwrap().len(), 2);
        assert!(library.collection_items("Missing", 0, 3).await.unwrap().is_empty());
    }

    #[test]
    fn test_templates_by_type() {
        assert!(template_for(ItemType::BookSection).get("bookTitle").is_some());
        assert!(template_for(ItemType::Book).get("publicationTitle").is_none());
        assert_eq!(template_for(ItemType::JournalArticle)["itemType"], "journalArticle");
    }
}
