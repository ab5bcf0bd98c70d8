//! Zotero Web API v3 client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use super::{Library, LibraryError, LibraryFuture, LibraryItem, path_segments};
use crate::Config;
use crate::model::ItemType;
use crate::rate_limit::{RateLimiters, RetryPolicy, parse_retry_after, service};

const API_VERSION: &str = "3";
const PAGE_SIZE: usize = 100;

/// `(name, parent key)` → collection key
type CollectionIndex = HashMap<(String, Option<String>), String>;

pub struct ZoteroLibrary {
    client: reqwest::Client,
    api_url: String,
    /// `/groups/123` or `/users/123`
    prefix: String,
    uri: String,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
    rate_limiters: Arc<RateLimiters>,
    collections: Mutex<Option<CollectionIndex>>,
    templates: Mutex<HashMap<ItemType, Value>>,
}

impl std::fmt::Debug for ZoteroLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoteroLibrary")
            .field("api_url", &self.api_url)
            .field("prefix", &self.prefix)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ZoteroLibrary {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            api_url: config.library_api_url.trim_end_matches('/').to_string(),
            prefix: format!(
                "/{}/{}",
                config.library_kind.path_segment(),
                config.library_id
            ),
            uri: config.library_uri(),
            api_key: config.library_api_key.clone(),
            timeout: config.timeout(),
            retry: config.retry_policy(),
            rate_limiters: Arc::clone(&config.rate_limiters),
            collections: Mutex::new(None),
            templates: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.api_url, self.prefix, path)
    }

    /// Send with governor pacing. 429s and timeouts are retried with the
    /// configured fixed backoff; the last one escalates as a transient error.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, LibraryError> {
        let limiter = self.rate_limiters.get(service::LIBRARY);
        let mut req = req
            .header("Zotero-API-Version", API_VERSION)
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header("Zotero-API-Key", key);
        }

        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let this_try = req
                .try_clone()
                .ok_or_else(|| LibraryError::Transport("request body cannot be replayed".into()))?;
            if let Some(lim) = limiter {
                lim.acquire().await;
            }

            let err = match this_try.send().await {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if let Some(lim) = limiter {
                        lim.on_rate_limited();
                    }
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    LibraryError::RateLimited { retry_after }
                }
                Ok(resp) => return Ok(resp),
                Err(e) => LibraryError::from(e),
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= attempts {
                tracing::warn!(attempts, error = %err, "library request failed after retries");
                return Err(err);
            }

            let wait = match &err {
                LibraryError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(Duration::from_secs(30)),
                _ => self.retry.backoff,
            };
            tracing::info!(
                attempt,
                wait_secs = wait.as_secs_f64(),
                error = %err,
                "library request failed, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn get_json(&self, url: &str) -> Result<(Value, reqwest::header::HeaderMap), LibraryError> {
        let resp = self.send(self.client.get(url)).await?;
        let resp = error_for_status(resp, url).await?;
        let headers = resp.headers().clone();
        let text = resp.text().await?;
        let value = serde_json::from_str(&text)
            .map_err(|e| LibraryError::Malformed(format!("{}: {}", url, e)))?;
        Ok((value, headers))
    }

    async fn load_collections(&self) -> Result<CollectionIndex, LibraryError> {
        let mut index = CollectionIndex::new();
        let mut start = 0;
        loop {
            let url = self.url(&format!("/collections?start={}&limit={}", start, PAGE_SIZE));
            let (page, _) = self.get_json(&url).await?;
            let entries = page.as_array().cloned().unwrap_or_default();
            for entry in &entries {
                let data = &entry["data"];
                let (Some(key), Some(name)) = (data["key"].as_str(), data["name"].as_str()) else {
                    continue;
                };
                let parent = data["parentCollection"].as_str().map(str::to_string);
                index.insert((name.to_string(), parent), key.to_string());
            }
            if entries.len() < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }
        tracing::debug!(collections = index.len(), "loaded library collections");
        Ok(index)
    }

    async fn create_collection(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, LibraryError> {
        let body = json!([{
            "name": name,
            "parentCollection": parent.map(Value::from).unwrap_or(Value::Bool(false)),
        }]);
        let url = self.url("/collections");
        let resp = self.send(self.client.post(&url).json(&body)).await?;
        let resp = error_for_status(resp, &url).await?;
        let text = resp.text().await?;
        let key = parse_write_response(&text)?;
        tracing::info!(name, key = %key, "created collection");
        Ok(key)
    }

    async fn resolve_collection(&self, path: &str) -> Result<String, LibraryError> {
        let cached = self
            .collections
            .lock()
            .map_err(|_| LibraryError::Transport("collection cache poisoned".into()))?
            .clone();
        let mut index = match cached {
            Some(index) => index,
            None => self.load_collections().await?,
        };

        let mut parent: Option<String> = None;
        for segment in path_segments(path) {
            let lookup = (segment.to_string(), parent.clone());
            let key = match index.get(&lookup) {
                Some(key) => key.clone(),
                None => {
                    let key = self.create_collection(segment, parent.as_deref()).await?;
                    index.insert(lookup, key.clone());
                    key
                }
            };
            parent = Some(key);
        }

        if let Ok(mut slot) = self.collections.lock() {
            *slot = Some(index);
        }
        parent.ok_or_else(|| LibraryError::NotFound(format!("collection {:?}", path)))
    }
}

async fn error_for_status(
    resp: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, LibraryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        404 => Err(LibraryError::NotFound(url.to_string())),
        code => Err(LibraryError::Http {
            status: code,
            message: message.trim().to_string(),
        }),
    }
}

/// Key of the first successful object in a multi-object write response.
pub fn parse_write_response(body: &str) -> Result<String, LibraryError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LibraryError::Malformed(format!("write response: {}", e)))?;
    if let Some(key) = value["successful"]["0"]["key"]
        .as_str()
        .or_else(|| value["success"]["0"].as_str())
    {
        return Ok(key.to_string());
    }
    let failed = &value["failed"]["0"];
    if failed.is_object() {
        return Err(LibraryError::Http {
            status: failed["code"].as_u64().unwrap_or(400) as u16,
            message: failed["message"].as_str().unwrap_or("write failed").to_string(),
        });
    }
    Err(LibraryError::Malformed(format!("write response without key: {}", body)))
}

/// Decode an item envelope (`{key, version, data}`).
pub fn parse_item(value: &Value) -> Result<LibraryItem, LibraryError> {
    let key = value["key"]
        .as_str()
        .ok_or_else(|| LibraryError::Malformed("item without key".into()))?;
    Ok(LibraryItem {
        key: key.to_string(),
        version: value["version"].as_i64().unwrap_or(0),
        data: value["data"].clone(),
    })
}

impl Library for ZoteroLibrary {
    fn library_uri(&self) -> String {
        self.uri.clone()
    }

    fn item_template(&self, item_type: ItemType) -> LibraryFuture<'_, Value> {
        Box::pin(async move {
            if let Some(t) = self.templates.lock().ok().and_then(|t| t.get(&item_type).cloned()) {
                return Ok(t);
            }
            let url = format!("{}/items/new?itemType={}", self.api_url, item_type.as_str());
            let (template, _) = self.get_json(&url).await?;
            if let Ok(mut cache) = self.templates.lock() {
                cache.insert(item_type, template.clone());
            }
            Ok(template)
        })
    }

    fn create_item<'a>(
        &'a self,
        collection_path: Option<&'a str>,
        mut data: Value,
    ) -> LibraryFuture<'a, String> {
        Box::pin(async move {
            if let Some(path) = collection_path {
                let collection = self.resolve_collection(path).await?;
                data["collections"] = json!([collection]);
            }
            if let Some(obj) = data.as_object_mut() {
                obj.remove("key");
                obj.remove("version");
            }
            let url = self.url("/items");
            let resp = self
                .send(self.client.post(&url).json(&json!([data])))
                .await?;
            let resp = error_for_status(resp, &url).await?;
            let text = resp.text().await?;
            let key = parse_write_response(&text)?;
            tracing::info!(key = %key, collection = collection_path.unwrap_or(""), "created item");
            Ok(key)
        })
    }

    fn fetch<'a>(&'a self, key: &'a str) -> LibraryFuture<'a, LibraryItem> {
        Box::pin(async move {
            let url = self.url(&format!("/items/{}", key));
            let (value, _) = self.get_json(&url).await?;
            parse_item(&value)
        })
    }

    fn save<'a>(&'a self, item: &'a LibraryItem) -> LibraryFuture<'a, i64> {
        Box::pin(async move {
            let url = self.url(&format!("/items/{}", item.key));
            let mut data = item.data.clone();
            if let Some(obj) = data.as_object_mut() {
                obj.insert("key".into(), json!(item.key));
                obj.insert("version".into(), json!(item.version));
            }
            let req = self
                .client
                .put(&url)
                .header("If-Unmodified-Since-Version", item.version.to_string())
                .json(&data);
            let resp = self.send(req).await?;
            if resp.status().as_u16() == 412 {
                return Err(LibraryError::Conflict {
                    key: item.key.clone(),
                });
            }
            let resp = error_for_status(resp, &url).await?;
            let version = resp
                .headers()
                .get("Last-Modified-Version")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(item.version + 1);
            Ok(version)
        })
    }

    fn collection_by_path<'a>(&'a self, path: &'a str) -> LibraryFuture<'a, String> {
        Box::pin(self.resolve_collection(path))
    }

    fn collection_items<'a>(
        &'a self,
        path: &'a str,
        start: usize,
        limit: usize,
    ) -> LibraryFuture<'a, Vec<LibraryItem>> {
        Box::pin(async move {
            let collection = self.resolve_collection(path).await?;
            let url = self.url(&format!(
                "/collections/{}/items/top?start={}&limit={}&format=json",
                collection, start, limit
            ));
            let (value, _) = self.get_json(&url).await?;
            value
                .as_array()
                .map(|items| items.iter().map(parse_item).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LibraryKind;

    #[test]
    fn test_parse_write_response() {
        let ok = r#"{"successful": {"0": {"key": "ABCD2345", "version": 7, "data": {}}},
                     "success": {"0": "ABCD2345"}, "unchanged": {}, "failed": {}}"#;
        assert_eq!(parse_write_response(ok).unwrap(), "ABCD2345");

        let failed = r#"{"successful": {}, "success": {}, "unchanged": {},
                         "failed": {"0": {"key": "X", "code": 400, "message": "Invalid itemType"}}}"#;
        assert_eq!(
            parse_write_response(failed).unwrap_err(),
            LibraryError::Http {
                status: 400,
                message: "Invalid itemType".into()
            }
        );
        assert!(matches!(
            parse_write_response("nope"),
            Err(LibraryError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_item_envelope() {
        let item = parse_item(&json!({
            "key": "ABC123", "version": 12,
            "data": {"key": "ABC123", "version": 12, "itemType": "book", "title": "T"}
        }))
        .unwrap();
        assert_eq!(item.key, "ABC123");
        assert_eq!(item.version, 12);
        assert_eq!(item.data["title"], "T");
    }

    #[test]
    fn test_urls_use_library_prefix() {
        let config = Config {
            library_id: "4711".into(),
            library_kind: LibraryKind::User,
            library_api_key: Some("k".into()),
            ..Default::default()
        };
        let library = ZoteroLibrary::new(reqwest::Client::new(), &config);
        assert_eq!(library.url("/items"), "https://api.zotero.org/users/4711/items");
        assert_eq!(library.library_uri(), "http://zotero.org/users/4711");
        assert!(!format!("{:?}", library).contains("\"k\""));
    }

    fn library_at(server: &mockito::ServerGuard) -> ZoteroLibrary {
        let config = Config {
            library_id: "1".into(),
            library_api_url: server.url(),
            max_retries: 3,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        ZoteroLibrary::new(reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn test_create_item_retries_rate_limit_then_escalates() {
        let mut server = mockito::Server::new_async().await;
        let items = server
            .mock("POST", "/groups/1/items")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(3)
            .create_async()
            .await;

        let library = library_at(&server);
        let err = library
            .create_item(None, json!({"itemType": "book", "title": "T"}))
            .await
            .unwrap_err();

        items.assert_async().await;
        assert_eq!(
            err,
            LibraryError::RateLimited {
                retry_after: Some(Duration::ZERO)
            }
        );
        assert!(err.is_transient());
        assert!(crate::CoreError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_save_conflict_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("PUT", "/groups/1/items/ABC123")
            .match_header("if-unmodified-since-version", "5")
            .with_status(412)
            .expect(1)
            .create_async()
            .await;

        let library = library_at(&server);
        let item = LibraryItem {
            key: "ABC123".into(),
            version: 5,
            data: json!({"itemType": "book", "title": "T"}),
        };
        let err = library.save(&item).await.unwrap_err();

        put.assert_async().await;
        assert_eq!(err, LibraryError::Conflict { key: "ABC123".into() });
        assert!(!err.is_transient());
    }
}
