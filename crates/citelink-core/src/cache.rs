//! On-disk lookup cache for resolved identifiers.
//!
//! Maps namespaced keys (`doi:`, `isbn:`, `gnd:`, `wikidata:`) to JSON
//! values. The file is read once by [`MatchCache::load`], mutated in memory,
//! and written back every `flush_every` insertions and once more at the end
//! of a run. A crash between flushes loses at most `flush_every` entries;
//! those are simply looked up again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CoreError;

/// Default number of insertions between periodic flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Key namespaces.
pub mod ns {
    pub const DOI: &str = "doi";
    pub const ISBN: &str = "isbn";
    pub const GND: &str = "gnd";
    pub const WIKIDATA: &str = "wikidata";
}

/// Build a namespaced cache key. The id is trimmed and lowercased.
pub fn cache_key(namespace: &str, id: &str) -> String {
    format!("{}:{}", namespace, id.trim().to_lowercase())
}

pub struct MatchCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, serde_json::Value>>,
    /// Insertions since the last successful flush.
    pending: AtomicUsize,
    flush_every: usize,
}

impl std::fmt::Debug for MatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCache")
            .field("path", &self.path)
            .field("entries", &self.len())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("flush_every", &self.flush_every)
            .finish()
    }
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MatchCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }

    /// Load the cache file at `path`. A missing file yields an empty cache
    /// that will be created on the first flush.
    pub fn load(path: &Path, flush_every: usize) -> Result<Self, CoreError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                CoreError::Cache(format!("failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "loaded match cache");

        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
            pending: AtomicUsize::new(0),
            flush_every: flush_every.max(1),
        })
    }

    /// Look up and decode a cached value. Entries that no longer decode as
    /// `T` are treated as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().ok()?;
        let value = entries.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(key))
            .unwrap_or(false)
    }

    /// Insert a value, flushing if the periodic threshold is reached.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CoreError> {
        let value = serde_json::to_value(value)
            .map_err(|e| CoreError::Cache(format!("failed to encode {}: {}", key, e)))?;
        {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| CoreError::Cache("cache lock poisoned".into()))?;
            entries.insert(key.to_string(), value);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.flush(false)?;
        Ok(())
    }

    /// Write the cache to disk.
    ///
    /// Without `force`, only writes once `flush_every` insertions are
    /// pending. Returns whether a write happened. In-memory caches never
    /// write.
    pub fn flush(&self, force: bool) -> Result<bool, CoreError> {
        let pending = self.pending.load(Ordering::SeqCst);
        if !force && pending < self.flush_every {
            return Ok(false);
        }
        let Some(path) = &self.path else {
            self.pending.store(0, Ordering::SeqCst);
            return Ok(false);
        };

        let content = {
            let entries = self
                .entries
                .lock()
                .map_err(|_| CoreError::Cache("cache lock poisoned".into()))?;
            serde_json::to_string(&*entries)
                .map_err(|e| CoreError::Cache(format!("failed to encode cache: {}", e)))?
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;

        self.pending.store(0, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), entries = self.len(), "flushed match cache");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
