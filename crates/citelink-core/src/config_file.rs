use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Config, LibraryKind};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub library: Option<LibraryConfig>,
    pub services: Option<ServicesConfig>,
    pub matching: Option<MatchingConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub id: Option<String>,
    /// `user` or `group`.
    pub kind: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub secondary_ids: Option<Vec<String>>,
    pub mirror_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub translation_url: Option<String>,
    pub crossref_url: Option<String>,
    pub crossref_mailto: Option<String>,
    pub semantic_scholar_url: Option<String>,
    pub s2_api_key: Option<String>,
    pub dnb_url: Option<String>,
    pub open_library_url: Option<String>,
    pub lobid_url: Option<String>,
    pub wikidata_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub ignore_patterns: Option<Vec<String>>,
    pub journal_keywords: Option<Vec<String>>,
    pub enable_scholarly: Option<bool>,
    pub disabled: Option<Vec<String>>,
    pub pass_retries: Option<u32>,
    pub non_interactive: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
    pub flush_every: Option<usize>,
}

/// Platform config directory path: `<config_dir>/citelink/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("citelink").join("config.toml"))
}

/// Load config by cascading CWD `.citelink.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".citelink.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

/// `overlay` if set, else `base`.
fn pick<S, T>(base: &Option<S>, overlay: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bl, ol) = (&base.library, &overlay.library);
    let (bs, os) = (&base.services, &overlay.services);
    let (bm, om) = (&base.matching, &overlay.matching);
    let (bc, oc) = (&base.cache, &overlay.cache);

    ConfigFile {
        library: Some(LibraryConfig {
            id: pick(bl, ol, |l| l.id.clone()),
            kind: pick(bl, ol, |l| l.kind.clone()),
            api_key: pick(bl, ol, |l| l.api_key.clone()),
            api_url: pick(bl, ol, |l| l.api_url.clone()),
            secondary_ids: pick(bl, ol, |l| l.secondary_ids.clone()),
            mirror_path: pick(bl, ol, |l| l.mirror_path.clone()),
        }),
        services: Some(ServicesConfig {
            translation_url: pick(bs, os, |s| s.translation_url.clone()),
            crossref_url: pick(bs, os, |s| s.crossref_url.clone()),
            crossref_mailto: pick(bs, os, |s| s.crossref_mailto.clone()),
            semantic_scholar_url: pick(bs, os, |s| s.semantic_scholar_url.clone()),
            s2_api_key: pick(bs, os, |s| s.s2_api_key.clone()),
            dnb_url: pick(bs, os, |s| s.dnb_url.clone()),
            open_library_url: pick(bs, os, |s| s.open_library_url.clone()),
            lobid_url: pick(bs, os, |s| s.lobid_url.clone()),
            wikidata_url: pick(bs, os, |s| s.wikidata_url.clone()),
            timeout_secs: pick(bs, os, |s| s.timeout_secs),
            max_retries: pick(bs, os, |s| s.max_retries),
            retry_backoff_ms: pick(bs, os, |s| s.retry_backoff_ms),
        }),
        matching: Some(MatchingConfig {
            ignore_patterns: pick(bm, om, |m| m.ignore_patterns.clone()),
            journal_keywords: pick(bm, om, |m| m.journal_keywords.clone()),
            enable_scholarly: pick(bm, om, |m| m.enable_scholarly),
            disabled: pick(bm, om, |m| m.disabled.clone()),
            pass_retries: pick(bm, om, |m| m.pass_retries),
            non_interactive: pick(bm, om, |m| m.non_interactive),
        }),
        cache: Some(CacheConfig {
            path: pick(bc, oc, |c| c.path.clone()),
            flush_every: pick(bc, oc, |c| c.flush_every),
        }),
    }
}

impl ConfigFile {
    /// Copy every value present in the file onto `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(library) = &self.library {
            if let Some(id) = &library.id {
                config.library_id = id.clone();
            }
            if let Some(kind) = &library.kind {
                match kind.parse::<LibraryKind>() {
                    Ok(kind) => config.library_kind = kind,
                    Err(e) => tracing::warn!(error = %e, "ignoring library kind from config file"),
                }
            }
            if library.api_key.is_some() {
                config.library_api_key = library.api_key.clone();
            }
            if let Some(url) = &library.api_url {
                config.library_api_url = url.clone();
            }
            if let Some(ids) = &library.secondary_ids {
                config.secondary_library_ids = ids.clone();
            }
            if let Some(path) = &library.mirror_path {
                config.mirror_path = Some(PathBuf::from(path));
            }
        }

        if let Some(services) = &self.services {
            let urls = [
                (&services.translation_url, &mut config.translation_url),
                (&services.crossref_url, &mut config.crossref_url),
                (&services.semantic_scholar_url, &mut config.semantic_scholar_url),
                (&services.dnb_url, &mut config.dnb_url),
                (&services.open_library_url, &mut config.open_library_url),
                (&services.lobid_url, &mut config.lobid_url),
                (&services.wikidata_url, &mut config.wikidata_url),
            ];
            for (value, target) in urls {
                if let Some(url) = value {
                    *target = url.clone();
                }
            }
            if services.crossref_mailto.is_some() {
                config.crossref_mailto = services.crossref_mailto.clone();
            }
            if services.s2_api_key.is_some() {
                config.s2_api_key = services.s2_api_key.clone();
            }
            if let Some(secs) = services.timeout_secs {
                config.timeout_secs = secs;
            }
            if let Some(retries) = services.max_retries {
                config.max_retries = retries;
            }
            if let Some(ms) = services.retry_backoff_ms {
                config.retry_backoff_ms = ms;
            }
        }

        if let Some(matching) = &self.matching {
            if let Some(patterns) = &matching.ignore_patterns {
                config.ignore_patterns = patterns.clone();
            }
            if let Some(keywords) = &matching.journal_keywords {
                config.journal_keywords = keywords.clone();
            }
            if let Some(enabled) = matching.enable_scholarly {
                config.enable_scholarly = enabled;
            }
            if let Some(disabled) = &matching.disabled {
                config.disabled_matchers = disabled.clone();
            }
            if let Some(passes) = matching.pass_retries {
                config.pass_retries = passes;
            }
            if let Some(non_interactive) = matching.non_interactive {
                config.non_interactive = non_interactive;
            }
        }

        if let Some(cache) = &self.cache {
            if let Some(path) = &cache.path {
                config.cache_path = Some(PathBuf::from(path));
            }
            if let Some(every) = cache.flush_every {
                config.flush_every = every;
            }
        }
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
    Ok(path)
}
