use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub mod authority;
pub mod authors;
pub mod cache;
pub mod cascade;
pub mod config_file;
pub mod disambiguate;
pub mod library;
pub mod matchers;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod rate_limit;
pub mod segmentation;
pub mod translation;

// Re-export for convenience
pub use cache::MatchCache;
pub use cascade::{MatchCascade, Resolution, ResolutionState};
pub use disambiguate::Disambiguator;
pub use library::{Library, LibraryError};
pub use matchers::{MatchContext, MatcherScope, ReferenceMatcher};
pub use model::{CandidateRecord, CitationRelation, CitingDocument, ItemType, MatchChoice};
pub use pipeline::{CitationSink, CitedEntry};
pub use rate_limit::{MatchError, RateLimiters, RetryPolicy};
pub use segmentation::{SegmentedReference, SkipReason, SkipStats};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mirror error: {0}")]
    Mirror(#[from] citelink_mirror::MirrorError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("library error: {0}")]
    Library(#[from] LibraryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("invalid input: {0}")]
    Input(String),
}

impl CoreError {
    /// Timeouts and rate limits; a pass hitting one is retried as a whole.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Match(e) => e.is_transient(),
            CoreError::Http(e) => e.is_timeout(),
            CoreError::Library(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Outcome of one reference, as reported to progress callbacks.
#[derive(Debug, Clone)]
pub enum ReferenceOutcome {
    Resolved {
        state: ResolutionState,
        /// Matcher that produced the record; `None` for unidentified stubs.
        matcher: Option<String>,
        cited_key: String,
        label: String,
    },
    Skipped(SkipReason),
    /// Non-transient error; logged and the reference counted as failed.
    Failed { message: String },
}

/// Progress events emitted during a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    DocumentStarted {
        index: usize,
        total: usize,
        key: String,
        references: usize,
    },
    /// Already present in the export file.
    DocumentSkipped {
        index: usize,
        total: usize,
        key: String,
    },
    Reference {
        doc_key: String,
        index: usize,
        total: usize,
        text: String,
        outcome: ReferenceOutcome,
    },
    DocumentFinished {
        index: usize,
        total: usize,
        key: String,
        stats: RunStats,
    },
    /// The whole pass is restarted after a timeout.
    RetryPass {
        attempt: u32,
        message: String,
    },
}

/// Counters for a document or a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub documents: usize,
    pub documents_skipped: usize,
    pub references: usize,
    pub linked: usize,
    pub created: usize,
    pub unidentified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub skip_reasons: SkipStats,
}

impl RunStats {
    pub fn record(&mut self, outcome: &ReferenceOutcome) {
        self.references += 1;
        match outcome {
            ReferenceOutcome::Resolved { state, .. } => match state {
                ResolutionState::Linked => self.linked += 1,
                ResolutionState::Created => self.created += 1,
                ResolutionState::Unidentified => self.unidentified += 1,
                ResolutionState::Skipped(reason) => {
                    self.skipped += 1;
                    self.skip_reasons.record(*reason);
                }
            },
            ReferenceOutcome::Skipped(reason) => {
                self.skipped += 1;
                self.skip_reasons.record(*reason);
            }
            ReferenceOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.documents += other.documents;
        self.documents_skipped += other.documents_skipped;
        self.references += other.references;
        self.linked += other.linked;
        self.created += other.created;
        self.unidentified += other.unidentified;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.skip_reasons.merge(&other.skip_reasons);
    }
}

/// Kind of library the primary library id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LibraryKind {
    User,
    #[default]
    Group,
}

impl LibraryKind {
    /// URL path segment (`users` / `groups`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            LibraryKind::User => "users",
            LibraryKind::Group => "groups",
        }
    }
}

impl std::str::FromStr for LibraryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" | "users" => Ok(LibraryKind::User),
            "group" | "groups" => Ok(LibraryKind::Group),
            other => Err(format!("unknown library type: {}", other)),
        }
    }
}

/// Default keywords marking a reference as a journal article.
pub const DEFAULT_JOURNAL_KEYWORDS: &[&str] = &[
    "journal",
    "zeitschrift",
    "review",
    "quarterly",
    "law review",
    "vol.",
    "jahrbuch",
    "revue",
    "rivista",
];

/// Matcher names, usable in `disabled_matchers`.
pub mod matcher_names {
    pub const LOCAL_MIRROR: &str = "local";
    pub const DNB: &str = "dnb";
    pub const OPEN_LIBRARY: &str = "openlibrary";
    pub const SEMANTIC_SCHOLAR: &str = "semanticscholar";
    pub const CROSSREF: &str = "crossref";
}

/// Configuration for the matching pipeline.
#[derive(Clone)]
pub struct Config {
    /// Primary library id; records found here are linked, not copied.
    pub library_id: String,
    pub library_kind: LibraryKind,
    pub library_api_key: Option<String>,
    pub library_api_url: String,
    /// Libraries also searched in the mirror; hits are copied.
    pub secondary_library_ids: Vec<String>,
    pub mirror_path: Option<PathBuf>,
    pub mirror_db: Option<Arc<Mutex<citelink_mirror::MirrorIndex>>>,
    pub translation_url: String,
    pub crossref_url: String,
    pub crossref_mailto: Option<String>,
    pub semantic_scholar_url: String,
    pub s2_api_key: Option<String>,
    pub dnb_url: String,
    pub open_library_url: String,
    pub lobid_url: String,
    pub wikidata_url: String,
    pub cache_path: Option<PathBuf>,
    pub flush_every: usize,
    pub timeout_secs: u64,
    /// Attempts per remote call for timeouts and 429s.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Whole-pass restarts after a timeout.
    pub pass_retries: u32,
    pub non_interactive: bool,
    pub ignore_patterns: Vec<String>,
    pub journal_keywords: Vec<String>,
    pub enable_scholarly: bool,
    pub disabled_matchers: Vec<String>,
    pub rate_limiters: Arc<RateLimiters>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("library_id", &self.library_id)
            .field("library_kind", &self.library_kind)
            .field(
                "library_api_key",
                &self.library_api_key.as_ref().map(|_| "***"),
            )
            .field("library_api_url", &self.library_api_url)
            .field("secondary_library_ids", &self.secondary_library_ids)
            .field("mirror_path", &self.mirror_path)
            .field("mirror_db", &self.mirror_db.as_ref().map(|_| "<open>"))
            .field("translation_url", &self.translation_url)
            .field("crossref_url", &self.crossref_url)
            .field(
                "crossref_mailto",
                &self.crossref_mailto.as_ref().map(|_| "***"),
            )
            .field("semantic_scholar_url", &self.semantic_scholar_url)
            .field("s2_api_key", &self.s2_api_key.as_ref().map(|_| "***"))
            .field("dnb_url", &self.dnb_url)
            .field("open_library_url", &self.open_library_url)
            .field("lobid_url", &self.lobid_url)
            .field("wikidata_url", &self.wikidata_url)
            .field("cache_path", &self.cache_path)
            .field("flush_every", &self.flush_every)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("pass_retries", &self.pass_retries)
            .field("non_interactive", &self.non_interactive)
            .field("ignore_patterns", &self.ignore_patterns)
            .field("journal_keywords", &self.journal_keywords)
            .field("enable_scholarly", &self.enable_scholarly)
            .field("disabled_matchers", &self.disabled_matchers)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_id: String::new(),
            library_kind: LibraryKind::Group,
            library_api_key: None,
            library_api_url: "https://api.zotero.org".to_string(),
            secondary_library_ids: vec![],
            mirror_path: None,
            mirror_db: None,
            translation_url: "http://127.0.0.1:1969".to_string(),
            crossref_url: "https://api.crossref.org".to_string(),
            crossref_mailto: None,
            semantic_scholar_url: "https://api.semanticscholar.org/graph/v1".to_string(),
            s2_api_key: None,
            dnb_url: "https://services.dnb.de/sru/dnb".to_string(),
            open_library_url: "https://openlibrary.org".to_string(),
            lobid_url: "https://lobid.org/gnd".to_string(),
            wikidata_url: "https://www.wikidata.org/w/api.php".to_string(),
            cache_path: None,
            flush_every: cache::DEFAULT_FLUSH_EVERY,
            timeout_secs: 20,
            max_retries: 3,
            retry_backoff_ms: 2000,
            pass_retries: 3,
            non_interactive: false,
            ignore_patterns: vec![],
            journal_keywords: DEFAULT_JOURNAL_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enable_scholarly: false,
            disabled_matchers: vec![],
            rate_limiters: Arc::new(RateLimiters::default()),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.max_retries.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Libraries searched in the mirror, primary first.
    pub fn mirror_library_ids(&self) -> Vec<String> {
        std::iter::once(self.library_id.clone())
            .chain(self.secondary_library_ids.iter().cloned())
            .filter(|id| !id.is_empty())
            .collect()
    }

    pub fn is_matcher_enabled(&self, name: &str) -> bool {
        !self
            .disabled_matchers
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }

    /// URI prefix of the primary library, e.g. `http://zotero.org/groups/123`.
    pub fn library_uri(&self) -> String {
        format!(
            "http://zotero.org/{}/{}",
            self.library_kind.path_segment(),
            self.library_id
        )
    }

    /// Open the mirror at `mirror_path` unless it is already open.
    pub fn open_mirror(&mut self) -> Result<(), CoreError> {
        if self.mirror_db.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.mirror_path {
            let index = citelink_mirror::MirrorIndex::open(path)?;
            tracing::info!(path = %path.display(), "opened library mirror");
            self.mirror_db = Some(Arc::new(Mutex::new(index)));
        }
        Ok(())
    }
}

/// Build the HTTP client shared by matchers and library calls.
pub fn build_http_client(config: &Config) -> Result<reqwest::Client, CoreError> {
    let user_agent = match &config.crossref_mailto {
        Some(mail) => format!("citelink/{} (mailto:{})", env!("CARGO_PKG_VERSION"), mail),
        None => format!("citelink/{}", env!("CARGO_PKG_VERSION")),
    };
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(config.timeout())
        .build()?)
}
