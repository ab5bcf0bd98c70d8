//! Match cascade: runs the matchers in priority order for one reference and
//! turns the first hit (or the lack of one) into a library record.

use serde_json::Value;

use crate::authors::initials;
use crate::library::{Library, insert_tag};
use crate::matchers::{MatchContext, ReferenceMatcher};
use crate::matchers::{
    crossref::Crossref, dnb::Dnb, local_mirror::LocalMirror, open_library::OpenLibrary,
    semantic_scholar::SemanticScholar,
};
use crate::model::{CandidateRecord, Creator, ItemType, RawPerson, RawSegmentation};
use crate::segmentation::{self, SegmentedReference, SkipReason};
use crate::{Config, CoreError, matcher_names};

pub const JOURNALS_COLLECTION: &str = "Cited Journals";
pub const BOOKS_COLLECTION: &str = "Cited Books";
pub const UNIDENTIFIED_COLLECTION: &str = "Cited Unidentified";
pub const UNIDENTIFIED_TAG: &str = "unidentified";

/// Terminal state of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Matched a record already in the primary library.
    Linked,
    /// Matched elsewhere; a new record was created.
    Created,
    /// No match; a stub was created for manual review.
    Unidentified,
    Skipped(SkipReason),
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Linked => "linked",
            ResolutionState::Created => "created",
            ResolutionState::Unidentified => "unidentified",
            ResolutionState::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub state: ResolutionState,
    /// The cited record, carrying its library key. `None` only when skipped.
    pub record: Option<CandidateRecord>,
    /// Matcher that found the record.
    pub matcher: Option<String>,
}

impl Resolution {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            state: ResolutionState::Skipped(reason),
            record: None,
            matcher: None,
        }
    }

    pub fn cited_key(&self) -> Option<&str> {
        self.record.as_ref().and_then(|r| r.key.as_deref())
    }
}

/// Journal heuristic: a parsed source field, or a journal keyword in the text.
pub fn looks_like_journal(text: &str, seg: &RawSegmentation, keywords: &[String]) -> bool {
    if seg.source().is_some() {
        return true;
    }
    let lower = text.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.trim().is_empty() && lower.contains(&k.trim().to_lowercase()))
}

/// Collection a newly created record is filed under.
pub fn target_collection(record: &CandidateRecord) -> String {
    match record.item_type {
        ItemType::JournalArticle => match record.container() {
            Some(journal) => format!("{}/{}", JOURNALS_COLLECTION, journal.replace('/', "-")),
            None => JOURNALS_COLLECTION.to_string(),
        },
        ItemType::BookSection => {
            let author = record
                .first_creator()
                .and_then(Creator::surname)
                .unwrap_or("Anon");
            let year = record.year().map(|y| y.to_string()).unwrap_or_default();
            let book = record.container().unwrap_or(&record.title);
            let label = [author, year.as_str(), book]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}/{}", BOOKS_COLLECTION, label.replace('/', "-"))
        }
        _ => BOOKS_COLLECTION.to_string(),
    }
}

fn stub_creator(person: &RawPerson) -> Option<Creator> {
    let surname = person.surname()?.trim();
    if surname.is_empty() {
        return None;
    }
    let given = person
        .given_names()
        .map(|g| {
            initials(g)
                .iter()
                .map(|c| format!("{}.", c))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    Some(Creator::person(surname, given))
}

/// Minimal record built from the segmentation when no matcher succeeds.
pub fn synthesize_unidentified(seg: &RawSegmentation, key: &SegmentedReference) -> CandidateRecord {
    let mut creators: Vec<Creator> = seg
        .author
        .iter()
        .filter_map(|group| group.first())
        .filter_map(stub_creator)
        .collect();
    creators.extend(
        seg.editor
            .iter()
            .filter_map(|group| group.first())
            .filter_map(stub_creator)
            .map(Creator::editor),
    );

    let pages = match (seg.fpage(), seg.lpage()) {
        (Some(first), Some(last)) => Some(format!("{}-{}", first, last)),
        (Some(first), None) => Some(first.to_string()),
        _ => None,
    };

    let mut record = CandidateRecord {
        creators,
        title: key.title.clone(),
        date: key.year.to_string(),
        ..Default::default()
    };

    match seg.source() {
        Some(source) if seg.has_editor() => {
            record.item_type = ItemType::BookSection;
            record.book_title = Some(source.to_string());
            record.pages = pages;
            record.publisher = seg.publisher().map(str::to_string);
            record.place = seg.location().map(str::to_string);
        }
        Some(source) => {
            record.item_type = ItemType::JournalArticle;
            record.publication_title = Some(source.to_string());
            record.volume = seg.volume().map(str::to_string);
            record.issue = seg.issue().map(str::to_string);
            record.pages = pages;
        }
        None => {
            record.item_type = ItemType::Book;
            record.publisher = seg.publisher().map(str::to_string);
            record.place = seg.location().map(str::to_string);
        }
    }
    record
}

/// Lay `record` over the library's template for its type. Only fields the
/// template knows are copied; `key` and `version` never are.
pub fn merge_over_template(template: Value, record: &CandidateRecord) -> Value {
    let Value::Object(source) = record.to_item_json() else {
        return template;
    };
    let Value::Object(mut merged) = template else {
        let mut source = source;
        source.remove("key");
        source.remove("version");
        return Value::Object(source);
    };
    for (field, value) in source {
        if field == "key" || field == "version" {
            continue;
        }
        if field == "itemType" || merged.contains_key(&field) {
            merged.insert(field, value);
        } else {
            tracing::debug!(field = %field, "field not in item template, dropped");
        }
    }
    Value::Object(merged)
}

/// Ordered list of matchers; the first non-empty answer wins.
pub struct MatchCascade {
    matchers: Vec<Box<dyn ReferenceMatcher>>,
}

impl MatchCascade {
    pub fn new(matchers: Vec<Box<dyn ReferenceMatcher>>) -> Self {
        Self { matchers }
    }

    /// Local mirror, Crossref, DNB, Open Library, then Semantic Scholar when
    /// enabled. Disabled matchers and a missing mirror are left out.
    pub fn from_config(config: &Config) -> Self {
        let mut matchers: Vec<Box<dyn ReferenceMatcher>> = Vec::new();
        if let Some(db) = &config.mirror_db {
            matchers.push(Box::new(LocalMirror {
                db: std::sync::Arc::clone(db),
            }));
        }
        matchers.push(Box::new(Crossref));
        matchers.push(Box::new(Dnb));
        matchers.push(Box::new(OpenLibrary));
        if config.enable_scholarly {
            matchers.push(Box::new(SemanticScholar));
        }
        matchers.retain(|m| {
            let enabled = config.is_matcher_enabled(m.name());
            if !enabled {
                tracing::info!(matcher = m.name(), "matcher disabled");
            }
            enabled
        });
        Self::new(matchers)
    }

    pub fn matcher_names(&self) -> Vec<&str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Run the matchers for one segmented reference.
    ///
    /// Transient errors propagate. Any other matcher error is logged with
    /// its payload and the next matcher is tried.
    pub async fn find(
        &self,
        text: &str,
        seg: &RawSegmentation,
        key: &SegmentedReference,
        ctx: MatchContext<'_>,
    ) -> Result<Option<(CandidateRecord, String)>, CoreError> {
        let is_journal = looks_like_journal(text, seg, &ctx.config.journal_keywords);
        for matcher in &self.matchers {
            if !matcher.scope().applies(is_journal) {
                continue;
            }
            match matcher.find(text, key, ctx).await {
                Ok(Some(record)) => {
                    tracing::debug!(matcher = matcher.name(), title = %record.title, "matched");
                    return Ok(Some((record, matcher.name().to_string())));
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    let payload = match &e {
                        crate::MatchError::Malformed { payload, .. } => payload.as_str(),
                        _ => "",
                    };
                    tracing::warn!(matcher = matcher.name(), error = %e, payload, "matcher failed");
                }
            }
        }
        Ok(None)
    }

    /// Resolve one reference to a library record.
    pub async fn resolve<L: Library + ?Sized>(
        &self,
        text: &str,
        seg: &RawSegmentation,
        ctx: MatchContext<'_>,
        library: &L,
    ) -> Result<Resolution, CoreError> {
        let key = match segmentation::segment(text, seg, &ctx.config.ignore_patterns) {
            Ok(key) => key,
            Err(reason) => {
                tracing::debug!(reason = %reason, "reference skipped");
                return Ok(Resolution::skipped(reason));
            }
        };

        if let Some((mut record, matcher)) = self.find(text, seg, &key, ctx).await? {
            if record.key.is_some() {
                return Ok(Resolution {
                    state: ResolutionState::Linked,
                    record: Some(record),
                    matcher: Some(matcher),
                });
            }
            let template = library.item_template(record.item_type).await?;
            let data = merge_over_template(template, &record);
            let collection = target_collection(&record);
            let new_key = library.create_item(Some(&collection), data).await?;
            tracing::info!(key = %new_key, matcher = %matcher, collection = %collection, "created cited record");
            record.key = Some(new_key);
            return Ok(Resolution {
                state: ResolutionState::Created,
                record: Some(record),
                matcher: Some(matcher),
            });
        }

        let mut stub = synthesize_unidentified(seg, &key);
        let template = library.item_template(stub.item_type).await?;
        let mut data = merge_over_template(template, &stub);
        insert_tag(&mut data, UNIDENTIFIED_TAG);
        let new_key = library
            .create_item(Some(UNIDENTIFIED_COLLECTION), data)
            .await?;
        tracing::info!(key = %new_key, title = %stub.title, "created unidentified stub");
        stub.key = Some(new_key);
        Ok(Resolution {
            state: ResolutionState::Unidentified,
            record: Some(stub),
            matcher: None,
        })
    }
}

impl Default for MatchCascade {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Whether `name` is one of the built-in matchers.
pub fn is_known_matcher(name: &str) -> bool {
    [
        matcher_names::LOCAL_MIRROR,
        matcher_names::CROSSREF,
        matcher_names::DNB,
        matcher_names::OPEN_LIBRARY,
        matcher_names::SEMANTIC_SCHOLAR,
    ]
    .iter()
    .any(|n| n.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::MemoryLibrary;
    use crate::matchers::mock::{MockMatcher, MockResponse};
    use crate::matchers::MatcherScope;
    use crate::model::Scored;
    use crate::MatchCache;
    use serde_json::json;

    fn widgets_seg() -> RawSegmentation {
        RawSegmentation {
            author: vec![vec![RawPerson::new("Smith", "")]],
            title: vec![Scored::new("On Widgets", 0.3)],
            year: vec![Scored::new("1998", 0.1)],
            source: vec![Scored::new("Journal of Widgets", 0.2)],
            volume: vec![Scored::new("12", 0.1)],
            fpage: vec![Scored::new("45", 0.1)],
            lpage: vec![Scored::new("60", 0.1)],
            ..Default::default()
        }
    }

    const TEXT: &str = "Smith, J. (1998). On Widgets. Journal of Widgets, 12, 45–60.";

    fn journal_record(key: Option<&str>) -> CandidateRecord {
        CandidateRecord {
            item_type: ItemType::JournalArticle,
            title: "On Widgets".into(),
            date: "1998".into(),
            creators: vec![Creator::person("Smith", "John")],
            publication_title: Some("Journal of Widgets".into()),
            key: key.map(str::to_string),
            ..Default::default()
        }
    }

    struct Harness {
        config: Config,
        cache: MatchCache,
        client: reqwest::Client,
        library: MemoryLibrary,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: Config::default(),
                cache: MatchCache::in_memory(),
                client: reqwest::Client::new(),
                library: MemoryLibrary::new("http://zotero.org/groups/1"),
            }
        }

        fn ctx(&self) -> MatchContext<'_> {
            MatchContext {
                client: &self.client,
                config: &self.config,
                cache: &self.cache,
                disambiguator: None,
            }
        }
    }

    #[test]
    fn test_looks_like_journal() {
        let keywords = vec!["journal".to_string()];
        assert!(looks_like_journal("x", &widgets_seg(), &keywords));
        let no_source = RawSegmentation::default();
        assert!(looks_like_journal("Foo Journal 3", &no_source, &keywords));
        assert!(!looks_like_journal("Foo Press, Berlin", &no_source, &keywords));
    }

    #[test]
    fn test_target_collection() {
        assert_eq!(
            target_collection(&journal_record(None)),
            "Cited Journals/Journal of Widgets"
        );
        let section = CandidateRecord {
            item_type: ItemType::BookSection,
            title: "Chapter".into(),
            date: "2001".into(),
            creators: vec![Creator::person("Jones", "A.")],
            book_title: Some("The Widget Handbook".into()),
            ..Default::default()
        };
        assert_eq!(target_collection(&section), "Cited Books/Jones 2001 The Widget Handbook");
        let book = CandidateRecord {
            item_type: ItemType::Book,
            ..Default::default()
        };
        assert_eq!(target_collection(&book), "Cited Books");
    }

    #[test]
    fn test_synthesize_types() {
        let key = segmentation::normalize(&widgets_seg()).unwrap();
        let article = synthesize_unidentified(&widgets_seg(), &key);
        assert_eq!(article.item_type, ItemType::JournalArticle);
        assert_eq!(article.pages.as_deref(), Some("45-60"));
        assert_eq!(article.volume(), Some("12"));

        let mut seg = widgets_seg();
        seg.editor = vec![vec![RawPerson::new("Doe", "Jane Q")]];
        let section = synthesize_unidentified(&seg, &key);
        assert_eq!(section.item_type, ItemType::BookSection);
        assert_eq!(section.book_title.as_deref(), Some("Journal of Widgets"));
        assert_eq!(section.creators[1].first_name.as_deref(), Some("J. Q."));
        assert_eq!(section.creators[1].creator_type, "editor");

        let mut seg = widgets_seg();
        seg.source.clear();
        assert_eq!(synthesize_unidentified(&seg, &key).item_type, ItemType::Book);
    }

    #[test]
    fn test_merge_over_template_keeps_template_fields_only() {
        let template = json!({"itemType": "journalArticle", "title": "", "publicationTitle": "", "tags": []});
        let mut record = journal_record(Some("SHOULDNOTCOPY"));
        record.publisher = Some("Widget Press".into());
        let merged = merge_over_template(template, &record);
        assert_eq!(merged["title"], "On Widgets");
        assert_eq!(merged["publicationTitle"], "Journal of Widgets");
        assert!(merged.get("publisher").is_none());
        assert!(merged.get("key").is_none());
        assert!(merged.get("creators").is_none());
    }

    #[tokio::test]
    async fn test_local_wins_over_doi_index() {
        let h = Harness::new();
        let local = MockMatcher::new(
            matcher_names::LOCAL_MIRROR,
            MockResponse::Found(journal_record(Some("ABC123"))),
        );
        let crossref = MockMatcher::new(
            matcher_names::CROSSREF,
            MockResponse::Found(journal_record(None)),
        )
        .with_scope(MatcherScope::JournalOnly);
        let cascade = MatchCascade::new(vec![Box::new(local), Box::new(crossref)]);

        let resolution = cascade
            .resolve(TEXT, &widgets_seg(), h.ctx(), &h.library)
            .await
            .unwrap();
        assert_eq!(resolution.state, ResolutionState::Linked);
        assert_eq!(resolution.cited_key(), Some("ABC123"));
        assert!(h.library.is_empty());
    }

    #[tokio::test]
    async fn test_scope_routes_books_to_catalogs() {
        let h = Harness::new();
        let crossref = MockMatcher::new(
            matcher_names::CROSSREF,
            MockResponse::Found(journal_record(None)),
        )
        .with_scope(MatcherScope::JournalOnly);
        let book = CandidateRecord {
            item_type: ItemType::Book,
            title: "On Widgets".into(),
            date: "1998".into(),
            isbn: Some("9780000000001".into()),
            ..Default::default()
        };
        let dnb = MockMatcher::new(matcher_names::DNB, MockResponse::Found(book))
            .with_scope(MatcherScope::NonJournalOnly);
        let cascade = MatchCascade::new(vec![Box::new(crossref), Box::new(dnb)]);

        let mut seg = widgets_seg();
        seg.source.clear();
        let resolution = cascade
            .resolve("Smith 1998 On Widgets. Berlin", &seg, h.ctx(), &h.library)
            .await
            .unwrap();
        assert_eq!(resolution.state, ResolutionState::Created);
        assert_eq!(resolution.matcher.as_deref(), Some(matcher_names::DNB));
        let key = resolution.cited_key().unwrap();
        assert_eq!(h.library.collection_members("Cited Books"), vec![key.to_string()]);
        assert_eq!(h.library.item(key).unwrap().data["ISBN"], "9780000000001");
    }

    #[tokio::test]
    async fn test_malformed_matcher_falls_through() {
        let h = Harness::new();
        let broken = MockMatcher::new("broken", MockResponse::Malformed("<html>".into()));
        let good = MockMatcher::new("good", MockResponse::Found(journal_record(None)));
        let cascade = MatchCascade::new(vec![Box::new(broken), Box::new(good)]);
        let resolution = cascade
            .resolve(TEXT, &widgets_seg(), h.ctx(), &h.library)
            .await
            .unwrap();
        assert_eq!(resolution.state, ResolutionState::Created);
    }

    #[tokio::test]
    async fn test_timeout_propagates() {
        let h = Harness::new();
        let slow = MockMatcher::new("slow", MockResponse::Timeout);
        let never = MockMatcher::new("never", MockResponse::NotFound);
        let cascade = MatchCascade::new(vec![Box::new(slow), Box::new(never)]);
        let err = cascade
            .resolve(TEXT, &widgets_seg(), h.ctx(), &h.library)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_unidentified_stub_is_tagged() {
        let h = Harness::new();
        let cascade = MatchCascade::new(vec![Box::new(MockMatcher::new("none", MockResponse::NotFound))]);
        let resolution = cascade
            .resolve(TEXT, &widgets_seg(), h.ctx(), &h.library)
            .await
            .unwrap();
        assert_eq!(resolution.state, ResolutionState::Unidentified);
        let item = h.library.item(resolution.cited_key().unwrap()).unwrap();
        assert_eq!(item.data["itemType"], "journalArticle");
        assert_eq!(item.data["tags"][0]["tag"], UNIDENTIFIED_TAG);
        assert_eq!(h.library.collection_members(UNIDENTIFIED_COLLECTION).len(), 1);
    }

    #[tokio::test]
    async fn test_skip_never_reaches_matchers() {
        let h = Harness::new();
        let mock = std::sync::Arc::new(MockMatcher::new("m", MockResponse::NotFound));
        let cascade = MatchCascade::new(vec![Box::new(ArcMatcher(mock.clone()))]);
        let mut seg = widgets_seg();
        seg.year.clear();
        let resolution = cascade.resolve(TEXT, &seg, h.ctx(), &h.library).await.unwrap();
        assert_eq!(resolution.state, ResolutionState::Skipped(SkipReason::MissingYear));
        assert_eq!(mock.call_count(), 0);
        assert!(h.library.is_empty());
    }

    struct ArcMatcher(std::sync::Arc<MockMatcher>);

    impl ReferenceMatcher for ArcMatcher {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn scope(&self) -> MatcherScope {
            self.0.scope()
        }
        fn ambiguity_policy(&self) -> crate::matching::AmbiguityPolicy {
            self.0.ambiguity_policy()
        }
        fn find<'a>(
            &'a self,
            text: &'a str,
            key: &'a SegmentedReference,
            ctx: MatchContext<'a>,
        ) -> crate::matchers::MatchFuture<'a> {
            self.0.find(text, key, ctx)
        }
    }

    #[test]
    fn test_known_matchers() {
        assert!(is_known_matcher("CrossRef"));
        assert!(!is_known_matcher("google"));
    }
}
