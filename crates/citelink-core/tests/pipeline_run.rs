//! End-to-end runs of the [`Pipeline`] over an in-process library.
//!
//! All matchers are mocks, so no HTTP requests are made.

use std::sync::Mutex;

use citelink_core::library::{MemoryLibrary, relation_uris};
use citelink_core::matchers::mock::{MockMatcher, MockResponse};
use citelink_core::model::{Creator, RawPerson, RawSegmentation, ReferenceInput, Scored};
use citelink_core::pipeline::{MemorySink, Pipeline};
use citelink_core::{
    CandidateRecord, CitationRelation, CitingDocument, Config, ItemType, MatchCache, MatchCascade,
    MatchContext, ProgressEvent, ReferenceMatcher, ResolutionState,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const LIBRARY_URI: &str = "http://zotero.org/groups/1";

fn widgets_reference() -> ReferenceInput {
    ReferenceInput {
        text: "Smith, J. (1998). On Widgets. Journal of Widgets, 12, 45-60.".into(),
        segmentation: RawSegmentation {
            author: vec![vec![RawPerson::new("Smith", "J.")]],
            title: vec![Scored::new("On Widgets", 0.3)],
            year: vec![Scored::new("1998", 0.1)],
            source: vec![Scored::new("Journal of Widgets", 0.2)],
            volume: vec![Scored::new("12", 0.1)],
            fpage: vec![Scored::new("45", 0.1)],
            ..Default::default()
        },
    }
}

fn yearless_reference() -> ReferenceInput {
    ReferenceInput {
        text: "Jones, A. Untitled notes.".into(),
        segmentation: RawSegmentation {
            author: vec![vec![RawPerson::new("Jones", "A.")]],
            title: vec![Scored::new("Untitled notes", 0.2)],
            ..Default::default()
        },
    }
}

fn citing(key: &str, references: Vec<ReferenceInput>) -> CitingDocument {
    CitingDocument {
        key: key.into(),
        title: format!("Citing document {key}"),
        date: "2005".into(),
        references,
        ..Default::default()
    }
}

fn widgets_record(key: Option<&str>) -> CandidateRecord {
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

fn seeded_library(citing_keys: &[&str]) -> MemoryLibrary {
    let library = MemoryLibrary::new(LIBRARY_URI);
    for key in citing_keys {
        library.insert(key, json!({"itemType": "journalArticle", "title": key}));
    }
    library
}

struct Env {
    config: Config,
    cache: MatchCache,
    client: reqwest::Client,
}

impl Env {
    fn new(config: Config) -> Self {
        Self {
            config,
            cache: MatchCache::in_memory(),
            client: reqwest::Client::new(),
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

fn cascade_of(matchers: Vec<Box<dyn ReferenceMatcher>>) -> MatchCascade {
    MatchCascade::new(matchers)
}

#[tokio::test]
async fn linked_reference_gets_relation_and_sink_entry() {
    let env = Env::new(Config::default());
    let library = seeded_library(&["CITING1"]);
    let cascade = cascade_of(vec![Box::new(MockMatcher::new(
        "local",
        MockResponse::Found(widgets_record(Some("ABC123"))),
    ))]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());
    let mut sink = MemorySink::default();
    let events = Mutex::new(Vec::new());
    let progress = |event: ProgressEvent| events.lock().unwrap().push(event);

    let docs = vec![citing("CITING1", vec![widgets_reference(), yearless_reference()])];
    let stats = pipeline
        .run(&docs, &mut sink, &progress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.documents, 1);
    assert_eq!(stats.references, 2);
    assert_eq!(stats.linked, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.skip_reasons.missing_year, 1);

    // Linked, not copied
    assert_eq!(library.len(), 1);
    let citing_item = library.item("CITING1").unwrap();
    assert_eq!(
        relation_uris(&citing_item.data, CitationRelation::PREDICATE),
        vec!["http://zotero.org/groups/1/items/ABC123"]
    );

    assert_eq!(sink.records.len(), 1);
    let (_, cited) = &sink.records[0];
    assert_eq!(cited.len(), 1);
    assert_eq!(cited[0].key, "ABC123");
    assert_eq!(cited[0].state, ResolutionState::Linked);

    let events = events.into_inner().unwrap();
    assert!(matches!(events.first(), Some(ProgressEvent::DocumentStarted { references: 2, .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::DocumentFinished { .. })));
}

#[tokio::test]
async fn recorded_documents_are_skipped() {
    let env = Env::new(Config::default());
    let library = seeded_library(&["A", "B"]);
    let mock = MockMatcher::new("local", MockResponse::Found(widgets_record(Some("ABC123"))));
    let cascade = cascade_of(vec![Box::new(mock)]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());

    let docs = vec![
        citing("A", vec![widgets_reference()]),
        citing("B", vec![widgets_reference()]),
    ];
    let mut sink = MemorySink::default();
    let first = pipeline
        .run(&docs, &mut sink, &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.documents, 2);

    let second = pipeline
        .run(&docs, &mut sink, &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.documents, 0);
    assert_eq!(second.documents_skipped, 2);
    assert_eq!(sink.records.len(), 2);
}

#[tokio::test]
async fn timeout_restarts_the_pass() {
    let env = Env::new(Config {
        pass_retries: 3,
        ..Config::default()
    });
    let library = seeded_library(&["A"]);
    let cascade = cascade_of(vec![Box::new(MockMatcher::with_sequence(
        "crossref",
        vec![MockResponse::Timeout, MockResponse::Found(widgets_record(None))],
    ))]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());
    let retries = Mutex::new(0);
    let progress = |event: ProgressEvent| {
        if let ProgressEvent::RetryPass { attempt, .. } = event {
            assert_eq!(attempt, 1);
            *retries.lock().unwrap() += 1;
        }
    };

    let mut sink = MemorySink::default();
    let docs = vec![citing("A", vec![widgets_reference()])];
    let stats = pipeline
        .run(&docs, &mut sink, &progress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*retries.lock().unwrap(), 1);
    assert_eq!(stats.created, 1);
    let created = &sink.records[0].1[0];
    assert_eq!(created.state, ResolutionState::Created);
    assert_eq!(
        library.collection_members("Cited Journals/Journal of Widgets"),
        vec![created.key.clone()]
    );
}

#[tokio::test]
async fn timeout_escalates_when_passes_run_out() {
    let env = Env::new(Config {
        pass_retries: 1,
        ..Config::default()
    });
    let library = seeded_library(&["A"]);
    let cascade = cascade_of(vec![Box::new(MockMatcher::new("crossref", MockResponse::Timeout))]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());

    let mut sink = MemorySink::default();
    let docs = vec![citing("A", vec![widgets_reference()])];
    let err = pipeline
        .run(&docs, &mut sink, &|_| {}, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(sink.records.is_empty());
}

#[tokio::test]
async fn malformed_response_falls_back_to_unidentified() {
    let env = Env::new(Config::default());
    let library = seeded_library(&["A"]);
    let cascade = cascade_of(vec![Box::new(MockMatcher::new(
        "crossref",
        MockResponse::Malformed("<html>oops</html>".into()),
    ))]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());

    let mut sink = MemorySink::default();
    let docs = vec![citing("A", vec![widgets_reference()])];
    let stats = pipeline
        .run(&docs, &mut sink, &|_| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.unidentified, 1);
    assert_eq!(library.collection_members("Cited Unidentified").len(), 1);
}

#[tokio::test]
async fn cancelled_run_processes_nothing() {
    let env = Env::new(Config::default());
    let library = seeded_library(&["A"]);
    let mock = MockMatcher::new("local", MockResponse::NotFound);
    let cascade = cascade_of(vec![Box::new(mock)]);
    let pipeline = Pipeline::new(&cascade, &library, env.ctx());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut sink = MemorySink::default();
    let docs = vec![citing("A", vec![widgets_reference()])];
    let stats = pipeline.run(&docs, &mut sink, &|_| {}, &cancel).await.unwrap();

    assert_eq!(stats.documents, 0);
    assert!(sink.records.is_empty());
    assert_eq!(library.len(), 1);
}
