//! Full runs from citing document to export file, over an in-process
//! library and mock matchers.

use std::sync::{Arc, Mutex};

use citelink_core::library::MemoryLibrary;
use citelink_core::matchers::crossref::Crossref;
use citelink_core::matchers::local_mirror::LocalMirror;
use citelink_core::matchers::mock::{MockMatcher, MockResponse};
use citelink_core::model::{Creator, RawPerson, RawSegmentation, ReferenceInput, Scored};
use citelink_core::pipeline::Pipeline;
use citelink_core::{
    CandidateRecord, CitingDocument, Config, ItemType, MatchCache, MatchCascade, MatchContext,
    ReferenceMatcher, RunStats,
};
use citelink_export::{ExportWriter, HEADER};
use citelink_mirror::MirrorIndex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn smith_reference() -> ReferenceInput {
    ReferenceInput {
        text: "Smith (1998). On Widgets. Journal of Widgets 12, 45-60.".into(),
        segmentation: RawSegmentation {
            author: vec![vec![RawPerson::new("Smith", "")]],
            title: vec![Scored::new("On Widgets", 0.4)],
            year: vec![Scored::new("1998", 0.1)],
            source: vec![Scored::new("Journal of Widgets", 0.2)],
            volume: vec![Scored::new("12", 0.1)],
            fpage: vec![Scored::new("45", 0.1)],
            lpage: vec![Scored::new("60", 0.1)],
            ..Default::default()
        },
    }
}

fn citing_doc() -> CitingDocument {
    CitingDocument {
        key: "CITING1".into(),
        doi: Some("10.1/x".into()),
        title: "Widgets Revisited".into(),
        creators: vec![Creator::person("Doe", "Jane")],
        date: "2012".into(),
        publication_title: Some("Widget Review".into()),
        references: vec![smith_reference()],
        ..Default::default()
    }
}

fn widgets(key: &str, container: &str) -> CandidateRecord {
    CandidateRecord {
        item_type: ItemType::JournalArticle,
        title: "On Widgets".into(),
        date: "1998".into(),
        creators: vec![Creator::person("Smith", "John")],
        publication_title: Some(container.into()),
        key: Some(key.into()),
        ..Default::default()
    }
}

fn library() -> MemoryLibrary {
    let library = MemoryLibrary::new("http://zotero.org/groups/1");
    library.insert("CITING1", json!({"itemType": "journalArticle", "title": "Widgets Revisited"}));
    library
}

async fn run_once(
    matchers: Vec<Box<dyn ReferenceMatcher>>,
    library: &MemoryLibrary,
    export: &std::path::Path,
) -> RunStats {
    let config = Config::default();
    let cache = MatchCache::in_memory();
    let client = reqwest::Client::new();
    let ctx = MatchContext {
        client: &client,
        config: &config,
        cache: &cache,
        disambiguator: None,
    };
    let cascade = MatchCascade::new(matchers);
    let pipeline = Pipeline::new(&cascade, library, ctx);
    let mut writer = ExportWriter::open(export).unwrap();
    pipeline
        .run(&[citing_doc()], &mut writer, &|_| {}, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn unidentified_journal_article_is_stubbed_and_exported() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.txt");
    let library = library();

    let stats = run_once(
        vec![Box::new(MockMatcher::new("crossref", MockResponse::NotFound))],
        &library,
        &export,
    )
    .await;
    assert_eq!(stats.unidentified, 1);

    let stubs = library.collection_members("Cited Unidentified");
    assert_eq!(stubs.len(), 1);
    let stub = library.item(&stubs[0]).unwrap();
    assert_eq!(stub.data["itemType"], "journalArticle");
    assert_eq!(stub.data["tags"][0]["tag"], "unidentified");

    let content = std::fs::read_to_string(&export).unwrap();
    assert!(content.starts_with(HEADER));
    assert!(content.contains("\nCR Smith, 1998, Journal of Widgets, V12, P45\n"));
    assert!(content.contains("\nDI 10.1/x\n"));
    assert!(content.contains("\nUT CITING1\n"));
    assert!(content.contains("\nNR 1\n"));
}

#[tokio::test]
async fn local_hit_with_key_is_linked_without_creation() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.txt");
    let library = library();

    let stats = run_once(
        vec![Box::new(MockMatcher::new(
            "local",
            MockResponse::Found(widgets("ABC123", "Journal of Widgets")),
        ))],
        &library,
        &export,
    )
    .await;

    assert_eq!(stats.linked, 1);
    assert_eq!(stats.created + stats.unidentified, 0);
    assert_eq!(library.len(), 1);
    let citing = library.item("CITING1").unwrap();
    assert_eq!(
        citing.data["relations"]["cito:cites"],
        "http://zotero.org/groups/1/items/ABC123"
    );
    let content = std::fs::read_to_string(&export).unwrap();
    assert!(content.contains("\nCR Smith J, 1998, Journal of Widgets\n"));
}

#[tokio::test]
async fn ambiguous_candidates_follow_each_matchers_policy() {
    let candidates = vec![
        widgets("K1", "Journal of Widgets"),
        widgets("K2", "Widget Letters"),
        widgets("K3", "Annals of Widgetry"),
    ];

    let local = LocalMirror {
        db: Arc::new(Mutex::new(MirrorIndex::open_in_memory().unwrap())),
    };

    // DOI index rejects ties when nobody can be asked.
    let dir = tempfile::tempdir().unwrap();
    let library_a = library();
    let stats = run_once(
        vec![Box::new(
            MockMatcher::new("crossref", MockResponse::Candidates(candidates.clone()))
                .with_policy(Crossref.ambiguity_policy()),
        )],
        &library_a,
        &dir.path().join("a.txt"),
    )
    .await;
    assert_eq!(stats.linked, 0);
    assert_eq!(stats.unidentified, 1);

    // Local mirror takes the first one.
    let library_b = library();
    let stats = run_once(
        vec![Box::new(
            MockMatcher::new("local", MockResponse::Candidates(candidates))
                .with_policy(local.ambiguity_policy()),
        )],
        &library_b,
        &dir.path().join("b.txt"),
    )
    .await;
    assert_eq!(stats.linked, 1);
    let citing = library_b.item("CITING1").unwrap();
    assert_eq!(
        citing.data["relations"]["cito:cites"],
        "http://zotero.org/groups/1/items/K1"
    );
}

#[tokio::test]
async fn rerun_over_same_doi_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.txt");
    let library = library();

    let first = run_once(
        vec![Box::new(MockMatcher::new("crossref", MockResponse::NotFound))],
        &library,
        &export,
    )
    .await;
    assert_eq!(first.documents, 1);
    let after_first = std::fs::read_to_string(&export).unwrap();
    let items_after_first = library.len();

    let second = run_once(
        vec![Box::new(MockMatcher::new("crossref", MockResponse::NotFound))],
        &library,
        &export,
    )
    .await;
    assert_eq!(second.documents, 0);
    assert_eq!(second.documents_skipped, 1);
    assert_eq!(std::fs::read_to_string(&export).unwrap(), after_first);
    assert_eq!(library.len(), items_after_first);
}
