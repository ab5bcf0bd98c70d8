use serde_json::Value;

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, fetch_text, prompt_for};
use crate::matcher_names;
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::{CandidateRecord, Creator, Identifier, ItemType};
use crate::rate_limit::{MatchError, service};
use crate::segmentation::SegmentedReference;
use crate::translation::{complete_record, translate};

const ROWS: usize = 5;

/// DOI index matcher: bibliographic search on Crossref for a DOI, then the
/// translation server for the full record.
pub struct Crossref;

impl ReferenceMatcher for Crossref {
    fn name(&self) -> &str {
        matcher_names::CROSSREF
    }

    fn scope(&self) -> MatcherScope {
        MatcherScope::JournalOnly
    }

    fn ambiguity_policy(&self) -> AmbiguityPolicy {
        AmbiguityPolicy::Reject
    }

    fn find<'a>(
        &'a self,
        text: &'a str,
        key: &'a SegmentedReference,
        ctx: MatchContext<'a>,
    ) -> MatchFuture<'a> {
        Box::pin(async move {
            let url = search_url(&ctx.config.crossref_url, key, ctx.config.crossref_mailto.as_deref());
            let body = fetch_text(ctx, service::CROSSREF, &url, &headers(ctx)).await?;
            let candidates = filter_candidates(key, parse_works(&body)?);
            tracing::debug!(candidates = candidates.len(), "crossref candidates after filtering");

            let Some(chosen) = collapse(
                candidates,
                self.ambiguity_policy(),
                ctx.disambiguator,
                &prompt_for(self.name(), text),
            ) else {
                return Ok(None);
            };
            complete_record(ctx, chosen).await.map(Some)
        })
    }
}

/// Look up a single DOI: the translation server first, Crossref's own
/// metadata as fallback.
pub async fn lookup_doi(
    ctx: MatchContext<'_>,
    doi: &str,
) -> Result<Option<CandidateRecord>, MatchError> {
    let doi = doi.trim();
    let id = Identifier::Doi(doi.to_string());
    match translate(ctx, &id).await {
        Ok(Some(record)) => return Ok(Some(record)),
        Ok(None) => {}
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => tracing::warn!(doi, error = %e, "translation failed, asking crossref"),
    }

    let url = format!(
        "{}/works/{}",
        ctx.config.crossref_url.trim_end_matches('/'),
        urlencoding::encode(doi)
    );
    match fetch_text(ctx, service::CROSSREF, &url, &headers(ctx)).await {
        Ok(body) => parse_work(&body),
        Err(MatchError::Http { status: 404, .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn headers(ctx: MatchContext<'_>) -> Vec<(&'static str, String)> {
    let agent = match &ctx.config.crossref_mailto {
        Some(email) => format!("citelink/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email),
        None => format!("citelink/{}", env!("CARGO_PKG_VERSION")),
    };
    vec![("User-Agent", agent)]
}

/// Build the `/works` search URL for a segmented reference.
pub fn search_url(base: &str, key: &SegmentedReference, mailto: Option<&str>) -> String {
    let mut url = format!(
        "{}/works?query.bibliographic={}&query.author={}&filter=from-pub-date:{y},until-pub-date:{y}&rows={}",
        base.trim_end_matches('/'),
        urlencoding::encode(&key.title),
        urlencoding::encode(&key.last_names.join(" ")),
        ROWS,
        y = key.year,
    );
    if let Some(email) = mailto {
        url.push_str(&format!("&mailto={}", urlencoding::encode(email)));
    }
    url
}

/// Parse a `/works` search response into candidates, in result order.
pub fn parse_works(body: &str) -> Result<Vec<CandidateRecord>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("crossref response: {}", e), body))?;
    let Some(items) = data["message"]["items"].as_array() else {
        return Err(MatchError::malformed("crossref response has no message.items", body));
    };
    Ok(items.iter().filter_map(work_to_candidate).collect())
}

/// Parse a single-work response (`/works/{doi}`).
pub fn parse_work(body: &str) -> Result<Option<CandidateRecord>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("crossref response: {}", e), body))?;
    Ok(work_to_candidate(&data["message"]))
}

fn first_str(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn issued_year(item: &Value) -> Option<i64> {
    ["issued", "published-print", "published-online", "created"]
        .iter()
        .find_map(|field| item[*field]["date-parts"][0][0].as_i64())
}

fn work_to_candidate(item: &Value) -> Option<CandidateRecord> {
    let title = first_str(&item["title"])?;

    let creators = item["author"]
        .as_array()
        .map(|authors| {
            authors
                .iter()
                .filter_map(|a| match (a["family"].as_str(), a["name"].as_str()) {
                    (Some(family), _) => {
                        Some(Creator::person(family, a["given"].as_str().unwrap_or("")))
                    }
                    (None, Some(name)) => Some(Creator::single(name)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let item_type = match item["type"].as_str() {
        Some("journal-article") | None => ItemType::JournalArticle,
        Some("book") | Some("monograph") | Some("edited-book") => ItemType::Book,
        Some("book-chapter") | Some("book-section") => ItemType::BookSection,
        Some(_) => ItemType::Other,
    };
    let container = first_str(&item["container-title"]);

    let mut record = CandidateRecord {
        item_type,
        creators,
        title,
        date: issued_year(item).map(|y| y.to_string()).unwrap_or_default(),
        volume: item["volume"].as_str().map(str::to_string),
        issue: item["issue"].as_str().map(str::to_string),
        pages: item["page"].as_str().map(str::to_string),
        publisher: item["publisher"].as_str().map(str::to_string),
        doi: item["DOI"].as_str().map(str::to_string),
        ..Default::default()
    };
    if item_type == ItemType::BookSection {
        record.book_title = container;
    } else {
        record.publication_title = container;
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"{
      "status": "ok",
      "message": {
        "items": [
          {
            "DOI": "10.1/w",
            "type": "journal-article",
            "title": ["On Widgets"],
            "author": [{"family": "Smith", "given": "John"}, {"name": "Widget Council"}],
            "issued": {"date-parts": [[1998, 3]]},
            "container-title": ["Journal of Widgets"],
            "volume": "12",
            "page": "45-60"
          },
          {
            "DOI": "10.1/chapter",
            "type": "book-chapter",
            "title": ["Widgets in Context"],
            "published-print": {"date-parts": [[2001]]},
            "container-title": ["The Widget Handbook"]
          },
          {"DOI": "10.1/untitled"}
        ]
      }
    }"#;

    fn key() -> SegmentedReference {
        SegmentedReference {
            last_names: vec!["smith".into(), "jones".into()],
            year: 1998,
            title_words: vec!["widgets".into()],
            title: "On Widgets".into(),
        }
    }

    #[test]
    fn test_search_url() {
        let url = search_url("https://api.crossref.org/", &key(), Some("me@example.org"));
        assert_eq!(
            url,
            "https://api.crossref.org/works?query.bibliographic=On%20Widgets\
             &query.author=smith%20jones&filter=from-pub-date:1998,until-pub-date:1998\
             &rows=5&mailto=me%40example.org"
        );
    }

    #[test]
    fn test_parse_works() {
        let records = parse_works(SEARCH).unwrap();
        assert_eq!(records.len(), 2);

        let article = &records[0];
        assert_eq!(article.item_type, ItemType::JournalArticle);
        assert_eq!(article.year(), Some(1998));
        assert_eq!(article.doi(), Some("10.1/w"));
        assert_eq!(article.container(), Some("Journal of Widgets"));
        assert_eq!(article.creators[1], Creator::single("Widget Council"));

        let chapter = &records[1];
        assert_eq!(chapter.item_type, ItemType::BookSection);
        assert_eq!(chapter.book_title.as_deref(), Some("The Widget Handbook"));
        assert_eq!(chapter.year(), Some(2001));
    }

    #[test]
    fn test_parse_works_filters_to_reference() {
        let records = filter_candidates(&key(), parse_works(SEARCH).unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].doi(), Some("10.1/w"));
    }

    #[test]
    fn test_parse_works_malformed() {
        assert!(matches!(
            parse_works(r#"{"status": "error"}"#),
            Err(MatchError::Malformed { .. })
        ));
        assert!(matches!(
            parse_works("Resource not found."),
            Err(MatchError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_single_work() {
        let body = r#"{"message": {"DOI": "10.1/x", "title": ["X"], "issued": {"date-parts": [[2010]]}}}"#;
        let record = parse_work(body).unwrap().unwrap();
        assert_eq!(record.doi(), Some("10.1/x"));
        assert_eq!(record.date, "2010");
    }
}
