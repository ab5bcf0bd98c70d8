use serde_json::Value;

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, fetch_text, prompt_for};
use crate::authors::parse_name;
use crate::matcher_names;
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::{CandidateRecord, Creator, ItemType};
use crate::rate_limit::{MatchError, service};
use crate::segmentation::SegmentedReference;
use crate::translation::complete_record;

const FIELDS: &str = "title,authors,year,venue,journal,externalIds,publicationTypes";
const LIMIT: usize = 10;

/// Semantic Scholar paper search. Best effort: results can be incomplete,
/// and the shared limiter keeps us at one request per second without a key.
pub struct SemanticScholar;

impl ReferenceMatcher for SemanticScholar {
    fn name(&self) -> &str {
        matcher_names::SEMANTIC_SCHOLAR
    }

    fn scope(&self) -> MatcherScope {
        MatcherScope::Always
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
            let url = search_url(&ctx.config.semantic_scholar_url, key);
            let mut headers = Vec::new();
            if let Some(api_key) = &ctx.config.s2_api_key {
                headers.push(("x-api-key", api_key.clone()));
            }
            let body = fetch_text(ctx, service::SEMANTIC_SCHOLAR, &url, &headers).await?;
            let candidates = filter_candidates(key, parse_search(&body)?);

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

pub fn search_url(base: &str, key: &SegmentedReference) -> String {
    format!(
        "{}/paper/search?query={}&year={}&fields={}&limit={}",
        base.trim_end_matches('/'),
        urlencoding::encode(&key.title),
        key.year,
        FIELDS,
        LIMIT
    )
}

/// Parse a `paper/search` response. A response without `data` but with a
/// `total` is an empty result.
pub fn parse_search(body: &str) -> Result<Vec<CandidateRecord>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("semantic scholar response: {}", e), body))?;
    let papers = match data["data"].as_array() {
        Some(papers) => papers,
        None if data.get("total").is_some() => return Ok(Vec::new()),
        None => {
            return Err(MatchError::malformed(
                "semantic scholar response has no data",
                body,
            ));
        }
    };
    Ok(papers.iter().filter_map(paper_to_candidate).collect())
}

fn paper_to_candidate(paper: &Value) -> Option<CandidateRecord> {
    let title = paper["title"].as_str()?.to_string();

    let creators = paper["authors"]
        .as_array()
        .map(|authors| {
            authors
                .iter()
                .filter_map(|a| a["name"].as_str())
                .map(|name| {
                    let parsed = parse_name(name);
                    Creator::person(parsed.surname, parsed.given)
                })
                .collect()
        })
        .unwrap_or_default();

    let is_journal = paper["publicationTypes"]
        .as_array()
        .is_some_and(|types| types.iter().any(|t| t == "JournalArticle"));
    let journal = &paper["journal"];
    let venue = journal["name"]
        .as_str()
        .or_else(|| paper["venue"].as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    Some(CandidateRecord {
        item_type: if is_journal || venue.is_some() {
            ItemType::JournalArticle
        } else {
            ItemType::Other
        },
        title,
        creators,
        date: paper["year"].as_i64().map(|y| y.to_string()).unwrap_or_default(),
        publication_title: venue,
        volume: journal["volume"].as_str().map(|v| v.trim().to_string()),
        pages: journal["pages"].as_str().map(|p| p.trim().to_string()),
        doi: paper["externalIds"]["DOI"].as_str().map(str::to_string),
        ..Default::default()
    })
}
