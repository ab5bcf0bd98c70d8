use serde_json::Value;

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, fetch_text, prompt_for};
use crate::authors::parse_name;
use crate::matcher_names;
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::{CandidateRecord, Creator, ItemType};
use crate::rate_limit::{MatchError, service};
use crate::segmentation::SegmentedReference;
use crate::translation::complete_record;

const LIMIT: usize = 10;
const FIELDS: &str =
    "key,title,subtitle,author_name,first_publish_year,publish_year,isbn,publisher,publish_place";

/// Open Library catalog search (`search.json`).
pub struct OpenLibrary;

impl ReferenceMatcher for OpenLibrary {
    fn name(&self) -> &str {
        matcher_names::OPEN_LIBRARY
    }

    fn scope(&self) -> MatcherScope {
        MatcherScope::NonJournalOnly
    }

    fn ambiguity_policy(&self) -> AmbiguityPolicy {
        AmbiguityPolicy::First
    }

    fn find<'a>(
        &'a self,
        text: &'a str,
        key: &'a SegmentedReference,
        ctx: MatchContext<'a>,
    ) -> MatchFuture<'a> {
        Box::pin(async move {
            let url = search_url(&ctx.config.open_library_url, key);
            let body = fetch_text(ctx, service::OPEN_LIBRARY, &url, &[]).await?;
            let candidates = filter_candidates(key, parse_search(&body, Some(key.year))?);

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
        "{}/search.json?author={}&title={}&fields={}&limit={}",
        base.trim_end_matches('/'),
        urlencoding::encode(key.last_names.first().map(String::as_str).unwrap_or("")),
        urlencoding::encode(&key.title),
        FIELDS,
        LIMIT
    )
}

fn strings(value: &Value) -> Vec<&str> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Parse a `search.json` response.
///
/// A work lists every edition's year in `publish_year`; when `year` is one
/// of them the candidate is dated to it, otherwise to `first_publish_year`.
pub fn parse_search(body: &str, year: Option<i32>) -> Result<Vec<CandidateRecord>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("open library response: {}", e), body))?;
    let Some(docs) = data["docs"].as_array() else {
        return Err(MatchError::malformed("open library response has no docs", body));
    };

    Ok(docs
        .iter()
        .filter_map(|doc| {
            let title = doc["title"].as_str()?;
            let title = match doc["subtitle"].as_str() {
                Some(sub) => format!("{}: {}", title, sub),
                None => title.to_string(),
            };

            let edition_years: Vec<i64> = doc["publish_year"]
                .as_array()
                .map(|ys| ys.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            let date = match year {
                Some(y) if edition_years.contains(&(y as i64)) => y.to_string(),
                _ => doc["first_publish_year"]
                    .as_i64()
                    .map(|y| y.to_string())
                    .unwrap_or_default(),
            };

            let creators = strings(&doc["author_name"])
                .into_iter()
                .map(|name| {
                    let parsed = parse_name(name);
                    if parsed.given.is_empty() {
                        Creator::single(parsed.surname)
                    } else {
                        Creator::person(parsed.surname, parsed.given)
                    }
                })
                .collect();

            Some(CandidateRecord {
                item_type: ItemType::Book,
                title,
                creators,
                date,
                publisher: strings(&doc["publisher"]).first().map(|s| s.to_string()),
                place: strings(&doc["publish_place"]).first().map(|s| s.to_string()),
                isbn: strings(&doc["isbn"]).first().map(|s| s.to_string()),
                ..Default::default()
            })
        })
        .collect())
}
