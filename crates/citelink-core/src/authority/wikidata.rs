use serde_json::Value;

use super::{AuthorityFuture, AuthorityHit, AuthoritySource};
use crate::cache::ns;
use crate::matchers::{MatchContext, fetch_text};
use crate::rate_limit::{MatchError, service};

const LIMIT: usize = 10;
/// Wikidata item for "human".
const HUMAN: &str = "Q5";

/// Wikidata person items: `wbsearchentities` for candidates, then
/// `wbgetentities` for aliases and the instance-of check.
pub struct Wikidata;

impl AuthoritySource for Wikidata {
    fn name(&self) -> &str {
        ns::WIKIDATA
    }

    fn search<'a>(&'a self, name: &'a str, ctx: MatchContext<'a>) -> AuthorityFuture<'a> {
        Box::pin(async move {
            let base = ctx.config.wikidata_url.as_str();
            let search_url = format!(
                "{}?action=wbsearchentities&search={}&language=en&type=item&format=json&limit={}",
                base,
                urlencoding::encode(name),
                LIMIT
            );
            let body = fetch_text(ctx, service::WIKIDATA, &search_url, &[]).await?;
            let ids = parse_search(&body)?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let entities_url = format!(
                "{}?action=wbgetentities&ids={}&props=labels%7Caliases%7Cclaims&languages=en&format=json",
                base,
                urlencoding::encode(&ids.join("|"))
            );
            let body = fetch_text(ctx, service::WIKIDATA, &entities_url, &[]).await?;
            parse_entities(&body, &ids)
        })
    }
}

/// Entity ids from a `wbsearchentities` response, in rank order.
pub fn parse_search(body: &str) -> Result<Vec<String>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("wikidata search: {}", e), body))?;
    let Some(results) = data["search"].as_array() else {
        return Err(MatchError::malformed("wikidata search has no results list", body));
    };
    Ok(results
        .iter()
        .filter_map(|r| r["id"].as_str().map(str::to_string))
        .collect())
}

fn is_human(entity: &Value) -> bool {
    entity["claims"]["P31"].as_array().is_some_and(|claims| {
        claims
            .iter()
            .any(|c| c["mainsnak"]["datavalue"]["value"]["id"].as_str() == Some(HUMAN))
    })
}

/// Person hits from a `wbgetentities` response, ordered like `ids`.
/// Entities that are not instances of "human" are dropped.
pub fn parse_entities(body: &str, ids: &[String]) -> Result<Vec<AuthorityHit>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("wikidata entities: {}", e), body))?;
    let entities = &data["entities"];
    if !entities.is_object() {
        return Err(MatchError::malformed("wikidata response has no entities", body));
    }

    Ok(ids
        .iter()
        .filter_map(|id| {
            let entity = &entities[id.as_str()];
            if !is_human(entity) {
                return None;
            }
            let label = entity["labels"]["en"]["value"].as_str()?;
            let variants = entity["aliases"]["en"]
                .as_array()
                .map(|aliases| {
                    aliases
                        .iter()
                        .filter_map(|a| a["value"].as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(AuthorityHit {
                id: id.clone(),
                preferred_name: label.to_string(),
                variants,
            })
        })
        .collect())
}
