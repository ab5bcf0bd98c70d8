use serde_json::Value;

use super::{AuthorityFuture, AuthorityHit, AuthoritySource};
use crate::cache::ns;
use crate::matchers::{MatchContext, fetch_text};
use crate::rate_limit::{MatchError, service};

const SIZE: usize = 10;

/// GND person records through the lobid.org search API.
pub struct LobidGnd;

impl AuthoritySource for LobidGnd {
    fn name(&self) -> &str {
        ns::GND
    }

    fn search<'a>(&'a self, name: &'a str, ctx: MatchContext<'a>) -> AuthorityFuture<'a> {
        Box::pin(async move {
            let url = format!(
                "{}/search?q={}&filter=type:Person&format=json&size={}",
                ctx.config.lobid_url.trim_end_matches('/'),
                urlencoding::encode(name),
                SIZE
            );
            let body = fetch_text(ctx, service::GND, &url, &[]).await?;
            parse_search(&body)
        })
    }
}

/// Parse a lobid-gnd search response (`member` array).
pub fn parse_search(body: &str) -> Result<Vec<AuthorityHit>, MatchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("lobid response: {}", e), body))?;
    let Some(members) = data["member"].as_array() else {
        return Err(MatchError::malformed("lobid response has no member list", body));
    };

    Ok(members
        .iter()
        .filter_map(|m| {
            let id = m["gndIdentifier"].as_str()?;
            let preferred = m["preferredName"].as_str()?;
            let variants = m["variantName"]
                .as_array()
                .map(|vs| vs.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            Some(AuthorityHit {
                id: id.to_string(),
                preferred_name: preferred.to_string(),
                variants,
            })
        })
        .collect())
}
