//! Source matchers: one implementation of [`ReferenceMatcher`] per data source.

pub mod crossref;
pub mod dnb;
pub mod local_mirror;
pub mod mock;
pub mod open_library;
pub mod semantic_scholar;

use std::future::Future;
use std::pin::Pin;

use crate::cache::MatchCache;
use crate::disambiguate::Disambiguator;
use crate::matching::AmbiguityPolicy;
use crate::model::CandidateRecord;
use crate::rate_limit::{MatchError, check_response, with_retry};
use crate::segmentation::SegmentedReference;
use crate::Config;

/// Boxed future returned by [`ReferenceMatcher::find`].
pub type MatchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<CandidateRecord>, MatchError>> + Send + 'a>>;

/// Which references a matcher is consulted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherScope {
    Always,
    /// Only references that look like journal articles.
    JournalOnly,
    /// Only references that do not look like journal articles.
    NonJournalOnly,
}

impl MatcherScope {
    pub fn applies(&self, is_journal: bool) -> bool {
        match self {
            MatcherScope::Always => true,
            MatcherScope::JournalOnly => is_journal,
            MatcherScope::NonJournalOnly => !is_journal,
        }
    }
}

/// Shared resources handed to every matcher call.
#[derive(Clone, Copy)]
pub struct MatchContext<'a> {
    pub client: &'a reqwest::Client,
    pub config: &'a Config,
    pub cache: &'a MatchCache,
    /// `None` in non-interactive mode.
    pub disambiguator: Option<&'a dyn Disambiguator>,
}

/// A data source that can resolve a segmented reference to a record.
pub trait ReferenceMatcher: Send + Sync {
    /// Short name, also used in `disabled_matchers`.
    fn name(&self) -> &str;

    fn scope(&self) -> MatcherScope;

    /// Applied when several candidates survive and nobody can be asked.
    fn ambiguity_policy(&self) -> AmbiguityPolicy;

    /// Find the record `text` refers to.
    ///
    /// `Ok(None)` means not found (including declined ambiguity); errors are
    /// transport or protocol failures only.
    fn find<'a>(
        &'a self,
        text: &'a str,
        key: &'a SegmentedReference,
        ctx: MatchContext<'a>,
    ) -> MatchFuture<'a>;
}

/// Prompt shown when a matcher asks the disambiguator.
pub(crate) fn prompt_for(matcher: &str, text: &str) -> String {
    format!("[{}] Several records match:\n  {}", matcher, text.trim())
}

/// GET `url` with the service's limiter and retry policy, returning the body.
pub(crate) async fn fetch_text(
    ctx: MatchContext<'_>,
    service: &'static str,
    url: &str,
    headers: &[(&'static str, String)],
) -> Result<String, MatchError> {
    with_retry(
        service,
        &ctx.config.rate_limiters,
        ctx.config.retry_policy(),
        || get_text(ctx, service, url, headers),
    )
    .await
}

async fn get_text(
    ctx: MatchContext<'_>,
    service: &'static str,
    url: &str,
    headers: &[(&'static str, String)],
) -> Result<String, MatchError> {
    let mut req = ctx.client.get(url).timeout(ctx.config.timeout());
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    let resp = req.send().await?;
    check_response(service, &resp)?;
    Ok(resp.text().await?)
}
