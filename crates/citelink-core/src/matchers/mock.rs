//! Mock matcher for testing the cascade and the pipeline without network.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, prompt_for};
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::CandidateRecord;
use crate::rate_limit::MatchError;
use crate::segmentation::SegmentedReference;

/// A configurable mock response for [`MockMatcher`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this record as the match, unfiltered.
    Found(CandidateRecord),
    /// Run these through the shared filters and the matcher's ambiguity policy.
    Candidates(Vec<CandidateRecord>),
    NotFound,
    Timeout,
    RateLimited { retry_after: Option<Duration> },
    Malformed(String),
}

/// A hand-rolled mock implementing [`ReferenceMatcher`].
///
/// Returns a fixed response, or a sequence (one per call, repeating the
/// last), and counts calls.
pub struct MockMatcher {
    name: String,
    scope: MatcherScope,
    policy: AmbiguityPolicy,
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    call_count: AtomicUsize,
}

impl MockMatcher {
    pub fn new(name: impl Into<String>, response: MockResponse) -> Self {
        Self {
            name: name.into(),
            scope: MatcherScope::Always,
            policy: AmbiguityPolicy::First,
            responses: Mutex::new(Vec::new()),
            fallback: response,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Responses in order, the last one repeated once exhausted.
    pub fn with_sequence(name: impl Into<String>, mut responses: Vec<MockResponse>) -> Self {
        let fallback = responses.last().cloned().unwrap_or(MockResponse::NotFound);
        responses.reverse();
        let mut mock = Self::new(name, fallback);
        mock.responses = Mutex::new(responses);
        mock
    }

    pub fn with_scope(mut self, scope: MatcherScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How many times `find()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        let popped = self.responses.lock().ok().and_then(|mut seq| seq.pop());
        popped.unwrap_or_else(|| self.fallback.clone())
    }
}

impl ReferenceMatcher for MockMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> MatcherScope {
        self.scope
    }

    fn ambiguity_policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    fn find<'a>(
        &'a self,
        text: &'a str,
        key: &'a SegmentedReference,
        ctx: MatchContext<'a>,
    ) -> MatchFuture<'a> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let response = self.next_response();

        Box::pin(async move {
            match response {
                MockResponse::Found(record) => Ok(Some(record)),
                MockResponse::Candidates(candidates) => Ok(collapse(
                    filter_candidates(key, candidates),
                    self.policy,
                    ctx.disambiguator,
                    &prompt_for(&self.name, text),
                )),
                MockResponse::NotFound => Ok(None),
                MockResponse::Timeout => Err(MatchError::Timeout(format!("{} timed out", self.name))),
                MockResponse::RateLimited { retry_after } => {
                    Err(MatchError::RateLimited { retry_after })
                }
                MockResponse::Malformed(payload) => Err(MatchError::malformed(
                    format!("{} returned garbage", self.name),
                    payload,
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, MatchCache};

    fn key() -> SegmentedReference {
        SegmentedReference {
            last_names: vec!["smith".into()],
            year: 1998,
            title_words: vec!["widgets".into()],
            title: "On Widgets".into(),
        }
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let mock = MockMatcher::with_sequence(
            "seq",
            vec![MockResponse::Timeout, MockResponse::NotFound],
        );
        let config = Config::default();
        let cache = MatchCache::in_memory();
        let client = reqwest::Client::new();
        let ctx = MatchContext {
            client: &client,
            config: &config,
            cache: &cache,
            disambiguator: None,
        };

        assert!(mock.find("t", &key(), ctx).await.is_err());
        assert!(mock.find("t", &key(), ctx).await.unwrap().is_none());
        assert!(mock.find("t", &key(), ctx).await.unwrap().is_none());
        assert_eq!(mock.call_count(), 3);
    }
}
