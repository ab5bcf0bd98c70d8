use std::sync::{Arc, Mutex};

use citelink_mirror::{MirrorIndex, MirrorQuery, MirrorRow, build_match_expression};

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, prompt_for};
use crate::matcher_names;
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::CandidateRecord;
use crate::rate_limit::MatchError;
use crate::segmentation::SegmentedReference;

/// Matcher backed by the local SQLite mirror of the library's own records.
///
/// Hits in the primary library keep their key (link); hits in a secondary
/// library come back without one (copy).
pub struct LocalMirror {
    pub db: Arc<Mutex<MirrorIndex>>,
}

/// Turn a mirror row into a candidate, keeping the key only for the primary library.
pub fn row_to_candidate(row: MirrorRow, primary_library: &str) -> Option<CandidateRecord> {
    let mut record: CandidateRecord = match serde_json::from_value(row.data) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(key = %row.key, library = %row.library_id, error = %e, "skipping undecodable mirror row");
            return None;
        }
    };
    if row.library_id == primary_library {
        record.key = Some(row.key);
        record.version = Some(row.version);
    } else {
        record.key = None;
        record.version = None;
        // Collection membership and relations belong to the source library
        record.extra.remove("collections");
        record.extra.remove("relations");
    }
    Some(record)
}

impl ReferenceMatcher for LocalMirror {
    fn name(&self) -> &str {
        matcher_names::LOCAL_MIRROR
    }

    fn scope(&self) -> MatcherScope {
        MatcherScope::Always
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
        let db = Arc::clone(&self.db);
        Box::pin(async move {
            let Some(expression) = build_match_expression(&key.title_words, &key.last_names)
            else {
                return Ok(None);
            };
            let query = MirrorQuery::new(expression)
                .year(key.year as i64)
                .libraries(ctx.config.mirror_library_ids());

            let rows = tokio::task::spawn_blocking(move || {
                let db = db
                    .lock()
                    .map_err(|e| MatchError::Other(format!("mirror lock poisoned: {}", e)))?;
                db.query(&query)
                    .map_err(|e| MatchError::Other(format!("mirror query failed: {}", e)))
            })
            .await
            .map_err(|e| MatchError::Other(format!("mirror task failed: {}", e)))??;

            let primary = ctx.config.library_id.as_str();
            let candidates: Vec<CandidateRecord> = rows
                .into_iter()
                .filter_map(|row| row_to_candidate(row, primary))
                .collect();
            let candidates = filter_candidates(key, candidates);

            Ok(collapse(
                candidates,
                self.ambiguity_policy(),
                ctx.disambiguator,
                &prompt_for(self.name(), text),
            ))
        })
    }
}
