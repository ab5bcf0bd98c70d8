//! Identifier → full record via the translation server.
//!
//! `POST {base}/search` with a DOI or ISBN as `text/plain` returns an array
//! of records in item JSON; the first element is used. Results are cached
//! under the identifier's namespaced key.

use crate::matchers::MatchContext;
use crate::model::{CandidateRecord, Identifier};
use crate::rate_limit::{MatchError, check_response, service, with_retry};

/// Fields the translation server adds that do not belong on a new item.
const DROPPED_FIELDS: &[&str] = &["attachments", "notes", "seeAlso", "libraryCatalog"];

/// Resolve an identifier to a record. `Ok(None)` when the server knows no
/// translator for it or returns nothing.
pub async fn translate(
    ctx: MatchContext<'_>,
    id: &Identifier,
) -> Result<Option<CandidateRecord>, MatchError> {
    let cache_key = id.cache_key();
    if let Some(record) = ctx.cache.get::<CandidateRecord>(&cache_key) {
        tracing::debug!(id = id.value(), "translation cache hit");
        return Ok(Some(record));
    }

    let url = format!("{}/search", ctx.config.translation_url.trim_end_matches('/'));
    let body = with_retry(
        service::TRANSLATION,
        &ctx.config.rate_limiters,
        ctx.config.retry_policy(),
        || post_search(ctx, &url, id),
    )
    .await?;

    let Some(body) = body else {
        tracing::debug!(id = id.value(), "translation server has no record");
        return Ok(None);
    };

    let Some(record) = parse_translation_response(&body)? else {
        return Ok(None);
    };

    if let Err(e) = ctx.cache.put(&cache_key, &record) {
        tracing::warn!(error = %e, "failed to cache translation result");
    }
    Ok(Some(record))
}

/// Replace a catalog or search-index record with the translated full record
/// for its identifier.
///
/// Falls back to `record` itself when it has no identifier, the server has
/// nothing, or the translation fails for a non-transient reason. Transient
/// failures propagate.
pub async fn complete_record(
    ctx: MatchContext<'_>,
    record: CandidateRecord,
) -> Result<CandidateRecord, MatchError> {
    let Some(id) = record.identifier() else {
        return Ok(record);
    };
    match translate(ctx, &id).await {
        Ok(Some(mut full)) => {
            match &id {
                Identifier::Doi(doi) if full.doi().is_none() => full.doi = Some(doi.clone()),
                Identifier::Isbn(isbn) if full.isbn().is_none() => full.isbn = Some(isbn.clone()),
                _ => {}
            }
            Ok(full)
        }
        Ok(None) => Ok(record),
        Err(e) if e.is_transient() => Err(e),
        Err(e) => {
            tracing::warn!(id = id.value(), error = %e, "translation failed, using source record");
            Ok(record)
        }
    }
}

async fn post_search(
    ctx: MatchContext<'_>,
    url: &str,
    id: &Identifier,
) -> Result<Option<String>, MatchError> {
    let resp = ctx
        .client
        .post(url)
        .header("Content-Type", "text/plain")
        .body(id.value().to_string())
        .timeout(ctx.config.timeout())
        .send()
        .await?;

    // 300 (multiple choices), 404 and 501 (no translator) mean "nothing usable"
    if matches!(resp.status().as_u16(), 300 | 404 | 501) {
        return Ok(None);
    }
    check_response(service::TRANSLATION, &resp)?;
    Ok(Some(resp.text().await?))
}

/// Decode the first record of a translation server response.
///
/// The server assigns its own `key`/`version`; both are cleared so the
/// record is never mistaken for an existing library item.
pub fn parse_translation_response(body: &str) -> Result<Option<CandidateRecord>, MatchError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| MatchError::malformed(format!("translation response: {}", e), body))?;

    let first = match &value {
        serde_json::Value::Array(items) => items.first().cloned(),
        serde_json::Value::Object(_) => Some(value.clone()),
        _ => return Err(MatchError::malformed("translation response is not an array", body)),
    };
    let Some(mut first) = first else {
        return Ok(None);
    };

    if let Some(obj) = first.as_object_mut() {
        obj.remove("key");
        obj.remove("version");
        for field in DROPPED_FIELDS {
            obj.remove(*field);
        }
    }

    serde_json::from_value(first)
        .map(Some)
        .map_err(|e| MatchError::malformed(format!("translation record: {}", e), body))
}
