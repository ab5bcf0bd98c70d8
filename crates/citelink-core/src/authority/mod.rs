//! Author-name variants → authority records (GND, Wikidata).

mod gnd;
mod wikidata;

pub use gnd::LobidGnd;
pub use wikidata::Wikidata;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::authors::{fold, names_compatible, parse_name};
use crate::matchers::MatchContext;
use crate::rate_limit::MatchError;

/// A person record returned by an authority search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityHit {
    pub id: String,
    pub preferred_name: String,
    #[serde(default)]
    pub variants: Vec<String>,
}

/// The accepted authority record for a name variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityMatch {
    /// `gnd` or `wikidata`.
    pub authority: String,
    pub id: String,
    pub preferred_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameEntry {
    pub variant: String,
    pub resolved: Option<AuthorityMatch>,
}

/// Variants in input order, each with its authority record if one was found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameResolution {
    pub entries: Vec<NameEntry>,
}

impl NameResolution {
    pub fn get(&self, variant: &str) -> Option<&AuthorityMatch> {
        self.entries
            .iter()
            .find(|e| e.variant == variant)
            .and_then(|e| e.resolved.as_ref())
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.iter().filter(|e| e.resolved.is_some()).count()
    }
}

pub type AuthorityFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<AuthorityHit>, MatchError>> + Send + 'a>>;

/// A searchable person authority file.
pub trait AuthoritySource: Send + Sync {
    /// Short name, also the cache namespace.
    fn name(&self) -> &str;

    fn search<'a>(&'a self, name: &'a str, ctx: MatchContext<'a>) -> AuthorityFuture<'a>;
}

/// Whether `hit` can be the person behind `variant`.
pub fn hit_compatible(variant: &str, hit: &AuthorityHit) -> bool {
    std::iter::once(&hit.preferred_name)
        .chain(hit.variants.iter())
        .any(|name| names_compatible(variant, name))
}

/// Similarity of the variant to a hit's preferred name, for ranking.
fn similarity(variant: &str, hit: &AuthorityHit) -> f64 {
    let a = fold(&parse_name(variant).inverted());
    let b = fold(&parse_name(&hit.preferred_name).inverted());
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// Best compatible hit, by similarity to the preferred name; ties keep
/// the source's order.
pub fn best_hit<'h>(variant: &str, hits: &'h [AuthorityHit]) -> Option<&'h AuthorityHit> {
    let mut best: Option<(&AuthorityHit, f64)> = None;
    for hit in hits.iter().filter(|h| hit_compatible(variant, h)) {
        let score = similarity(variant, hit);
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((hit, score));
        }
    }
    best.map(|(hit, _)| hit)
}

/// Resolves name variants against authority sources, in order.
pub struct NameResolver {
    sources: Vec<Box<dyn AuthoritySource>>,
}

impl NameResolver {
    pub fn new(sources: Vec<Box<dyn AuthoritySource>>) -> Self {
        Self { sources }
    }

    /// GND first, then Wikidata.
    pub fn standard() -> Self {
        Self::new(vec![Box::new(LobidGnd), Box::new(Wikidata)])
    }

    /// Query string for a variant: "Given Surname" reads best in both sources.
    fn query_for(variant: &str) -> String {
        let parsed = parse_name(variant);
        if parsed.given.is_empty() {
            parsed.surname
        } else {
            format!("{} {}", parsed.given, parsed.surname)
        }
    }

    async fn search_cached(
        &self,
        source: &dyn AuthoritySource,
        query: &str,
        ctx: MatchContext<'_>,
    ) -> Result<Vec<AuthorityHit>, MatchError> {
        let key = crate::cache::cache_key(source.name(), &fold(query));
        if let Some(hits) = ctx.cache.get::<Vec<AuthorityHit>>(&key) {
            return Ok(hits);
        }
        let hits = source.search(query, ctx).await?;
        if let Err(e) = ctx.cache.put(&key, &hits) {
            tracing::warn!(error = %e, "failed to cache authority hits");
        }
        Ok(hits)
    }

    /// First source with a compatible hit wins.
    pub async fn resolve_one(
        &self,
        variant: &str,
        ctx: MatchContext<'_>,
    ) -> Result<Option<AuthorityMatch>, MatchError> {
        let query = Self::query_for(variant);
        if query.trim().is_empty() {
            return Ok(None);
        }
        for source in &self.sources {
            let hits = match self.search_cached(source.as_ref(), &query, ctx).await {
                Ok(hits) => hits,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(source = source.name(), variant, error = %e, "authority lookup failed");
                    continue;
                }
            };
            if let Some(hit) = best_hit(variant, &hits) {
                tracing::debug!(source = source.name(), variant, id = %hit.id, "name resolved");
                return Ok(Some(AuthorityMatch {
                    authority: source.name().to_string(),
                    id: hit.id.clone(),
                    preferred_name: hit.preferred_name.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Resolve every variant; unresolved ones are kept with `None`.
    pub async fn resolve(
        &self,
        variants: &[String],
        ctx: MatchContext<'_>,
    ) -> Result<NameResolution, MatchError> {
        let mut resolution = NameResolution::default();
        for variant in variants {
            let resolved = self.resolve_one(variant, ctx).await?;
            resolution.entries.push(NameEntry {
                variant: variant.clone(),
                resolved,
            });
        }
        Ok(resolution)
    }
}
