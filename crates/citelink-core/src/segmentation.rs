//! Turns a probabilistic segmentation into a canonical comparison key.
//!
//! A reference is either fully keyed (surnames, title words and year all
//! present) or skipped with a [`SkipReason`]; partial keys never reach a
//! matcher.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::RawSegmentation;

/// Minimum surname length, in characters, for a name to be used in queries.
const MIN_SURNAME_CHARS: usize = 3;

/// Title words must be longer than this, in characters.
const MIN_TITLE_WORD_CHARS: usize = 3;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[12][9012][0-9]{2}").unwrap());
static DIGIT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").unwrap());

/// Canonical comparison key for one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedReference {
    /// Lowercased surnames; the first is the primary author.
    pub last_names: Vec<String>,
    pub year: i32,
    /// Lowercased title words, most reliable first.
    pub title_words: Vec<String>,
    /// Reconstructed title in original fragment order.
    pub title: String,
}

/// Why a reference was not sent to the matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    MissingAuthor,
    MissingTitle,
    MissingYear,
    NoUsableNames,
    NoUsableTitleWords,
    /// Two or more distinct year-like tokens; likely several references run together.
    MultipleYears,
    /// Matched an operator-configured ignore pattern.
    Ignored,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingAuthor => "missing_author",
            SkipReason::MissingTitle => "missing_title",
            SkipReason::MissingYear => "missing_year",
            SkipReason::NoUsableNames => "no_usable_names",
            SkipReason::NoUsableTitleWords => "no_usable_title_words",
            SkipReason::MultipleYears => "multiple_years",
            SkipReason::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reason skip counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipStats {
    pub missing_author: usize,
    pub missing_title: usize,
    pub missing_year: usize,
    pub no_usable_names: usize,
    pub no_usable_title_words: usize,
    pub multiple_years: usize,
    pub ignored: usize,
}

impl SkipStats {
    pub fn record(&mut self, reason: SkipReason) {
        let slot = match reason {
            SkipReason::MissingAuthor => &mut self.missing_author,
            SkipReason::MissingTitle => &mut self.missing_title,
            SkipReason::MissingYear => &mut self.missing_year,
            SkipReason::NoUsableNames => &mut self.no_usable_names,
            SkipReason::NoUsableTitleWords => &mut self.no_usable_title_words,
            SkipReason::MultipleYears => &mut self.multiple_years,
            SkipReason::Ignored => &mut self.ignored,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.missing_author
            + self.missing_title
            + self.missing_year
            + self.no_usable_names
            + self.no_usable_title_words
            + self.multiple_years
            + self.ignored
    }

    pub fn merge(&mut self, other: &SkipStats) {
        self.missing_author += other.missing_author;
        self.missing_title += other.missing_title;
        self.missing_year += other.missing_year;
        self.no_usable_names += other.no_usable_names;
        self.no_usable_title_words += other.no_usable_title_words;
        self.multiple_years += other.multiple_years;
        self.ignored += other.ignored;
    }
}

/// Distinct year-like tokens in `text`, in order of first appearance.
pub fn year_tokens(text: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    DIGIT_RUN_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|run| run.len() == 4 && YEAR_RE.is_match(run))
        .filter(|run| seen.insert(*run))
        .collect()
}

/// Checks on the raw text, applied before the segmentation is looked at.
pub fn precheck(text: &str, ignore_patterns: &[String]) -> Result<(), SkipReason> {
    let lower = text.to_lowercase();
    if ignore_patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .any(|p| !p.is_empty() && lower.contains(&p))
    {
        return Err(SkipReason::Ignored);
    }
    if year_tokens(text).len() >= 2 {
        return Err(SkipReason::MultipleYears);
    }
    Ok(())
}

fn letters_only(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphabetic() || c.is_whitespace())
        .collect()
}

/// Build the comparison key from a segmentation.
pub fn normalize(seg: &RawSegmentation) -> Result<SegmentedReference, SkipReason> {
    if seg.author.iter().all(|group| group.is_empty()) {
        return Err(SkipReason::MissingAuthor);
    }
    if seg.title.is_empty() {
        return Err(SkipReason::MissingTitle);
    }
    if seg.year.is_empty() {
        return Err(SkipReason::MissingYear);
    }

    let mut last_names: Vec<String> = Vec::new();
    for group in &seg.author {
        let Some(surname) = group.first().and_then(|p| p.surname()) else {
            continue;
        };
        let cleaned = letters_only(surname);
        let Some(token) = cleaned.split_whitespace().next() else {
            continue;
        };
        let token = token.to_lowercase();
        if token.chars().count() >= MIN_SURNAME_CHARS && !last_names.contains(&token) {
            last_names.push(token);
        }
    }
    if last_names.is_empty() {
        return Err(SkipReason::NoUsableNames);
    }

    // Lower scores are the segmenter's more reliable fragments.
    let mut fragments: Vec<_> = seg.title.iter().collect();
    fragments.sort_by(|a, b| a.score.total_cmp(&b.score));

    let mut title_words: Vec<String> = Vec::new();
    for fragment in fragments {
        for word in fragment.value.split_whitespace() {
            let word = letters_only(word).to_lowercase();
            if word.chars().count() > MIN_TITLE_WORD_CHARS && !title_words.contains(&word) {
                title_words.push(word);
            }
        }
    }
    if title_words.is_empty() {
        return Err(SkipReason::NoUsableTitleWords);
    }

    let title = seg
        .title
        .iter()
        .map(|s| s.value.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let year = seg
        .year
        .first()
        .and_then(|y| YEAR_RE.find(&y.value))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .ok_or(SkipReason::MissingYear)?;

    Ok(SegmentedReference {
        last_names,
        year,
        title_words,
        title,
    })
}

/// Pre-checks followed by normalization.
pub fn segment(
    text: &str,
    seg: &RawSegmentation,
    ignore_patterns: &[String],
) -> Result<SegmentedReference, SkipReason> {
    precheck(text, ignore_patterns)?;
    normalize(seg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RawPerson, Scored};

    fn widgets() -> RawSegmentation {
        RawSegmentation {
            author: vec![vec![RawPerson::new("Smith", "J.")]],
            title: vec![Scored::new("On Widgets", 0.3)],
            year: vec![Scored::new("(1998).", 0.1)],
            source: vec![Scored::new("Journal of Widgets", 0.2)],
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_widgets() {
        let key = normalize(&widgets()).unwrap();
        assert_eq!(key.last_names, vec!["smith"]);
        assert_eq!(key.year, 1998);
        assert_eq!(key.title_words, vec!["widgets"]);
        assert_eq!(key.title, "On Widgets");
    }

    #[test]
    fn test_missing_groups_skip() {
        let mut seg = widgets();
        seg.author.clear();
        assert_eq!(normalize(&seg), Err(SkipReason::MissingAuthor));

        let mut seg = widgets();
        seg.title.clear();
        assert_eq!(normalize(&seg), Err(SkipReason::MissingTitle));

        let mut seg = widgets();
        seg.year.clear();
        assert_eq!(normalize(&seg), Err(SkipReason::MissingYear));

        let mut seg = widgets();
        seg.year = vec![Scored::new("n.d.", 0.0)];
        assert_eq!(normalize(&seg), Err(SkipReason::MissingYear));
    }

    #[test]
    fn test_short_and_symbolic_names_dropped() {
        let mut seg = widgets();
        seg.author = vec![
            vec![RawPerson::new("Li", "X.")],
            vec![RawPerson::new("O'Neil-Barrett Jr", "K.")],
            vec![RawPerson::new("Müller", "H."), RawPerson::new("Secondary", "A.")],
        ];
        let key = normalize(&seg).unwrap();
        assert_eq!(key.last_names, vec!["oneilbarrett", "müller"]);

        seg.author = vec![vec![RawPerson::new("Li", "X.")]];
        assert_eq!(normalize(&seg), Err(SkipReason::NoUsableNames));
    }

    #[test]
    fn test_title_words_ordered_by_ascending_score() {
        let mut seg = widgets();
        seg.title = vec![
            Scored::new("Gadgets, Gizmos", 0.9),
            Scored::new("and the Widgets", 0.1),
        ];
        let key = normalize(&seg).unwrap();
        assert_eq!(key.title_words, vec!["widgets", "gadgets", "gizmos"]);
        assert_eq!(key.title, "Gadgets, Gizmos and the Widgets");
    }

    #[test]
    fn test_short_title_words_skip() {
        let mut seg = widgets();
        seg.title = vec![Scored::new("On it", 0.0)];
        assert_eq!(normalize(&seg), Err(SkipReason::NoUsableTitleWords));
    }

    #[test]
    fn test_precheck_multiple_years() {
        assert_eq!(
            precheck("Smith (1998) On Widgets; Jones (2001) More Widgets", &[]),
            Err(SkipReason::MultipleYears)
        );
        // The same year twice is one distinct token.
        assert_eq!(precheck("Smith 1998. Widgets, 1998.", &[]), Ok(()));
        assert_eq!(precheck("Smith, J. (1998). On Widgets. 12, 45-60.", &[]), Ok(()));
    }

    #[test]
    fn test_precheck_ignore_patterns() {
        let ignore = vec!["IBID".to_string()];
        assert_eq!(precheck("Ibid., p. 4", &ignore), Err(SkipReason::Ignored));
        assert_eq!(precheck("Smith 1998", &ignore), Ok(()));
    }

    #[test]
    fn test_skip_stats() {
        let mut stats = SkipStats::default();
        stats.record(SkipReason::MultipleYears);
        stats.record(SkipReason::MissingTitle);
        stats.record(SkipReason::MultipleYears);
        assert_eq!(stats.multiple_years, 2);
        assert_eq!(stats.total(), 3);
    }
}
