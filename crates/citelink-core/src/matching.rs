//! Candidate filters shared by every matcher, and ambiguity collapsing.

use crate::disambiguate::Disambiguator;
use crate::model::{CandidateRecord, MatchChoice};
use crate::segmentation::SegmentedReference;

/// Maximum edit distance between the compared title prefixes.
pub const TITLE_DISTANCE_THRESHOLD: usize = 10;

/// What a matcher does with several surviving candidates when nobody can be asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityPolicy {
    /// Take the first candidate in result order.
    First,
    /// Return no match.
    Reject,
}

/// Title similarity gate.
///
/// Both titles are lowercased and truncated to the shorter one's character
/// length; the pair passes when the Levenshtein distance of the prefixes is
/// at most [`TITLE_DISTANCE_THRESHOLD`]. Differences beyond the shared
/// length (subtitles, series notes) are ignored.
pub fn title_gate(title_a: &str, title_b: &str) -> bool {
    let a = title_a.trim().to_lowercase();
    let b = title_b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let len = a.chars().count().min(b.chars().count());
    let prefix_a: String = a.chars().take(len).collect();
    let prefix_b: String = b.chars().take(len).collect();

    strsim::levenshtein(&prefix_a, &prefix_b) <= TITLE_DISTANCE_THRESHOLD
}

/// At least one surname occurs in `authors_text` (case-insensitive substring).
pub fn names_present(last_names: &[String], authors_text: &str) -> bool {
    let haystack = authors_text.to_lowercase();
    last_names
        .iter()
        .any(|name| !name.is_empty() && haystack.contains(&name.to_lowercase()))
}

/// Apply the year, author and title filters to one candidate.
pub fn accept_candidate(key: &SegmentedReference, record: &CandidateRecord) -> bool {
    if record.year() != Some(key.year) {
        return false;
    }
    if !names_present(&key.last_names, &record.authors_text()) {
        return false;
    }
    title_gate(&key.title, &record.title)
}

/// Keep only candidates passing [`accept_candidate`], preserving order.
pub fn filter_candidates(
    key: &SegmentedReference,
    candidates: Vec<CandidateRecord>,
) -> Vec<CandidateRecord> {
    candidates
        .into_iter()
        .filter(|c| accept_candidate(key, c))
        .collect()
}

/// Collapse filtered candidates to at most one record.
///
/// Zero yields `None` and one is accepted. With several, the
/// `disambiguator` is asked if one is given (interactive mode); otherwise
/// `policy` decides.
pub fn collapse(
    mut candidates: Vec<CandidateRecord>,
    policy: AmbiguityPolicy,
    disambiguator: Option<&dyn Disambiguator>,
    prompt: &str,
) -> Option<CandidateRecord> {
    match candidates.len() {
        0 => None,
        1 => candidates.pop(),
        n => {
            if let Some(d) = disambiguator {
                let mut choices: Vec<MatchChoice> =
                    candidates.into_iter().map(MatchChoice::candidate).collect();
                choices.push(MatchChoice::no_match());
                return d.choose(prompt, &choices);
            }
            tracing::debug!(candidates = n, ?policy, "ambiguous match resolved by policy");
            match policy {
                AmbiguityPolicy::First => Some(candidates.swap_remove(0)),
                AmbiguityPolicy::Reject => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disambiguate::ScriptedDisambiguator;
    use crate::model::Creator;

    fn key() -> SegmentedReference {
        SegmentedReference {
            last_names: vec!["smith".into()],
            year: 1998,
            title_words: vec!["widgets".into()],
            title: "On Widgets".into(),
        }
    }

    fn record(title: &str, date: &str, last: &str) -> CandidateRecord {
        CandidateRecord {
            title: title.into(),
            date: date.into(),
            creators: vec![Creator::person(last, "J.")],
            ..Default::default()
        }
    }

    #[test]
    fn test_title_gate_compares_common_prefix_only() {
        assert!(title_gate(
            "On Widgets",
            "On widgets: a comprehensive survey of widget theory and practice"
        ));
        assert!(title_gate("Widget Theory", "Widgit Thoery"));
        assert!(!title_gate("On Widgets and Gadgets", "Completely unrelated!!"));
        assert!(!title_gate("", "On Widgets"));
    }

    #[test]
    fn test_title_gate_threshold_is_inclusive() {
        // Ten substitutions over a twenty-character prefix.
        assert!(title_gate("aaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbaaaaaaaaaa"));
        assert!(!title_gate("aaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbbaaaaaaaaa"));
    }

    #[test]
    fn test_accept_candidate_filters() {
        let key = key();
        assert!(accept_candidate(&key, &record("On Widgets", "1998", "Smith")));
        assert!(!accept_candidate(&key, &record("On Widgets", "1999", "Smith")));
        assert!(!accept_candidate(&key, &record("On Widgets", "1998", "Jones")));
        assert!(accept_candidate(
            &key,
            &record("On Widgets", "1998", "Goldsmith")
        ));
    }

    #[test]
    fn test_collapse_policies() {
        let three = || {
            vec![
                record("On Widgets", "1998", "Smith"),
                record("On Widgets II", "1998", "Smith"),
                record("On Widgets III", "1998", "Smith"),
            ]
        };
        assert_eq!(
            collapse(three(), AmbiguityPolicy::First, None, "p")
                .unwrap()
                .title,
            "On Widgets"
        );
        assert!(collapse(three(), AmbiguityPolicy::Reject, None, "p").is_none());
        assert!(collapse(Vec::new(), AmbiguityPolicy::First, None, "p").is_none());
        assert_eq!(
            collapse(
                vec![record("Solo", "1998", "Smith")],
                AmbiguityPolicy::Reject,
                None,
                "p"
            )
            .unwrap()
            .title,
            "Solo"
        );
    }

    #[test]
    fn test_collapse_asks_disambiguator() {
        let d = ScriptedDisambiguator::new([Some(2)]);
        let picked = collapse(
            vec![
                record("A", "1998", "Smith"),
                record("B", "1998", "Smith"),
                record("C", "1998", "Smith"),
            ],
            AmbiguityPolicy::Reject,
            Some(&d),
            "Which one?",
        );
        assert_eq!(picked.unwrap().title, "C");
        // Three candidates plus "no match".
        assert_eq!(d.prompts()[0].1, 4);
    }
}
