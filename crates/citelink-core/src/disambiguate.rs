//! Human disambiguation when several candidates survive filtering.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::{CandidateRecord, MatchChoice};

/// Picks one of several labelled candidates, or none.
///
/// `choices` always ends with the "no match" entry (`value: None`).
/// Implementations may block; the pipeline waits for the answer.
pub trait Disambiguator: Send + Sync {
    fn choose(&self, prompt: &str, choices: &[MatchChoice]) -> Option<CandidateRecord>;
}

/// Declines every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineAll;

impl Disambiguator for DeclineAll {
    fn choose(&self, _prompt: &str, _choices: &[MatchChoice]) -> Option<CandidateRecord> {
        None
    }
}

/// Answers prompts from a fixed script of choice indices.
///
/// `None` in the script, an out-of-range index or an exhausted script all
/// select "no match". Every prompt is recorded for later inspection.
#[derive(Debug, Default)]
pub struct ScriptedDisambiguator {
    picks: Mutex<VecDeque<Option<usize>>>,
    prompts: Mutex<Vec<(String, usize)>>,
}

impl ScriptedDisambiguator {
    pub fn new(picks: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self {
            picks: Mutex::new(picks.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far, with the number of choices offered.
    pub fn prompts(&self) -> Vec<(String, usize)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Disambiguator for ScriptedDisambiguator {
    fn choose(&self, prompt: &str, choices: &[MatchChoice]) -> Option<CandidateRecord> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((prompt.to_string(), choices.len()));
        }
        let pick = self.picks.lock().ok()?.pop_front().flatten()?;
        choices.get(pick).and_then(|c| c.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices() -> Vec<MatchChoice> {
        vec![
            MatchChoice::candidate(CandidateRecord {
                title: "A".into(),
                ..Default::default()
            }),
            MatchChoice::candidate(CandidateRecord {
                title: "B".into(),
                ..Default::default()
            }),
            MatchChoice::no_match(),
        ]
    }

    #[test]
    fn test_scripted_picks_in_order() {
        let d = ScriptedDisambiguator::new([Some(1), None, Some(2)]);
        assert_eq!(d.choose("p1", &choices()).unwrap().title, "B");
        assert!(d.choose("p2", &choices()).is_none());
        assert!(d.choose("p3", &choices()).is_none());
        assert!(d.choose("p4", &choices()).is_none());
        assert_eq!(d.prompts().len(), 4);
        assert_eq!(d.prompts()[0], ("p1".to_string(), 3));
    }

    #[test]
    fn test_decline_all() {
        assert!(DeclineAll.choose("p", &choices()).is_none());
    }
}
