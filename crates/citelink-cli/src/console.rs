use std::sync::Mutex;

use citelink_core::{CandidateRecord, Disambiguator, MatchChoice};
use dialoguer::Select;
use dialoguer::theme::{ColorfulTheme, SimpleTheme, Theme};

use crate::output::ColorMode;

/// Asks on the terminal which candidate a reference means.
pub struct ConsoleDisambiguator {
    color: ColorMode,
    /// Serializes prompts so answers cannot interleave.
    lock: Mutex<()>,
}

impl ConsoleDisambiguator {
    pub fn new(color: ColorMode) -> Self {
        Self {
            color,
            lock: Mutex::new(()),
        }
    }
}

/// Record behind a selection. Esc (`None`) and the "no match" entry both
/// decline.
fn picked(choices: &[MatchChoice], selection: Option<usize>) -> Option<CandidateRecord> {
    selection
        .and_then(|index| choices.get(index))
        .and_then(|choice| choice.value.clone())
}

impl Disambiguator for ConsoleDisambiguator {
    fn choose(&self, prompt: &str, choices: &[MatchChoice]) -> Option<CandidateRecord> {
        let _guard = self.lock.lock().ok()?;
        let colorful = ColorfulTheme::default();
        let theme: &dyn Theme = if self.color.enabled() {
            &colorful
        } else {
            &SimpleTheme
        };
        let labels: Vec<&str> = choices.iter().map(|c| c.label.as_str()).collect();

        let selection = Select::with_theme(theme)
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact_opt();
        match selection {
            Ok(selection) => picked(choices, selection),
            Err(e) => {
                tracing::warn!(error = %e, "disambiguation prompt failed, treating as no match");
                None
            }
        }
    }
}
