use std::io::Write;

use citelink_core::{ProgressEvent, ReferenceOutcome, ResolutionState, RunStats, SkipStats};
use citelink_mirror::MirrorInfo;
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn shorten(text: &str, max: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

/// Print a real-time progress event.
pub fn print_progress(
    w: &mut dyn Write,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        ProgressEvent::DocumentStarted {
            index,
            total,
            key,
            references,
        } => {
            writeln!(w)?;
            let header = format!("[{}/{}] {} ({} references)", index + 1, total, key, references);
            if color.enabled() {
                writeln!(w, "{}", header.bold())?;
            } else {
                writeln!(w, "{}", header)?;
            }
        }
        ProgressEvent::DocumentSkipped { index, total, key } => {
            let line = format!("[{}/{}] {} already exported, skipping", index + 1, total, key);
            if color.enabled() {
                writeln!(w, "{}", line.dimmed())?;
            } else {
                writeln!(w, "{}", line)?;
            }
        }
        ProgressEvent::Reference {
            index,
            total,
            text,
            outcome,
            ..
        } => {
            let prefix = format!("  ({}/{}) {}", index + 1, total, shorten(text, 60));
            match outcome {
                ReferenceOutcome::Resolved {
                    state,
                    matcher,
                    cited_key,
                    label,
                } => {
                    let via = matcher.as_deref().unwrap_or("stub");
                    let tag = match state {
                        ResolutionState::Linked => "LINKED",
                        ResolutionState::Created => "CREATED",
                        ResolutionState::Unidentified => "UNIDENTIFIED",
                        ResolutionState::Skipped(_) => "SKIPPED",
                    };
                    if color.enabled() {
                        let tag = match state {
                            ResolutionState::Linked => tag.green().to_string(),
                            ResolutionState::Created => tag.cyan().to_string(),
                            _ => tag.yellow().to_string(),
                        };
                        writeln!(w, "{}\n      -> {} {} ({}) {}", prefix, tag, cited_key, via, label.dimmed())?;
                    } else {
                        writeln!(w, "{}\n      -> {} {} ({}) {}", prefix, tag, cited_key, via, label)?;
                    }
                }
                ReferenceOutcome::Skipped(reason) => {
                    if color.enabled() {
                        writeln!(w, "{}\n      -> {}", prefix, format!("SKIPPED ({})", reason).dimmed())?;
                    } else {
                        writeln!(w, "{}\n      -> SKIPPED ({})", prefix, reason)?;
                    }
                }
                ReferenceOutcome::Failed { message } => {
                    if color.enabled() {
                        writeln!(w, "{}\n      -> {} {}", prefix, "FAILED".red(), message)?;
                    } else {
                        writeln!(w, "{}\n      -> FAILED {}", prefix, message)?;
                    }
                }
            }
        }
        ProgressEvent::DocumentFinished { key, stats, .. } => {
            writeln!(
                w,
                "  {}: {} linked, {} created, {} unidentified, {} skipped, {} failed",
                key, stats.linked, stats.created, stats.unidentified, stats.skipped, stats.failed
            )?;
        }
        ProgressEvent::RetryPass { attempt, message } => {
            writeln!(w)?;
            if color.enabled() {
                writeln!(w, "{} {}", "TIMEOUT:".yellow(), message)?;
            } else {
                writeln!(w, "TIMEOUT: {}", message)?;
            }
            writeln!(w, "Restarting pass (attempt {} failed)...", attempt)?;
        }
    }
    Ok(())
}

fn print_skip_breakdown(w: &mut dyn Write, skips: &SkipStats) -> std::io::Result<()> {
    let rows = [
        ("missing author", skips.missing_author),
        ("missing title", skips.missing_title),
        ("missing year", skips.missing_year),
        ("no usable names", skips.no_usable_names),
        ("no usable title words", skips.no_usable_title_words),
        ("several years", skips.multiple_years),
        ("ignored", skips.ignored),
    ];
    for (label, count) in rows.iter().filter(|(_, c)| *c > 0) {
        writeln!(w, "    {:<22} {}", label, count)?;
    }
    Ok(())
}

/// Print the final run summary.
pub fn print_summary(w: &mut dyn Write, stats: &RunStats, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "SUMMARY".bold())?;
    } else {
        writeln!(w, "SUMMARY")?;
    }
    writeln!(w, "  Documents processed:  {}", stats.documents)?;
    writeln!(w, "  Already exported:     {}", stats.documents_skipped)?;
    writeln!(w, "  References:           {}", stats.references)?;
    if color.enabled() {
        writeln!(w, "  Linked:               {}", stats.linked.to_string().green())?;
        writeln!(w, "  Created:              {}", stats.created.to_string().cyan())?;
        writeln!(w, "  Unidentified:         {}", stats.unidentified.to_string().yellow())?;
        writeln!(w, "  Failed:               {}", stats.failed.to_string().red())?;
    } else {
        writeln!(w, "  Linked:               {}", stats.linked)?;
        writeln!(w, "  Created:              {}", stats.created)?;
        writeln!(w, "  Unidentified:         {}", stats.unidentified)?;
        writeln!(w, "  Failed:               {}", stats.failed)?;
    }
    writeln!(w, "  Skipped:              {}", stats.skipped)?;
    print_skip_breakdown(w, &stats.skip_reasons)?;
    Ok(())
}

pub fn print_mirror_info(
    w: &mut dyn Write,
    info: &MirrorInfo,
    stale_days: Option<u64>,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(
        w,
        "Schema version: {}",
        info.schema_version.as_deref().unwrap_or("unknown")
    )?;
    writeln!(
        w,
        "Last updated:   {}",
        info.last_updated.as_deref().unwrap_or("never")
    )?;
    if let Some(days) = stale_days {
        let msg = format!("Mirror is {} days old; consider re-importing.", days);
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }
    if info.item_counts.is_empty() {
        writeln!(w, "No items.")?;
    }
    for (library, count) in &info.item_counts {
        writeln!(w, "  library {:<12} {} items", library, count)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use citelink_core::SkipReason;

    fn render(event: &ProgressEvent) -> String {
        let mut buf = Vec::new();
        print_progress(&mut buf, event, ColorMode(false)).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_reference_lines() {
        let linked = render(&ProgressEvent::Reference {
            doc_key: "A".into(),
            index: 0,
            total: 2,
            text: "Smith,  J. (1998)\n On Widgets".into(),
            outcome: ReferenceOutcome::Resolved {
                state: ResolutionState::Linked,
                matcher: Some("local".into()),
                cited_key: "ABC123".into(),
                label: "Smith (1998) On Widgets".into(),
            },
        });
        assert!(linked.contains("(1/2) Smith, J. (1998) On Widgets"));
        assert!(linked.contains("-> LINKED ABC123 (local)"));

        let skipped = render(&ProgressEvent::Reference {
            doc_key: "A".into(),
            index: 1,
            total: 2,
            text: "x".into(),
            outcome: ReferenceOutcome::Skipped(SkipReason::MultipleYears),
        });
        assert!(skipped.contains("SKIPPED (multiple_years)"));
    }

    #[test]
    fn test_summary_lists_only_nonzero_skips() {
        let mut stats = RunStats::default();
        stats.record(&ReferenceOutcome::Skipped(SkipReason::MissingYear));
        let mut buf = Vec::new();
        print_summary(&mut buf, &stats, ColorMode(false)).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("missing year"));
        assert!(!out.contains("ignored"));
    }

    #[test]
    fn test_shorten_counts_chars() {
        assert_eq!(shorten("Müller über Größe", 6), "Müller...");
        assert_eq!(shorten("short", 60), "short");
    }
}
