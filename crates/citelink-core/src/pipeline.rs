//! Per-document driver: resolves each reference, links it to the citing
//! record and hands the results to a [`CitationSink`].

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::cascade::{MatchCascade, ResolutionState};
use crate::library::{Library, add_relation};
use crate::matchers::MatchContext;
use crate::model::{CandidateRecord, CitationRelation, CitingDocument};
use crate::{CoreError, ProgressEvent, ReferenceOutcome, RunStats};

/// A resolved reference of a citing document.
#[derive(Debug, Clone, PartialEq)]
pub struct CitedEntry {
    pub key: String,
    pub state: ResolutionState,
    pub record: CandidateRecord,
}

/// Where finished documents go (the legacy export file, in practice).
pub trait CitationSink {
    /// Whether this document was already written by an earlier run.
    fn is_recorded(&self, doc: &CitingDocument) -> bool;

    fn record(&mut self, doc: &CitingDocument, cited: &[CitedEntry]) -> std::io::Result<()>;
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<(CitingDocument, Vec<CitedEntry>)>,
}

impl CitationSink for MemorySink {
    fn is_recorded(&self, doc: &CitingDocument) -> bool {
        self.records.iter().any(|(d, _)| d.key == doc.key)
    }

    fn record(&mut self, doc: &CitingDocument, cited: &[CitedEntry]) -> std::io::Result<()> {
        self.records.push((doc.clone(), cited.to_vec()));
        Ok(())
    }
}

/// Parse citing documents from a JSON array or JSON lines.
pub fn parse_documents(text: &str) -> Result<Vec<CitingDocument>, CoreError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| CoreError::Input(format!("document array: {}", e)));
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| CoreError::Input(format!("line {}: {}", i + 1, e)))
        })
        .collect()
}

pub fn read_documents(path: &Path) -> Result<Vec<CitingDocument>, CoreError> {
    let text = std::fs::read_to_string(path)?;
    parse_documents(&text)
}

pub struct Pipeline<'a, L: Library + ?Sized> {
    cascade: &'a MatchCascade,
    library: &'a L,
    ctx: MatchContext<'a>,
}

impl<'a, L: Library + ?Sized> Pipeline<'a, L> {
    pub fn new(cascade: &'a MatchCascade, library: &'a L, ctx: MatchContext<'a>) -> Self {
        Self {
            cascade,
            library,
            ctx,
        }
    }

    /// Resolve and link every reference of `doc`.
    ///
    /// Transient failures abort the document and propagate; anything else is
    /// logged and the reference counted as failed.
    pub async fn process_document(
        &self,
        doc: &CitingDocument,
        progress: &(dyn Fn(ProgressEvent) + Sync),
    ) -> Result<(RunStats, Vec<CitedEntry>), CoreError> {
        let mut stats = RunStats {
            documents: 1,
            ..Default::default()
        };
        let mut entries = Vec::new();
        let count = doc.references.len();

        for (i, reference) in doc.references.iter().enumerate() {
            let resolution = match self
                .cascade
                .resolve(&reference.text, &reference.segmentation, self.ctx, self.library)
                .await
            {
                Ok(resolution) => resolution,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(doc = %doc.key, reference = i + 1, error = %e, "reference failed");
                    let outcome = ReferenceOutcome::Failed {
                        message: e.to_string(),
                    };
                    stats.record(&outcome);
                    progress(ProgressEvent::Reference {
                        doc_key: doc.key.clone(),
                        index: i,
                        total: count,
                        text: reference.text.clone(),
                        outcome,
                    });
                    continue;
                }
            };

            let outcome = match (resolution.state, resolution.record) {
                (ResolutionState::Skipped(reason), _) => ReferenceOutcome::Skipped(reason),
                (state, Some(record)) => {
                    let cited_key = record.key.clone().unwrap_or_default();
                    let label = record.label();
                    let relation = CitationRelation::new(doc.key.as_str(), cited_key.as_str());
                    let linked = add_relation(self.library, &relation).await;
                    entries.push(CitedEntry {
                        key: cited_key.clone(),
                        state,
                        record,
                    });
                    match linked {
                        Ok(added) => {
                            tracing::debug!(citing = %doc.key, cited = %cited_key, added, "citation relation");
                            ReferenceOutcome::Resolved {
                                state,
                                matcher: resolution.matcher,
                                cited_key,
                                label,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(citing = %doc.key, cited = %cited_key, error = %e, "could not add citation relation");
                            ReferenceOutcome::Failed {
                                message: e.to_string(),
                            }
                        }
                    }
                }
                (_, None) => ReferenceOutcome::Failed {
                    message: "resolution without record".to_string(),
                },
            };

            stats.record(&outcome);
            progress(ProgressEvent::Reference {
                doc_key: doc.key.clone(),
                index: i,
                total: count,
                text: reference.text.clone(),
                outcome,
            });
        }

        if stats.skip_reasons.total() > 0 {
            tracing::info!(doc = %doc.key, skip_reasons = ?stats.skip_reasons, "references skipped");
        }
        Ok((stats, entries))
    }

    /// One pass over `docs`. Documents the sink already has are skipped.
    pub async fn run_pass<S: CitationSink + ?Sized>(
        &self,
        docs: &[CitingDocument],
        sink: &mut S,
        progress: &(dyn Fn(ProgressEvent) + Sync),
        cancel: &CancellationToken,
    ) -> Result<RunStats, CoreError> {
        let total = docs.len();
        let mut stats = RunStats::default();

        for (index, doc) in docs.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(done = index, total, "run cancelled");
                break;
            }
            if sink.is_recorded(doc) {
                stats.documents_skipped += 1;
                progress(ProgressEvent::DocumentSkipped {
                    index,
                    total,
                    key: doc.key.clone(),
                });
                continue;
            }

            progress(ProgressEvent::DocumentStarted {
                index,
                total,
                key: doc.key.clone(),
                references: doc.references.len(),
            });
            let (doc_stats, entries) = self.process_document(doc, progress).await?;
            sink.record(doc, &entries)?;
            stats.merge(&doc_stats);

            progress(ProgressEvent::DocumentFinished {
                index,
                total,
                key: doc.key.clone(),
                stats: doc_stats,
            });

            if let Err(e) = self.ctx.cache.flush(false) {
                tracing::warn!(error = %e, "cache flush failed");
            }
        }
        Ok(stats)
    }

    /// Run passes until one completes. A pass that fails with a timeout is
    /// restarted, up to `pass_retries` passes in total; other errors halt.
    /// The cache is always flushed at the end.
    pub async fn run<S: CitationSink + ?Sized>(
        &self,
        docs: &[CitingDocument],
        sink: &mut S,
        progress: &(dyn Fn(ProgressEvent) + Sync),
        cancel: &CancellationToken,
    ) -> Result<RunStats, CoreError> {
        let passes = self.ctx.config.pass_retries.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.run_pass(docs, sink, progress, cancel).await {
                Ok(stats) => break Ok(stats),
                Err(e) if attempt < passes && (e.is_transient() || e.to_string().to_lowercase().contains("timeout")) => {
                    tracing::warn!(attempt, passes, error = %e, "pass failed on timeout, restarting");
                    progress(ProgressEvent::RetryPass {
                        attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.ctx.cache.flush(true) {
            tracing::warn!(error = %e, "final cache flush failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_documents_array_and_lines() {
        let array = r#"[{"key": "A", "DOI": "10.1/a", "references": []}]"#;
        let docs = parse_documents(array).unwrap();
        assert_eq!(docs[0].doi(), Some("10.1/a"));

        let lines = "{\"key\": \"A\"}\n\n{\"key\": \"B\", \"references\": [{\"text\": \"x\"}]}\n";
        let docs = parse_documents(lines).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].references[0].text, "x");

        let err = parse_documents("{\"key\": \"A\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_memory_sink_tracks_keys() {
        let mut sink = MemorySink::default();
        let doc = CitingDocument {
            key: "A".into(),
            ..Default::default()
        };
        assert!(!sink.is_recorded(&doc));
        sink.record(&doc, &[]).unwrap();
        assert!(sink.is_recorded(&doc));
    }
}
