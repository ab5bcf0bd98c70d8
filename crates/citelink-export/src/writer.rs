use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use citelink_core::{CitationSink, CitedEntry, CitingDocument};

use crate::ExportError;
use crate::format::{HEADER, render_record};

/// Append-only export file.
///
/// On open the existing file is scanned for `DI` and `UT` values; documents
/// carrying one of them count as already recorded, so re-running a batch
/// does not duplicate records.
#[derive(Debug)]
pub struct ExportWriter {
    path: PathBuf,
    dois: HashSet<String>,
    keys: HashSet<String>,
    has_header: bool,
}

impl ExportWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| ExportError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut writer = Self {
            path: path.clone(),
            dois: HashSet::new(),
            keys: HashSet::new(),
            has_header: false,
        };
        if !path.exists() {
            return Ok(writer);
        }

        let content = std::fs::read_to_string(&path).map_err(io_err)?;
        if content.trim().is_empty() {
            return Ok(writer);
        }
        if !content.starts_with("FN ") {
            return Err(ExportError::NotAnExport(path.display().to_string()));
        }
        writer.has_header = true;
        for line in content.lines() {
            if let Some(doi) = line.strip_prefix("DI ") {
                writer.dois.insert(doi.trim().to_lowercase());
            } else if let Some(key) = line.strip_prefix("UT ") {
                writer.keys.insert(key.trim().to_string());
            }
        }
        tracing::info!(
            path = %path.display(),
            dois = writer.dois.len(),
            keys = writer.keys.len(),
            "opened existing export file"
        );
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of documents already in the file or written since opening.
    pub fn recorded_count(&self) -> usize {
        self.keys.len()
    }

    fn append(&mut self, block: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if !self.has_header {
            file.write_all(HEADER.as_bytes())?;
            self.has_header = true;
        }
        file.write_all(block.as_bytes())?;
        file.flush()
    }
}

impl CitationSink for ExportWriter {
    fn is_recorded(&self, doc: &CitingDocument) -> bool {
        self.keys.contains(doc.key.trim())
            || doc
                .doi()
                .is_some_and(|doi| self.dois.contains(&doi.to_lowercase()))
    }

    fn record(&mut self, doc: &CitingDocument, cited: &[CitedEntry]) -> std::io::Result<()> {
        self.append(&render_record(doc, cited))?;
        self.keys.insert(doc.key.trim().to_string());
        if let Some(doi) = doc.doi() {
            self.dois.insert(doi.to_lowercase());
        }
        tracing::debug!(key = %doc.key, references = cited.len(), "export record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(key: &str, doi: Option<&str>) -> CitingDocument {
        CitingDocument {
            key: key.into(),
            doi: doi.map(str::to_string),
            title: "T".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut writer = ExportWriter::open(&path).unwrap();
        writer.record(&doc("A", None), &[]).unwrap();
        writer.record(&doc("B", None), &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(HEADER));
        assert_eq!(content.matches("FN ").count(), 1);
        assert_eq!(content.matches("ER\n\n").count(), 2);
    }

    #[test]
    fn test_reopen_scans_doi_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        {
            let mut writer = ExportWriter::open(&path).unwrap();
            writer.record(&doc("A", Some("10.1/X")), &[]).unwrap();
        }

        let writer = ExportWriter::open(&path).unwrap();
        assert!(writer.is_recorded(&doc("A", None)));
        assert!(writer.is_recorded(&doc("OTHER", Some("10.1/x"))));
        assert!(!writer.is_recorded(&doc("B", Some("10.2/y"))));
        assert_eq!(writer.recorded_count(), 1);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "shopping list\n").unwrap();
        assert!(matches!(
            ExportWriter::open(&path),
            Err(ExportError::NotAnExport(_))
        ));
    }
}
