//! Legacy tagged-field export of citing documents and their resolved
//! references, in the two-letter-tag layout of Web of Science plain text
//! exports.

mod format;
mod writer;

pub use format::{HEADER, format_cited_reference, render_record};
pub use writer::ExportWriter;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not an export file: {0}")]
    NotAnExport(String),
}
