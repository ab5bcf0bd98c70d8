use citelink_core::{CandidateRecord, CitedEntry, CitingDocument};

/// First two lines of every export file.
pub const HEADER: &str = "FN Clarivate Analytics Web of Science\nVR 1.0\n";

/// Continuation lines of multi-value fields start with three spaces.
const CONTINUATION: &str = "   ";

/// One `CR` entry:
/// `surname[ initial], year, container[, V<volume>][, P<page>][, DOI <doi>|, ISBN <isbn>]`.
///
/// Records without a container use their own title. Empty parts are left out.
pub fn format_cited_reference(record: &CandidateRecord) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(creator) = record.first_creator()
        && let Some(surname) = creator.surname()
    {
        parts.push(match creator.initial() {
            Some(initial) => format!("{} {}", surname, initial),
            None => surname.to_string(),
        });
    }
    if let Some(year) = record.year() {
        parts.push(year.to_string());
    }
    let title = record.title.trim();
    match record.container() {
        Some(container) => parts.push(container.to_string()),
        None if !title.is_empty() => parts.push(title.to_string()),
        None => {}
    }
    if let Some(volume) = record.volume() {
        parts.push(format!("V{}", volume));
    }
    if let Some(page) = record.first_page() {
        parts.push(format!("P{}", page));
    }
    if let Some(doi) = record.doi() {
        parts.push(format!("DOI {}", doi));
    } else if let Some(isbn) = record.isbn() {
        parts.push(format!("ISBN {}", isbn));
    }

    parts.join(", ")
}

fn push_field(out: &mut String, tag: &str, values: &[String]) {
    let mut values = values
        .iter()
        .map(|v| v.replace(['\r', '\n'], " "))
        .filter(|v| !v.trim().is_empty());
    let Some(first) = values.next() else {
        return;
    };
    out.push_str(tag);
    out.push(' ');
    out.push_str(first.trim());
    out.push('\n');
    for value in values {
        out.push_str(CONTINUATION);
        out.push_str(value.trim());
        out.push('\n');
    }
}

fn push_single(out: &mut String, tag: &str, value: Option<&str>) {
    if let Some(value) = value {
        push_field(out, tag, &[value.to_string()]);
    }
}

/// Record block of one citing document, ending with `ER` and a blank line.
pub fn render_record(doc: &CitingDocument, cited: &[CitedEntry]) -> String {
    let mut out = String::from("PT J\n");

    let authors: Vec<String> = doc
        .creators
        .iter()
        .filter(|c| c.creator_type == "author")
        .map(|c| match (c.surname(), c.first_name.as_deref().map(str::trim)) {
            (Some(last), Some(first)) if !first.is_empty() => format!("{}, {}", last, first),
            (Some(last), _) => last.to_string(),
            (None, _) => String::new(),
        })
        .collect();
    push_field(&mut out, "AU", &authors);
    push_single(&mut out, "TI", Some(doc.title.as_str()));
    push_single(&mut out, "SO", doc.publication_title.as_deref());
    let year = doc.year().map(|y| y.to_string());
    push_single(&mut out, "PY", year.as_deref());
    push_single(&mut out, "AB", doc.abstract_note.as_deref());
    push_single(&mut out, "DI", doc.doi());
    push_single(&mut out, "UT", Some(doc.key.as_str()));

    let references: Vec<String> = cited
        .iter()
        .map(|entry| format_cited_reference(&entry.record))
        .collect();
    push_field(&mut out, "CR", &references);
    out.push_str(&format!("NR {}\n", cited.len()));
    out.push_str("ER\n\n");
    out
}
