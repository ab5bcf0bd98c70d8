//! Deutsche Nationalbibliothek catalog over SRU, MARC21-xml records.
//!
//! Extraction works on MARC tags only (020 ISBN, 100/700 persons, 245 title,
//! 264/260 imprint), so field labels in the record never matter.

use quick_xml::Reader;
use quick_xml::events::Event;

use super::{MatchContext, MatchFuture, MatcherScope, ReferenceMatcher, fetch_text, prompt_for};
use crate::matcher_names;
use crate::matching::{AmbiguityPolicy, collapse, filter_candidates};
use crate::model::{CandidateRecord, Creator, ItemType};
use crate::rate_limit::{MatchError, service};
use crate::segmentation::SegmentedReference;
use crate::translation::complete_record;

const MAX_RECORDS: usize = 10;
const TITLE_TERMS: usize = 3;

pub struct Dnb;

impl ReferenceMatcher for Dnb {
    fn name(&self) -> &str {
        matcher_names::DNB
    }

    fn scope(&self) -> MatcherScope {
        MatcherScope::NonJournalOnly
    }

    fn ambiguity_policy(&self) -> AmbiguityPolicy {
        AmbiguityPolicy::First
    }

    fn find<'a>(
        &'a self,
        text: &'a str,
        key: &'a SegmentedReference,
        ctx: MatchContext<'a>,
    ) -> MatchFuture<'a> {
        Box::pin(async move {
            let url = search_url(&ctx.config.dnb_url, key);
            let body = fetch_text(ctx, service::DNB, &url, &[]).await?;
            let records = parse_marc_records(&body)?;
            let candidates: Vec<CandidateRecord> =
                records.iter().filter_map(MarcRecord::to_candidate).collect();
            let candidates = filter_candidates(key, candidates);

            let Some(chosen) = collapse(
                candidates,
                self.ambiguity_policy(),
                ctx.disambiguator,
                &prompt_for(self.name(), text),
            ) else {
                return Ok(None);
            };
            complete_record(ctx, chosen).await.map(Some)
        })
    }
}

/// CQL query over the `per`, `tit` and `jhr` indexes.
pub fn cql_query(key: &SegmentedReference) -> String {
    let mut clauses = Vec::new();
    if let Some(name) = key.last_names.first() {
        clauses.push(format!("per={}", name));
    }
    for word in key.title_words.iter().take(TITLE_TERMS) {
        clauses.push(format!("tit={}", word));
    }
    clauses.push(format!("jhr={}", key.year));
    clauses.join(" and ")
}

pub fn search_url(base: &str, key: &SegmentedReference) -> String {
    format!(
        "{}?version=1.1&operation=searchRetrieve&query={}&recordSchema=MARC21-xml&maximumRecords={}",
        base.trim_end_matches('/'),
        urlencoding::encode(&cql_query(key)),
        MAX_RECORDS
    )
}

/// One MARC data field: tag plus `(code, value)` subfields in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarcField {
    pub tag: String,
    pub subfields: Vec<(char, String)>,
}

impl MarcField {
    pub fn subfield(&self, code: char) -> Option<&str> {
        self.subfields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarcRecord {
    pub fields: Vec<MarcField>,
}

/// Remove ISBD punctuation and DNB's non-sorting markers from a subfield.
fn clean(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\u{98}' | '\u{9c}' | '¬'))
        .collect::<String>()
        .trim()
        .trim_end_matches([' ', '/', ':', ';', ',', '.'])
        .trim()
        .to_string()
}

impl MarcRecord {
    fn fields<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a MarcField> + 'a {
        self.fields.iter().filter(move |f| f.tag == tag)
    }

    fn first(&self, tags: &[&str], code: char) -> Option<String> {
        tags.iter()
            .flat_map(|tag| self.fields(tag))
            .find_map(|f| f.subfield(code))
            .map(clean)
            .filter(|v| !v.is_empty())
    }

    /// ISBN from 020$a (or the hyphenated 020$9), qualifiers dropped.
    pub fn isbn(&self) -> Option<String> {
        self.fields("020")
            .find_map(|f| f.subfield('a').or_else(|| f.subfield('9')))
            .and_then(|v| v.split_whitespace().next())
            .map(str::to_string)
    }

    pub fn title(&self) -> Option<String> {
        let field = self.fields("245").next()?;
        let main = clean(field.subfield('a')?);
        match field.subfield('b').map(clean).filter(|s| !s.is_empty()) {
            Some(sub) => Some(format!("{}: {}", main, sub)),
            None => Some(main),
        }
    }

    pub fn year(&self) -> Option<String> {
        self.fields("264")
            .chain(self.fields("260"))
            .filter_map(|f| f.subfield('c'))
            .find_map(|c| {
                let digits: String = c.chars().filter(char::is_ascii_digit).take(4).collect();
                (digits.len() == 4).then_some(digits)
            })
    }

    pub fn creators(&self) -> Vec<Creator> {
        self.fields("100")
            .chain(self.fields("700"))
            .filter_map(|f| {
                let name = clean(f.subfield('a')?);
                let creator = match name.split_once(", ") {
                    Some((last, first)) => Creator::person(last, first),
                    None => Creator::single(name),
                };
                let is_editor = f
                    .subfields
                    .iter()
                    .any(|(c, v)| *c == '4' && v == "edt");
                Some(if is_editor { creator.editor() } else { creator })
            })
            .collect()
    }

    pub fn to_candidate(&self) -> Option<CandidateRecord> {
        Some(CandidateRecord {
            item_type: ItemType::Book,
            title: self.title()?,
            creators: self.creators(),
            date: self.year().unwrap_or_default(),
            publisher: self.first(&["264", "260"], 'b'),
            place: self.first(&["264", "260"], 'a'),
            isbn: self.isbn(),
            ..Default::default()
        })
    }
}

/// Parse an SRU `searchRetrieveResponse` with MARC21-xml record data.
///
/// SRU diagnostics (bad query, unsupported index) come back as
/// [`MatchError::Malformed`].
pub fn parse_marc_records(xml: &str) -> Result<Vec<MarcRecord>, MatchError> {
    let mut reader = Reader::from_str(xml);
    let mut records = Vec::new();

    let mut current: Option<MarcRecord> = None;
    let mut field: Option<MarcField> = None;
    let mut subfield_code: Option<char> = None;
    let mut text = String::new();
    let mut in_diagnostic_message = false;
    let mut diagnostic: Option<String> = None;
    let mut saw_response = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"searchRetrieveResponse" => saw_response = true,
                b"recordData" => current = Some(MarcRecord::default()),
                b"datafield" if current.is_some() => {
                    let tag = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"tag")
                        .map(|a| String::from_utf8_lossy(&a.value).to_string())
                        .unwrap_or_default();
                    field = Some(MarcField {
                        tag,
                        subfields: Vec::new(),
                    });
                }
                b"subfield" if field.is_some() => {
                    subfield_code = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"code")
                        .and_then(|a| a.value.first().map(|b| *b as char));
                    text.clear();
                }
                b"message" => {
                    in_diagnostic_message = true;
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                if subfield_code.is_some() || in_diagnostic_message {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"subfield" => {
                    if let (Some(code), Some(f)) = (subfield_code.take(), field.as_mut()) {
                        f.subfields.push((code, text.trim().to_string()));
                    }
                }
                b"datafield" => {
                    if let (Some(f), Some(rec)) = (field.take(), current.as_mut()) {
                        rec.fields.push(f);
                    }
                }
                b"recordData" => {
                    if let Some(rec) = current.take() {
                        records.push(rec);
                    }
                }
                b"message" => {
                    in_diagnostic_message = false;
                    diagnostic = Some(text.trim().to_string());
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(MatchError::malformed(format!("DNB XML parse error: {}", e), xml));
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(message) = diagnostic {
        return Err(MatchError::malformed(format!("SRU diagnostic: {}", message), xml));
    }
    if !saw_response {
        return Err(MatchError::malformed("not an SRU response", xml));
    }
    Ok(records)
}
