//! Bibliographic records and pipeline inputs.
//!
//! [`CandidateRecord`] serializes to the library's item JSON shape, so a
//! record coming out of a matcher can be written to the library (merged over
//! the item template for its type) without a separate conversion layer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Item types the pipeline distinguishes. Everything else is `document`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    JournalArticle,
    Book,
    BookSection,
    #[default]
    #[serde(rename = "document", other)]
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::JournalArticle => "journalArticle",
            ItemType::Book => "book",
            ItemType::BookSection => "bookSection",
            ItemType::Other => "document",
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_creator_type() -> String {
    "author".to_string()
}

/// A creator entry: either a two-field person or a single-field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    #[serde(default = "default_creator_type")]
    pub creator_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Creator {
    pub fn person(last_name: impl Into<String>, first_name: impl Into<String>) -> Self {
        Self {
            creator_type: default_creator_type(),
            last_name: Some(last_name.into()),
            first_name: Some(first_name.into()),
            name: None,
        }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self {
            creator_type: default_creator_type(),
            last_name: None,
            first_name: None,
            name: Some(name.into()),
        }
    }

    pub fn editor(mut self) -> Self {
        self.creator_type = "editor".to_string();
        self
    }

    /// Surname, or the whole name for single-field creators.
    pub fn surname(&self) -> Option<&str> {
        self.last_name
            .as_deref()
            .or(self.name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// First letter of the given name, if any.
    pub fn initial(&self) -> Option<char> {
        self.first_name
            .as_deref()
            .and_then(|f| f.trim().chars().find(|c| c.is_alphabetic()))
            .map(|c| c.to_uppercase().next().unwrap_or(c))
    }

    /// "Last First" or the single name.
    pub fn display_name(&self) -> String {
        match (&self.last_name, &self.first_name) {
            (Some(last), Some(first)) if !first.trim().is_empty() => {
                format!("{} {}", last.trim(), first.trim())
            }
            (Some(last), _) => last.trim().to_string(),
            _ => self.name.clone().unwrap_or_default(),
        }
    }
}

/// A normalized bibliographic record, in the library's item JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creators: Vec<Creator>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "DOI", default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(rename = "ISBN", default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    /// Library key. Present only when the record already exists in the
    /// primary library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Fields the pipeline does not interpret, passed through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").unwrap());

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl CandidateRecord {
    /// Publication year: the first four-digit run in `date`.
    pub fn year(&self) -> Option<i32> {
        YEAR_RE
            .find(&self.date)
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn doi(&self) -> Option<&str> {
        non_empty(&self.doi)
    }

    pub fn isbn(&self) -> Option<&str> {
        non_empty(&self.isbn)
    }

    pub fn volume(&self) -> Option<&str> {
        non_empty(&self.volume)
    }

    /// Journal or book title the record appeared in.
    pub fn container(&self) -> Option<&str> {
        non_empty(&self.publication_title).or_else(|| non_empty(&self.book_title))
    }

    /// First page of the `pages` range.
    pub fn first_page(&self) -> Option<&str> {
        non_empty(&self.pages)
            .and_then(|p| p.split(['-', '–', '—']).next())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// The authoritative identifier; DOI wins over ISBN.
    pub fn identifier(&self) -> Option<Identifier> {
        self.doi()
            .map(|d| Identifier::Doi(d.to_string()))
            .or_else(|| self.isbn().map(|i| Identifier::Isbn(i.to_string())))
    }

    /// All creator names joined, for substring checks.
    pub fn authors_text(&self) -> String {
        self.creators
            .iter()
            .map(Creator::display_name)
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn first_creator(&self) -> Option<&Creator> {
        self.creators.iter().find(|c| c.surname().is_some())
    }

    /// Short human-readable label used in disambiguation prompts.
    pub fn label(&self) -> String {
        let author = self
            .first_creator()
            .and_then(Creator::surname)
            .unwrap_or("[anon]");
        let year = self
            .year()
            .map(|y| y.to_string())
            .unwrap_or_else(|| "n.d.".to_string());
        match self.container() {
            Some(container) => format!("{} ({}) {}. {}", author, year, self.title, container),
            None => format!("{} ({}) {}", author, year, self.title),
        }
    }

    /// Serialize into item JSON.
    pub fn to_item_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// An authoritative identifier attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Doi(String),
    Isbn(String),
}

impl Identifier {
    /// Namespaced cache key (`doi:` / `isbn:`), lowercased.
    pub fn cache_key(&self) -> String {
        match self {
            Identifier::Doi(doi) => format!("doi:{}", doi.trim().to_lowercase()),
            Identifier::Isbn(isbn) => format!("isbn:{}", normalize_isbn(isbn)),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identifier::Doi(v) | Identifier::Isbn(v) => v,
        }
    }
}

/// Strip hyphens and spaces from an ISBN.
pub fn normalize_isbn(isbn: &str) -> String {
    isbn.chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// A labelled choice offered when several candidates survive filtering.
/// `value: None` is the explicit "no match" option.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchChoice {
    pub label: String,
    pub value: Option<CandidateRecord>,
}

impl MatchChoice {
    pub fn candidate(record: CandidateRecord) -> Self {
        Self {
            label: record.label(),
            value: Some(record),
        }
    }

    pub fn no_match() -> Self {
        Self {
            label: "None of the above".to_string(),
            value: None,
        }
    }
}

/// Directed citation edge, stored on the citing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CitationRelation {
    pub citing_key: String,
    pub cited_key: String,
}

impl CitationRelation {
    pub const PREDICATE: &'static str = "cito:cites";

    pub fn new(citing_key: impl Into<String>, cited_key: impl Into<String>) -> Self {
        Self {
            citing_key: citing_key.into(),
            cited_key: cited_key.into(),
        }
    }

    /// Object URI of the edge, e.g. `http://zotero.org/groups/1/items/ABC123`.
    pub fn object_uri(&self, library_uri: &str) -> String {
        format!("{}/items/{}", library_uri.trim_end_matches('/'), self.cited_key)
    }
}

/// One candidate value from the reference segmenter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub value: String,
    #[serde(default)]
    pub score: f64,
}

impl Scored {
    pub fn new(value: impl Into<String>, score: f64) -> Self {
        Self {
            value: value.into(),
            score,
        }
    }
}

/// A person found inside an author or editor fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPerson {
    #[serde(default)]
    pub surname: Vec<Scored>,
    #[serde(default, rename = "given-names")]
    pub given_names: Vec<Scored>,
}

impl RawPerson {
    pub fn new(surname: &str, given_names: &str) -> Self {
        Self {
            surname: vec![Scored::new(surname, 0.0)],
            given_names: if given_names.is_empty() {
                Vec::new()
            } else {
                vec![Scored::new(given_names, 0.0)]
            },
        }
    }

    pub fn surname(&self) -> Option<&str> {
        self.surname.first().map(|s| s.value.as_str())
    }

    pub fn given_names(&self) -> Option<&str> {
        self.given_names.first().map(|s| s.value.as_str())
    }
}

/// Probabilistic segmentation of one reference string.
///
/// `author` and `editor` hold fragments; each fragment lists the persons it
/// contains, the first being the fragment's primary person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSegmentation {
    pub author: Vec<Vec<RawPerson>>,
    pub editor: Vec<Vec<RawPerson>>,
    pub title: Vec<Scored>,
    pub year: Vec<Scored>,
    pub source: Vec<Scored>,
    pub volume: Vec<Scored>,
    pub issue: Vec<Scored>,
    pub fpage: Vec<Scored>,
    pub lpage: Vec<Scored>,
    pub publisher: Vec<Scored>,
    pub location: Vec<Scored>,
}

impl RawSegmentation {
    fn first(list: &[Scored]) -> Option<&str> {
        list.first()
            .map(|s| s.value.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn source(&self) -> Option<&str> {
        Self::first(&self.source)
    }

    pub fn volume(&self) -> Option<&str> {
        Self::first(&self.volume)
    }

    pub fn issue(&self) -> Option<&str> {
        Self::first(&self.issue)
    }

    pub fn fpage(&self) -> Option<&str> {
        Self::first(&self.fpage)
    }

    pub fn lpage(&self) -> Option<&str> {
        Self::first(&self.lpage)
    }

    pub fn publisher(&self) -> Option<&str> {
        Self::first(&self.publisher)
    }

    pub fn location(&self) -> Option<&str> {
        Self::first(&self.location)
    }

    pub fn has_editor(&self) -> bool {
        self.editor.iter().any(|group| !group.is_empty())
    }
}

/// One entry of a citing document's reference list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInput {
    pub text: String,
    #[serde(default)]
    pub segmentation: RawSegmentation,
}

/// A document whose reference list is being resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitingDocument {
    /// Library key of the citing record.
    pub key: String,
    #[serde(default, alias = "DOI")]
    pub doi: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub creators: Vec<Creator>,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub publication_title: Option<String>,
    #[serde(default)]
    pub abstract_note: Option<String>,
    #[serde(default)]
    pub references: Vec<ReferenceInput>,
}

impl CitingDocument {
    pub fn doi(&self) -> Option<&str> {
        non_empty(&self.doi)
    }

    pub fn year(&self) -> Option<i32> {
        YEAR_RE
            .find(&self.date)
            .and_then(|m| m.as_str().parse().ok())
    }
}
