use once_cell::sync::Lazy;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Common surname prefixes (case-insensitive).
static SURNAME_PREFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "van", "von", "de", "del", "della", "der", "den", "di", "da", "du", "al", "el", "la",
        "le", "ben", "ibn", "ter", "zu",
    ]
    .into_iter()
    .collect()
});

/// Name suffixes to strip.
static NAME_SUFFIXES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["jr", "sr", "ii", "iii", "iv"].into_iter().collect());

/// A personal name split into surname and given-name initials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Surname as written (prefixes kept, suffixes dropped).
    pub surname: String,
    /// Given names as written, possibly empty.
    pub given: String,
    /// Uppercase initials of the given names, in order.
    pub initials: Vec<char>,
}

impl ParsedName {
    /// "Surname, G." style rendering.
    pub fn inverted(&self) -> String {
        if self.given.is_empty() {
            self.surname.clone()
        } else {
            format!("{}, {}", self.surname, self.given)
        }
    }
}

/// Lowercase, strip diacritics and anything that isn't a letter or space.
pub fn fold(s: &str) -> String {
    let decomposed: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    decomposed
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

/// Initials of a given-name string: "Hans-Peter" → H P, "J. R. R." → J R R.
pub fn initials(given: &str) -> Vec<char> {
    given
        .split(|c: char| c.is_whitespace() || c == '.' || c == '-')
        .filter_map(|part| part.chars().find(|c| c.is_alphabetic()))
        .map(|c| c.to_uppercase().next().unwrap_or(c))
        .collect()
}

fn is_suffix(part: &str) -> bool {
    NAME_SUFFIXES.contains(part.to_lowercase().trim_end_matches(['.', ',']))
}

fn is_prefix(part: &str) -> bool {
    SURNAME_PREFIXES.contains(part.to_lowercase().trim_end_matches('.'))
}

/// Split `parts` into (given, surname), handling multi-word surnames like
/// "De La Cruz" and "Van Bavel".
fn split_surname(parts: &[&str]) -> (String, String) {
    let mut parts = parts.to_vec();
    while parts.len() >= 2 && parts.last().is_some_and(|p| is_suffix(p)) {
        parts.pop();
    }
    if parts.is_empty() {
        return (String::new(), String::new());
    }

    let mut start = parts.len() - 1;
    while start > 0 && is_prefix(parts[start - 1]) {
        start -= 1;
    }
    (parts[..start].join(" "), parts[start..].join(" "))
}

/// Parse a personal name in "Surname, Given", "Given Surname" or
/// "Surname GI" (trailing uppercase initials) form.
pub fn parse_name(name: &str) -> ParsedName {
    let name = name.trim();

    if let Some((surname, given)) = name.split_once(',') {
        let given = given
            .split_whitespace()
            .filter(|p| !is_suffix(p))
            .collect::<Vec<_>>()
            .join(" ");
        return ParsedName {
            surname: surname.trim().to_string(),
            initials: initials(&given),
            given,
        };
    }

    let parts: Vec<&str> = name.split_whitespace().collect();
    if parts.is_empty() {
        return ParsedName {
            surname: String::new(),
            given: String::new(),
            initials: Vec::new(),
        };
    }

    // "Abrahao S" / "Smith JR": last part is 1-2 uppercase letters
    if parts.len() >= 2 {
        let last = parts[parts.len() - 1];
        if last.chars().count() <= 2
            && last.chars().all(|c| c.is_uppercase())
            && !is_suffix(last)
        {
            return ParsedName {
                surname: parts[..parts.len() - 1].join(" "),
                given: last.to_string(),
                initials: last.chars().collect(),
            };
        }
    }

    let (given, surname) = split_surname(&parts);
    ParsedName {
        surname,
        initials: initials(&given),
        given,
    }
}

/// Whether two names can refer to the same person.
///
/// Surnames must agree after folding. If both names carry initials, the
/// first initials must agree and the shorter initial list must be a prefix
/// of the longer one.
pub fn names_compatible(a: &str, b: &str) -> bool {
    let pa = parse_name(a);
    let pb = parse_name(b);

    let sa = fold(&pa.surname);
    let sb = fold(&pb.surname);
    if sa.is_empty() || sa != sb {
        return false;
    }

    if pa.initials.is_empty() || pb.initials.is_empty() {
        return true;
    }
    let n = pa.initials.len().min(pb.initials.len());
    pa.initials[..n] == pb.initials[..n]
}
