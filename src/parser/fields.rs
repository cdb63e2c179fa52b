use std::sync::LazyLock;

use regex::Regex;

use super::project_info::FieldMap;
use super::text::collapse_whitespace;

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[89][0-9]{2}|20[0-9]{2})\b").unwrap());
static QUESTION_MARKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\?+$").unwrap());

// Heading spellings seen across the archive, most specific first.
pub const FANZINE_KEYS: &[&str] = &["FANZINE", "RIVISTA"];
pub const CITY_KEYS: &[&str] = &["CITTA'", "CITTÀ", "CITTA"];
pub const ACTIVITY_KEYS: &[&str] = &["ATTIVITA'", "ATTIVITÀ", "ATTIVITA"];
pub const GENRE_KEYS: &[&str] = &["GENERE"];

/// Place values that mean "we don't know where".
const UNKNOWN_PLACES: &[&str] = &[
    "N/A",
    "NA",
    "N.D.",
    "ND",
    "UNKNOWN",
    "SCONOSCIUTO",
    "SCONOSCIUTA",
];

/// First candidate key with a non-empty value, in the given priority order.
pub fn resolve_field<'a>(fields: &'a FieldMap, candidates: &[&str]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|key| fields.get(*key))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

/// Earliest and latest plausible year (1800–2099) mentioned in `text`.
pub fn year_range(text: &str) -> Option<(i32, i32)> {
    let years: Vec<i32> = YEAR_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    let min = years.iter().copied().min()?;
    let max = years.iter().copied().max()?;
    Some((min, max))
}

pub fn is_unknown_place(text: &str) -> bool {
    let cleaned = collapse_whitespace(text);
    if cleaned.is_empty() || QUESTION_MARKS_RE.is_match(&cleaned) {
        return true;
    }
    let upper = cleaned.to_uppercase();
    UNKNOWN_PLACES.contains(&upper.as_str())
}
