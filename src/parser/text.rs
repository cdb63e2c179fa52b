use std::borrow::Cow;

use quick_xml::escape::{resolve_html5_entity, unescape_with};

/// Longest entity name we try to resolve; anything longer is literal text.
const MAX_ENTITY_LEN: usize = 32;

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Canonical form of a heading label: "Città :" → "CITTÀ", "Attività’" → "ATTIVITA'".
pub fn normalize_key(text: &str) -> String {
    let collapsed: String = collapse_whitespace(text)
        .chars()
        .map(|c| match c {
            '\u{2019}' | '\u{2018}' | '\u{02BC}' | '\u{00B4}' | '`' | '\u{2032}' => '\'',
            c => c,
        })
        .collect();
    collapsed
        .trim_matches(|c: char| c == ':' || c.is_whitespace())
        .to_uppercase()
}

/// Decode HTML entities and character references.
///
/// Real pages are full of bare ampersands ("Tom & Jerry") and typos, so an
/// unresolvable reference is kept verbatim rather than rejected.
pub fn decode_entities(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }
    if let Ok(decoded) = unescape_with(raw, resolve_html5_entity) {
        return decoded;
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let reference = tail[1..]
            .find(';')
            .filter(|&end| end > 0 && end <= MAX_ENTITY_LEN)
            .map(|end| &tail[..end + 2])
            .filter(|r| !r[1..].contains(|c: char| c.is_whitespace() || c == '&'));

        match reference.and_then(|r| unescape_with(r, resolve_html5_entity).ok().map(|d| (r, d))) {
            Some((reference, decoded)) => {
                out.push_str(&decoded);
                rest = &tail[reference.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}
