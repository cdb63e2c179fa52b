pub mod events;
pub mod fields;
pub mod project_info;
pub mod text;

use crate::record::FanzineRow;
use fields::{resolve_field, ACTIVITY_KEYS, CITY_KEYS, FANZINE_KEYS, GENRE_KEYS};

/// Single pass: HTML → events → project-info fields → output row.
pub fn process_page(source_file: &str, html: &str, country: &str) -> FanzineRow {
    let page = project_info::parse_page(html);
    let owned = |candidates: &[&str]| resolve_field(&page.fields, candidates).map(str::to_string);

    let activity = owned(ACTIVITY_KEYS);
    let years = activity.as_deref().and_then(fields::year_range);

    FanzineRow {
        source_file: source_file.to_string(),
        fanzine: owned(FANZINE_KEYS),
        city: owned(CITY_KEYS),
        country: country.to_string(),
        genre: owned(GENRE_KEYS),
        year_start: years.map(|(start, _)| start),
        year_end: years.map(|(_, end)| end),
        activity,
        canonical_url: page.canonical_url,
        title: page.title,
        pdf_href: page.pdf_href,
        og_image: page.og_image,
        latitude: None,
        longitude: None,
    }
}
