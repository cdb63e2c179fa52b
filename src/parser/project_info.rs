use std::collections::HashMap;

use super::events::{tokenize, HtmlEvent};
use super::text::{collapse_whitespace, normalize_key};

const CONTAINER_TAG: &str = "div";
const CONTAINER_CLASS: &str = "project-info";
const HEADING_TAG: &str = "h4";
const VALUE_TAG: &str = "p";

/// Normalized heading → paragraph text for one document.
pub type FieldMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: String,
}

/// Where the scanner is relative to the project-info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Outside,
    /// Inside the container, between headings and values.
    Idle,
    Heading,
    Paragraph,
}

#[derive(Debug, Clone)]
struct PendingKey {
    key: String,
    filled: bool,
}

/// Heading/paragraph state machine for the `div.project-info` block.
#[derive(Debug, Default)]
pub struct ProjectInfoMachine {
    region: Region,
    depth: usize,
    buffer: String,
    pending: Option<PendingKey>,
}

impl ProjectInfoMachine {
    #[cfg(test)]
    pub fn region(&self) -> Region {
        self.region
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[cfg(test)]
    pub fn pending_key(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.key.as_str())
    }

    /// Apply one event; returns a field when a value gets committed.
    pub fn step(&mut self, event: &HtmlEvent) -> Option<Field> {
        match event {
            HtmlEvent::Start { name, .. } if name == CONTAINER_TAG => {
                if self.depth > 0 {
                    self.depth += 1;
                } else if has_class(event, CONTAINER_CLASS) {
                    self.depth = 1;
                    self.region = Region::Idle;
                    self.pending = None;
                }
                None
            }
            HtmlEvent::Start { name, .. } if name == HEADING_TAG && self.depth > 0 => {
                let committed = self.commit_paragraph();
                self.buffer.clear();
                self.region = Region::Heading;
                committed
            }
            HtmlEvent::Start { name, .. } if name == VALUE_TAG && self.depth > 0 => {
                if self.pending.as_ref().is_some_and(|p| !p.filled) {
                    self.buffer.clear();
                    self.region = Region::Paragraph;
                }
                None
            }
            HtmlEvent::Text(text) => {
                if matches!(self.region, Region::Heading | Region::Paragraph) {
                    self.buffer.push_str(text);
                }
                None
            }
            HtmlEvent::End { name } if name == HEADING_TAG && self.region == Region::Heading => {
                let key = normalize_key(&self.buffer);
                self.buffer.clear();
                if !key.is_empty() {
                    self.pending = Some(PendingKey { key, filled: false });
                }
                self.region = Region::Idle;
                None
            }
            HtmlEvent::End { name } if name == VALUE_TAG && self.region == Region::Paragraph => {
                self.commit_paragraph()
            }
            HtmlEvent::End { name } if name == CONTAINER_TAG && self.depth > 0 => {
                self.depth -= 1;
                if self.depth > 0 {
                    return None;
                }
                let committed = self.commit_paragraph();
                self.region = Region::Outside;
                self.pending = None;
                self.buffer.clear();
                committed
            }
            _ => None,
        }
    }

    fn commit_paragraph(&mut self) -> Option<Field> {
        if self.region != Region::Paragraph {
            return None;
        }
        self.region = Region::Idle;
        let value = collapse_whitespace(&std::mem::take(&mut self.buffer));
        let pending = self.pending.as_mut()?;
        if value.is_empty() || pending.filled {
            return None;
        }
        pending.filled = true;
        Some(Field {
            key: pending.key.clone(),
            value,
        })
    }
}

/// Document-level singletons that live outside the project-info block.
#[derive(Debug, Default)]
pub struct PageMeta {
    pub canonical_url: Option<String>,
    pub og_image: Option<String>,
    pub title: Option<String>,
    pub pdf_href: Option<String>,
    title_buffer: Option<String>,
}

impl PageMeta {
    pub fn step(&mut self, event: &HtmlEvent) {
        match event {
            HtmlEvent::Start { name, .. } => match name.as_str() {
                "link" if self.canonical_url.is_none() => {
                    let canonical = event.attr("rel").is_some_and(|rel| {
                        rel.split_whitespace()
                            .any(|t| t.eq_ignore_ascii_case("canonical"))
                    });
                    if canonical {
                        self.canonical_url = non_empty_attr(event, "href");
                    }
                }
                "meta" if self.og_image.is_none() => {
                    let og_image = event
                        .attr("property")
                        .is_some_and(|p| p.trim().eq_ignore_ascii_case("og:image"));
                    if og_image {
                        self.og_image = non_empty_attr(event, "content");
                    }
                }
                "title" => self.title_buffer = Some(String::new()),
                "a" if self.pdf_href.is_none() => {
                    self.pdf_href = non_empty_attr(event, "href").filter(|href| is_pdf_link(href));
                }
                _ => {}
            },
            HtmlEvent::Text(text) => {
                if let Some(buffer) = self.title_buffer.as_mut() {
                    buffer.push_str(text);
                }
            }
            HtmlEvent::End { name } if name == "title" => {
                if let Some(buffer) = self.title_buffer.take() {
                    let title = collapse_whitespace(&buffer);
                    if !title.is_empty() {
                        self.title = Some(title);
                    }
                }
            }
            HtmlEvent::End { .. } => {}
        }
    }
}

/// Everything extracted from a single HTML document.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub fields: FieldMap,
    pub canonical_url: Option<String>,
    pub og_image: Option<String>,
    pub title: Option<String>,
    pub pdf_href: Option<String>,
}

/// Fold an event stream into a [`ParsedPage`]. Consumes the whole stream.
pub fn collect_page<I>(events: I) -> ParsedPage
where
    I: IntoIterator<Item = HtmlEvent>,
{
    let mut machine = ProjectInfoMachine::default();
    let mut meta = PageMeta::default();
    let mut fields = FieldMap::new();

    for event in events {
        if let Some(field) = machine.step(&event) {
            fields.insert(field.key, field.value);
        }
        meta.step(&event);
    }

    ParsedPage {
        fields,
        canonical_url: meta.canonical_url,
        og_image: meta.og_image,
        title: meta.title,
        pdf_href: meta.pdf_href,
    }
}

pub fn parse_page(html: &str) -> ParsedPage {
    collect_page(tokenize(html))
}

fn has_class(event: &HtmlEvent, class: &str) -> bool {
    event
        .attr("class")
        .is_some_and(|c| c.split_whitespace().any(|t| t == class))
}

fn non_empty_attr(event: &HtmlEvent, key: &str) -> Option<String> {
    event
        .attr(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_pdf_link(href: &str) -> bool {
    let href = href.as_bytes();
    href.len() >= 4 && href[href.len() - 4..].eq_ignore_ascii_case(b".pdf")
}
