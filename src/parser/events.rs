use std::collections::VecDeque;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::text::decode_entities;

/// Elements whose content is raw text, never markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlEvent {
    /// Opening tag. `name` and attribute keys are ASCII-lowercased,
    /// attribute values are entity-decoded.
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    /// Entity-decoded character data.
    Text(String),
}

impl HtmlEvent {
    pub fn attr(&self, key: &str) -> Option<&str> {
        match self {
            HtmlEvent::Start { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn is_start(&self, tag: &str) -> bool {
        matches!(self, HtmlEvent::Start { name, .. } if name == tag)
    }

    #[cfg(test)]
    pub fn is_end(&self, tag: &str) -> bool {
        matches!(self, HtmlEvent::End { name } if name == tag)
    }
}

/// Lenient tokenizer over an HTML document, driven by quick-xml.
///
/// The iterator is finite and never fails. Markup quick-xml rejects is
/// skipped up to its closing `>` and scanning resumes after it, so the
/// rest of the document is always read.
pub struct HtmlEvents<'a> {
    html: &'a str,
    reader: Reader<&'a [u8]>,
    /// Byte offset of the reader's input within `html`.
    base: usize,
    queued: VecDeque<HtmlEvent>,
    done: bool,
}

pub fn tokenize(html: &str) -> HtmlEvents<'_> {
    HtmlEvents {
        html,
        reader: lenient_reader(html),
        base: 0,
        queued: VecDeque::new(),
        done: false,
    }
}

fn lenient_reader(input: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(input);
    let config = reader.config_mut();
    config.trim_text(false);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    config.check_comments = false;
    config.expand_empty_elements = false;
    reader
}

/// `<` opens markup only before a tag name, `/`, `!` or `?`; anything else
/// is literal text, as browsers read it.
fn opens_markup(next: Option<u8>) -> bool {
    next.is_some_and(|b| b.is_ascii_alphabetic() || matches!(b, b'/' | b'!' | b'?'))
}

impl<'a> HtmlEvents<'a> {
    fn byte_position(&self) -> usize {
        self.base + self.reader.buffer_position() as usize
    }

    /// Continue scanning from byte `at` of the document with a fresh reader.
    fn restart_at(&mut self, at: usize) {
        self.base = at;
        self.reader = lenient_reader(&self.html[at..]);
    }

    /// Jump over raw element content: restart the reader at the matching
    /// closing tag, or at end of input when there is none.
    fn skip_raw_text(&mut self, name: &str) {
        let from = self.byte_position();
        let closing = format!("</{}", name);
        let found = self.html.as_bytes()[from..]
            .windows(closing.len())
            .position(|w| w.eq_ignore_ascii_case(closing.as_bytes()));
        let resume = match found {
            Some(offset) => from + offset,
            None => {
                debug!("unterminated <{}> at byte {}", name, from);
                self.queued.push_back(HtmlEvent::End {
                    name: name.to_string(),
                });
                self.html.len()
            }
        };
        self.restart_at(resume);
    }

    /// Drop the construct starting at byte `at` through its closing `>`.
    fn skip_bad_markup(&mut self, at: usize) {
        let resume = match self.html.as_bytes()[at..].iter().position(|&b| b == b'>') {
            Some(offset) => at + offset + 1,
            None => self.html.len(),
        };
        debug!("skipping malformed markup at bytes {}..{}", at, resume);
        self.restart_at(resume);
    }

    fn start_event(e: &BytesStart<'_>) -> HtmlEvent {
        let name = lower_name(e.name().as_ref());
        let attrs = e
            .html_attributes()
            .filter_map(|attr| attr.ok())
            .map(|attr| {
                let key = lower_name(attr.key.as_ref());
                let raw = String::from_utf8_lossy(&attr.value);
                (key, decode_entities(&raw).into_owned())
            })
            .collect();
        HtmlEvent::Start { name, attrs }
    }

    /// Pull the next token out of the reader, queueing any follow-up events.
    /// Returns false once the input is exhausted.
    fn advance(&mut self) -> bool {
        let at = self.byte_position();
        let bytes = self.html.as_bytes();
        if bytes.get(at) == Some(&b'<') && !opens_markup(bytes.get(at + 1).copied()) {
            self.queued.push_back(HtmlEvent::Text("<".to_string()));
            self.restart_at(at + 1);
            return true;
        }

        match self.reader.read_event() {
            Ok(Event::Start(e)) => {
                let start = Self::start_event(&e);
                let raw_text = RAW_TEXT_ELEMENTS
                    .iter()
                    .find(|tag| start.is_start(tag));
                self.queued.push_back(start);
                if let Some(tag) = raw_text {
                    self.skip_raw_text(tag);
                }
            }
            Ok(Event::Empty(e)) => {
                let start = Self::start_event(&e);
                let name = lower_name(e.name().as_ref());
                self.queued.push_back(start);
                self.queued.push_back(HtmlEvent::End { name });
            }
            Ok(Event::End(e)) => {
                self.queued.push_back(HtmlEvent::End {
                    name: lower_name(e.name().as_ref()),
                });
            }
            Ok(Event::Text(e)) => {
                let raw = String::from_utf8_lossy(&e);
                self.queued
                    .push_back(HtmlEvent::Text(decode_entities(&raw).into_owned()));
            }
            Ok(Event::CData(e)) => {
                self.queued
                    .push_back(HtmlEvent::Text(String::from_utf8_lossy(&e).into_owned()));
            }
            Ok(Event::Eof) => return false,
            // Comments, doctype, processing instructions, declarations
            Ok(_) => {}
            Err(err) => {
                // The reader doesn't move past a syntax error on its own.
                let error_at = (self.base + self.reader.error_position() as usize)
                    .max(at)
                    .min(self.html.len());
                debug!("tokenizer error at byte {}: {}", error_at, err);
                self.skip_bad_markup(error_at);
            }
        }
        true
    }
}

impl Iterator for HtmlEvents<'_> {
    type Item = HtmlEvent;

    fn next(&mut self) -> Option<HtmlEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if self.done {
                return None;
            }
            if !self.advance() {
                self.done = true;
            }
        }
    }
}

fn lower_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}
