use std::collections::HashSet;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{
    ImportWarning, OutlineEntry, ParseError, ParsedDocument, WarningReason, MAX_OPML_DEPTH,
};
use crate::codec::FeedUrl;
use crate::util::validate_url;

/// Reads and parses an OPML file.
pub async fn parse_file(path: &Path) -> Result<ParsedDocument, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_document(&content)
}

/// Parses an OPML document into feed entries and per-entry warnings.
///
/// Every `<outline>` with an `xmlUrl` is an entry. Outlines without one are
/// folders when they contain outlines (and are traversed) and produce a
/// [`WarningReason::MissingFeedUrl`] warning when they do not. A URL that
/// fails validation produces [`WarningReason::InvalidFeedUrl`]. Entries whose
/// canonical URL was already seen are dropped.
///
/// # Errors
///
/// [`ParseError`] when the XML is malformed, the root is not `<opml>`, the
/// document is truncated, or outlines nest deeper than [`MAX_OPML_DEPTH`].
pub fn parse_document(content: &str) -> Result<ParsedDocument, ParseError> {
    // quick-xml (0.37) never parses <!ENTITY> declarations from DOCTYPE; only
    // the five XML builtins are resolved by `decode_and_unescape_value()`.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut document = ParsedDocument::default();
    let mut seen: HashSet<FeedUrl> = HashSet::new();

    let mut buf = Vec::new();
    // Names of currently open elements
    let mut open: Vec<String> = Vec::new();
    // One frame per open <outline>
    let mut outlines: Vec<OpenOutline> = Vec::new();
    let mut outline_count: usize = 0;
    let mut saw_root = false;
    let mut in_head_title = false;

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf).map_err(|e| ParseError::Xml {
            position: reader.buffer_position(),
            message: e.to_string(),
        })?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();

                if !saw_root {
                    if name != "opml" {
                        return Err(ParseError::MissingRoot);
                    }
                    saw_root = true;
                }

                if name == "outline" {
                    if let Some(parent) = outlines.last_mut() {
                        parent.has_children = true;
                    }
                    let index = outline_count;
                    outline_count += 1;
                    let attrs = read_attributes(e, &reader)?;

                    if is_empty {
                        finish_outline(index, attrs, false, &mut document, &mut seen);
                    } else {
                        if outlines.len() >= MAX_OPML_DEPTH {
                            return Err(ParseError::MaxDepthExceeded(MAX_OPML_DEPTH));
                        }
                        outlines.push(OpenOutline {
                            index,
                            attrs,
                            has_children: false,
                        });
                    }
                } else if name == "title" && open.last().map(String::as_str) == Some("head") {
                    in_head_title = !is_empty;
                }

                if !is_empty {
                    open.push(name);
                }
            }
            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                open.pop();
                if name == "outline" {
                    if let Some(frame) = outlines.pop() {
                        finish_outline(
                            frame.index,
                            frame.attrs,
                            frame.has_children,
                            &mut document,
                            &mut seen,
                        );
                    }
                } else if name == "title" {
                    in_head_title = false;
                }
            }
            Event::Text(ref t) if in_head_title => {
                let text = t.unescape().map_err(|e| ParseError::Xml {
                    position: reader.buffer_position(),
                    message: e.to_string(),
                })?;
                let text = text.trim();
                if !text.is_empty() {
                    document.title = Some(text.to_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ParseError::MissingRoot);
    }
    if let Some(unclosed) = open.pop() {
        return Err(ParseError::Truncated(unclosed));
    }

    tracing::debug!(
        entries = document.entries.len(),
        warnings = document.warnings.len(),
        "OPML document parsed"
    );
    Ok(document)
}

struct OpenOutline {
    index: usize,
    attrs: OutlineAttributes,
    has_children: bool,
}

#[derive(Default)]
struct OutlineAttributes {
    xml_url: Option<String>,
    html_url: Option<String>,
    title: Option<String>,
    text: Option<String>,
    extra: Vec<(String, String)>,
}

impl OutlineAttributes {
    fn display_title(&self) -> Option<String> {
        self.title
            .clone()
            .or_else(|| self.text.clone())
            .filter(|t| !t.trim().is_empty())
    }
}

fn read_attributes(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<OutlineAttributes, ParseError> {
    let mut attrs = OutlineAttributes::default();
    let decoder = reader.decoder();

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| ParseError::Xml {
                position: reader.buffer_position(),
                message: e.to_string(),
            })?
            .into_owned();

        match attr.key.as_ref() {
            b"xmlUrl" => attrs.xml_url = Some(value),
            b"htmlUrl" => attrs.html_url = Some(value),
            b"title" => attrs.title = Some(value),
            b"text" => attrs.text = Some(value),
            b"type" => {}
            key => attrs
                .extra
                .push((String::from_utf8_lossy(key).into_owned(), value)),
        }
    }

    Ok(attrs)
}

/// Classify a closed outline as entry, folder or warning.
fn finish_outline(
    index: usize,
    attrs: OutlineAttributes,
    has_children: bool,
    document: &mut ParsedDocument,
    seen: &mut HashSet<FeedUrl>,
) {
    let title = attrs.display_title();

    let Some(raw_url) = attrs.xml_url.as_deref().filter(|u| !u.trim().is_empty()) else {
        if !has_children {
            tracing::warn!(index, "Skipping OPML outline without xmlUrl");
            document.warnings.push(ImportWarning {
                index,
                title,
                reason: WarningReason::MissingFeedUrl,
            });
        }
        return;
    };

    let feed_url = match FeedUrl::parse_untrusted(raw_url) {
        Ok(url) => url,
        Err(error) => {
            tracing::warn!(index, url = %raw_url, error = %error, "Skipping invalid feed URL");
            document.warnings.push(ImportWarning {
                index,
                title,
                reason: WarningReason::InvalidFeedUrl {
                    url: raw_url.to_owned(),
                    error,
                },
            });
            return;
        }
    };

    if !seen.insert(feed_url.clone()) {
        tracing::debug!(index, url = %feed_url, "Duplicate feed in OPML document");
        return;
    }

    // The website link is informational; drop it rather than fail the entry
    let html_url = attrs.html_url.filter(|u| validate_url(u).is_ok());

    document.entries.push(OutlineEntry {
        index,
        feed_url,
        title,
        html_url,
        extra_attributes: attrs.extra,
    });
}
