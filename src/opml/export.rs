use std::io::Cursor;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use thiserror::Error;

use crate::codec::Timestamp;
use crate::model::Podcast;

/// Attributes written from podcast fields; preserved extras never override
/// them.
const RESERVED_ATTRIBUTES: [&str; 5] = ["type", "text", "title", "xmlUrl", "htmlUrl"];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write OPML: {0}")]
    Write(String),

    #[error("Failed to write OPML file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn write_event<'a>(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    event: Event<'a>,
) -> Result<(), ExportError> {
    writer
        .write_event(event)
        .map_err(|e| ExportError::Write(e.to_string()))
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), ExportError> {
    write_event(writer, Event::Start(BytesStart::new(name)))?;
    write_event(writer, Event::Text(BytesText::new(text)))?;
    write_event(writer, Event::End(BytesEnd::new(name)))
}

/// Exports subscriptions as an OPML 2.0 document.
///
/// Tombstoned podcasts are left out. Each outline carries `type="rss"`,
/// `text`, `title`, `xmlUrl`, `htmlUrl` when known, and the attributes kept
/// from an earlier import.
pub fn export_document(
    podcasts: &[Podcast],
    title: &str,
    created: Timestamp,
) -> Result<String, ExportError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write_event(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write_event(&mut writer, Event::Start(opml))?;

    write_event(&mut writer, Event::Start(BytesStart::new("head")))?;
    write_text_element(&mut writer, "title", title)?;
    write_text_element(
        &mut writer,
        "dateCreated",
        &created.to_datetime().to_rfc2822(),
    )?;
    write_event(&mut writer, Event::End(BytesEnd::new("head")))?;

    write_event(&mut writer, Event::Start(BytesStart::new("body")))?;

    for podcast in podcasts.iter().filter(|p| p.is_subscribed()) {
        let text = if podcast.title().trim().is_empty() {
            podcast.url().as_str()
        } else {
            podcast.title()
        };

        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", text));
        outline.push_attribute(("title", text));
        outline.push_attribute(("xmlUrl", podcast.url().as_str()));
        if let Some(link) = podcast.link() {
            outline.push_attribute(("htmlUrl", link));
        }
        for (key, value) in podcast.extra_attributes() {
            if !RESERVED_ATTRIBUTES.contains(&key.as_str()) {
                outline.push_attribute((key.as_str(), value.as_str()));
            }
        }
        write_event(&mut writer, Event::Empty(outline))?;
    }

    write_event(&mut writer, Event::End(BytesEnd::new("body")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("opml")))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| ExportError::Write(e.to_string()))
}

/// Writes an export to `path` atomically.
///
/// The document goes to a temporary file in the same directory, is synced to
/// disk, then renamed over `path`, so the destination is never partial.
pub fn export_to_file(
    podcasts: &[Podcast],
    title: &str,
    created: Timestamp,
    path: &Path,
) -> Result<(), ExportError> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_document(podcasts, title, created)?;

    // Randomized temp filename so a concurrent export cannot collide
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let io_err = |source: std::io::Error| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(io_err)?;

    let written = std::io::Write::write_all(&mut file, content.as_bytes())
        .and_then(|()| file.sync_all());
    drop(file);

    if let Err(e) = written.and_then(|()| std::fs::rename(&temp_path, path)) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(e));
    }

    tracing::info!(path = %path.display(), "OPML exported");
    Ok(())
}
