//! Destination policy for downloaded episodes:
//! `<library_dir>/<podcast slug>/<YYYY-MM-DD>-<title>.<ext>`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::model::{Episode, Podcast};

/// Maximum length for the title portion of a file name
const MAX_TITLE_LENGTH: usize = 100;

fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// First 8 hex digits of the SHA-256 of `input`.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Whitelist sanitization, separators collapsed to single dashes.
fn sanitize(title: &str) -> String {
    let mut result = String::with_capacity(title.len());
    let mut last_was_separator = false;

    for c in title.chars() {
        let c = if is_valid_filename_char(c) { c } else { '-' };
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    let trimmed = result.trim_matches(|c: char| c == '-' || c == '.');
    truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
}

fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    // ASCII only after sanitizing, so byte slicing is safe
    let truncated = &s[..max_len];
    match truncated.rfind('-') {
        Some(pos) if pos > max_len / 2 => truncated[..pos].to_string(),
        _ => truncated.trim_end_matches('-').to_string(),
    }
}

/// Directory name for a podcast, from its title. Falls back to a hash of the
/// feed URL when nothing usable survives sanitization.
pub fn podcast_slug(podcast: &Podcast) -> String {
    let slug = sanitize(podcast.title()).to_lowercase();
    if slug.is_empty() {
        format!("podcast-{}", short_hash(podcast.url().as_str()))
    } else {
        slug
    }
}

fn audio_extension(enclosure_url: &str) -> String {
    url::Url::parse(enclosure_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .and_then(|file| file.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
        .filter(|ext| {
            matches!(
                ext.as_str(),
                "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
            )
        })
        .unwrap_or_else(|| "mp3".to_string())
}

/// `<YYYY-MM-DD>-<title>.<ext>`, with `undated` for episodes without a
/// publication date.
pub fn episode_file_name(episode: &Episode) -> String {
    let date = episode
        .published()
        .map(|ts| ts.to_datetime().format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let mut title = sanitize(episode.title());
    if title.is_empty() {
        title = format!("episode-{}", short_hash(episode.key().as_str()));
    }

    format!("{}-{}.{}", date, title, audio_extension(episode.enclosure_url()))
}

/// Full destination path for an episode download.
pub fn download_destination(library_dir: &Path, podcast: &Podcast, episode: &Episode) -> PathBuf {
    library_dir
        .join(podcast_slug(podcast))
        .join(episode_file_name(episode))
}
