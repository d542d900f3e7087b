//! Path, naming and content-type helpers for recording files.
//!
//! All pure functions; the capture tool rewrites extensions while it works
//! (`.aac`, `.part` markers, remux to `.mp3`), so everything here has to
//! treat the planned output path as a stem plus a set of possible suffixes.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use crate::discovery::STAGE_FALLBACK;
use crate::error::{Error, Result};

// Characters left literal by JavaScript's encodeURIComponent; download
// URLs built here must round-trip through clients that decode that way.
const COMPONENT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

static NAME_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d{4}-\d{2}-\d{2}T[\d.\-]+)\.").expect("static pattern"));
static CLOCK_DASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"T(\d{2})-(\d{2})-(\d{2})(\.\d+)?Z?").expect("static pattern"));

fn raw_ext(path: &Path) -> Option<String> {
    path.extension().and_then(OsStr::to_str).map(str::to_lowercase)
}

/// Lowercased extension with any trailing `.part` marker stripped.
/// `Song.MP3.part` -> `mp3`.
pub fn normalized_ext(path: &Path) -> Option<String> {
    let ext = raw_ext(path)?;
    if ext == "part" {
        path.file_stem().and_then(|stem| raw_ext(Path::new(stem)))
    } else {
        Some(ext)
    }
}

/// Content type for serving a recording, in-progress suffixes included.
pub fn content_type_for(path: &Path) -> &'static str {
    match normalized_ext(path).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("aac") => "audio/aac",
        Some("m4a") => "audio/mp4",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Finished audio files worth listing. `.part` files are still being
/// written and are reachable through the running-session views instead.
pub fn is_recording_file(name: &str) -> bool {
    matches!(
        raw_ext(Path::new(name)).as_deref(),
        Some("mp3" | "aac" | "m4a" | "webm")
    )
}

/// Percent-encode one URL path segment.
pub fn encode_component(segment: &str) -> String {
    utf8_percent_encode(segment, COMPONENT_ESCAPE).to_string()
}

/// Encoded `/`-joined path of `abs` relative to `root`, or `None` when
/// `abs` does not sit strictly inside `root`.
pub fn build_safe_rel(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => segments.push(encode_component(part.to_str()?)),
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Resolve a client-supplied relative path against the recordings root.
///
/// The input is percent-decoded and must consist of plain segments only;
/// anything that could escape the root is rejected.
pub fn resolve_recording_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let decoded = percent_decode_str(rel)
        .decode_utf8()
        .map_err(|_| Error::InvalidPath)?;

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(Error::InvalidPath),
        }
    }
    if depth == 0 {
        return Err(Error::InvalidPath);
    }
    Ok(resolved)
}

/// Timestamp encoded in a recording file name, if present.
///
/// File names carry an ISO timestamp with `:` flattened to `-` (see
/// [`recording_file_name`]); the clock dashes are restored before parsing
/// so `a_2026-08-25T12-34-56.789Z.mp3` comes back as the original instant.
pub fn parse_timestamp_from_name(file_name: &str) -> Option<DateTime<Utc>> {
    let captured = NAME_TIMESTAMP.captures(file_name)?.get(1)?.as_str();
    let normalized = CLOCK_DASHES.replace(captured, "T$1:$2:$3${4}Z");
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Planned output file name for a capture starting now.
pub fn recording_file_name(stage: &str, started_at: DateTime<Utc>) -> String {
    let stamp = started_at.format("%Y-%m-%dT%H-%M-%S%.3fZ");
    format!("{stage}_{stamp}.mp3")
}

/// Stage names come from an external API but are used as directory names;
/// strip anything the filesystem would interpret.
pub fn sanitize_stage(stage: &str) -> String {
    let cleaned: String = stage
        .chars()
        .map(|c| {
            if std::path::is_separator(c) || c == '\0' {
                '-'
            } else {
                c
            }
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => STAGE_FALLBACK.to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// All paths the capture tool may currently be writing for a planned
/// output file, in probe order.
pub fn candidate_paths(planned: &Path, suffixes: &[String]) -> Vec<PathBuf> {
    let dir = planned.parent().unwrap_or_else(|| Path::new(""));
    let stem = planned
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default();
    suffixes
        .iter()
        .map(|suffix| dir.join(format!("{stem}.{suffix}")))
        .collect()
}

/// The intermediate AAC download that remuxing leaves behind on success.
pub fn aac_sibling(planned: &Path) -> PathBuf {
    let dir = planned.parent().unwrap_or_else(|| Path::new(""));
    let stem = planned
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default();
    dir.join(format!("{stem}.aac"))
}
