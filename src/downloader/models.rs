//! Data structures for the fetch engine
//!
//! Outcome and error types, plus the small parsers the engine needs: the
//! Content-Disposition filename, the file identifier in a portal URL and the
//! names tried when a download collides with a different local file.

use std::{fmt, path::PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use thiserror::Error;

use crate::db::FileId;

static FILE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?g(\d+)").unwrap());

/// Suffix inserted before the extension when a same-named file changed remotely
pub const CONFLICT_SUFFIX: &str = "_yeni";

/// Result of a single fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Nothing existed at the resolved path; the body was written there
    WrittenNew(PathBuf),
    /// A file with identical content already exists at the resolved path
    SkippedIdentical(PathBuf),
    /// The resolved path held different content; the body was written next to it
    RenamedConflict(PathBuf),
    /// The identifier is known to the record store, no request was made
    SkippedAlreadyRecorded,
    /// The file was abandoned
    Failed(String),
}

impl DownloadOutcome {
    /// Local path the outcome refers to, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::WrittenNew(path) | Self::SkippedIdentical(path) | Self::RenamedConflict(path) => {
                Some(path)
            }
            Self::SkippedAlreadyRecorded | Self::Failed(_) => None,
        }
    }

    /// True when this fetch put a new file on disk
    pub fn is_write(&self) -> bool {
        matches!(self, Self::WrittenNew(_) | Self::RenamedConflict(_))
    }
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrittenNew(path) => write!(f, "Written: {}", path.display()),
            Self::SkippedIdentical(path) => write!(f, "Identical: {}", path.display()),
            Self::RenamedConflict(path) => write!(f, "Renamed: {}", path.display()),
            Self::SkippedAlreadyRecorded => write!(f, "Already recorded"),
            Self::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("HTTP error {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl FetchError {
    /// Network conditions that are worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestError(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::RetriesExhausted { .. } | Self::Write { .. } | Self::Cancelled => false,
        }
    }
}

/// Parse filename from Content-Disposition header
///
/// The extended `filename*=charset'lang'value` form wins over the plain
/// `filename=` form. Both are percent-decoded; invalid UTF-8 is replaced
/// rather than rejected. Returns None if no usable name is present.
#[tracing::instrument(level = "trace", ret)]
pub fn parse_content_disposition(content_disposition: &str) -> Option<String> {
    let params: Vec<(String, &str)> = split_header_params(content_disposition)
        .into_iter()
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), value.trim()))
        })
        .collect();

    let extended = params
        .iter()
        .find(|(key, _)| key == "filename*")
        .and_then(|(_, value)| decode_extended_value(value));
    if extended.is_some() {
        return extended;
    }

    params
        .iter()
        .find(|(key, _)| key == "filename")
        .and_then(|(_, value)| {
            let unquoted = unquote(value);
            let decoded = percent_decode_lossy(&unquoted);
            let trimmed = decoded.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
}

/// Split on `;` outside of quoted strings
fn split_header_params(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (index, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                params.push(&header[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    params.push(&header[start..]);
    params
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };
    let inner = inner.strip_suffix('"').unwrap_or(inner);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

// RFC 5987: charset'language'percent-encoded-value
fn decode_extended_value(value: &str) -> Option<String> {
    let value = value.trim_matches('"');
    let mut parts = value.splitn(3, '\'');
    let (charset, encoded) = match (parts.next(), parts.next(), parts.next()) {
        (Some(charset), Some(_language), Some(encoded)) => (charset, encoded),
        _ => ("utf-8", value),
    };

    let bytes = urlencoding::decode_binary(encoded.as_bytes());
    let decoded = if charset.eq_ignore_ascii_case("iso-8859-1") {
        bytes.iter().map(|&b| char::from(b)).collect()
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn percent_decode_lossy(value: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
}

/// Identifier of a portal file, carried as `?g<digits>` in its URL
pub fn extract_file_id(url: &str) -> Option<FileId> {
    let captures = FILE_ID_PATTERN.captures(url)?;
    match captures[1].parse::<FileId>() {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "File identifier does not fit an integer");
            None
        }
    }
}

/// Name to try for the `attempt`-th conflict: `stem_yeni.ext`, then `stem_yeni_2.ext`, ...
pub fn conflict_name(stem: &str, extension: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("{stem}{CONFLICT_SUFFIX}{extension}")
    } else {
        format!("{stem}{CONFLICT_SUFFIX}_{attempt}{extension}")
    }
}

/// Name used when the server does not say what the file is called
pub fn fallback_filename() -> String {
    format!("unknown_{:08x}.bin", rand::random::<u32>())
}
