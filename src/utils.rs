//! Utility functions for sizes, file names and file placement

use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

static SIZE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([0-9]+(?:[.,][0-9]+)?)\s*([kmgtp]?i?b?|bytes?)?\s*$").ok()
});

/// Parse a human-readable size such as `"1.5 MB"`, `"700 KiB"` or `"12345"`
///
/// Units are binary (1 KB = 1024 bytes), matching how hosters usually
/// label file sizes. Returns `None` for anything unparseable.
///
/// # Examples
///
/// ```
/// use rangedl::utils::parse_size;
///
/// assert_eq!(parse_size("1.5 MB"), Some(1_572_864));
/// assert_eq!(parse_size("512"), Some(512));
/// assert_eq!(parse_size("lots"), None);
/// ```
#[must_use]
pub fn parse_size(input: &str) -> Option<u64> {
    let captures = SIZE_PATTERN.as_ref()?.captures(input)?;
    let number: f64 = captures.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let exponent = match unit.chars().next() {
        None | Some('b') => 0,
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some('p') => 5,
        Some(_) => return None,
    };
    Some((number * 1024f64.powi(exponent)).round() as u64)
}

/// Get a unique path for a file, handling collisions according to the specified action
///
/// For Rename this may add a ` (n)` suffix before the extension; Skip fails
/// if the file exists; Overwrite returns the path unchanged.
///
/// # Examples
///
/// ```
/// use rangedl::utils::get_unique_path;
/// use rangedl::config::FileCollisionAction;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/rangedl-doc-missing.bin");
/// let unique = get_unique_path(path, FileCollisionAction::Rename).unwrap();
/// assert_eq!(unique, path);
/// ```
pub fn get_unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::FileCollision {
                    path: path.to_path_buf(),
                    reason: "file already exists and collision action is skip".to_string(),
                });
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::FileCollision {
                    path: path.to_path_buf(),
                    reason: "cannot extract file stem".to_string(),
                })?;
            let extension = path.extension().and_then(|e| e.to_str());
            let parent = path.parent().ok_or_else(|| Error::FileCollision {
                path: path.to_path_buf(),
                reason: "cannot extract parent directory".to_string(),
            })?;

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let new_name = match extension {
                    Some(ext) => format!("{} ({}).{}", stem, i, ext),
                    None => format!("{} ({})", stem, i),
                };
                let new_path = parent.join(new_name);
                if !new_path.exists() {
                    return Ok(new_path);
                }
            }

            Err(Error::FileCollision {
                path: path.to_path_buf(),
                reason: format!("no unique filename after {MAX_RENAME_ATTEMPTS} attempts"),
            })
        }
    }
}

/// File name announced in a `Content-Disposition` header value
///
/// Handles both `filename="a.bin"` and the RFC 5987 `filename*=UTF-8''a%20b.bin`
/// form; the extended form wins when both are present.
#[must_use]
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'encoded-filename
            if let Some(idx) = encoded.rfind('\'')
                && let Ok(decoded) = urlencoding::decode(&encoded[idx + 1..])
                && !decoded.is_empty()
            {
                return Some(sanitize_filename(&decoded));
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                plain = Some(sanitize_filename(name));
            }
        }
    }
    plain
}

/// Last path segment of a URL, percent-decoded
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).ok()?;
    Some(sanitize_filename(&decoded))
}

/// Best file name for a response: header first, then the URL, then a fallback
pub fn extract_filename_from_response(response: &reqwest::Response, url: &str) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| "download".to_string())
}

/// Strip directory components so a remote name can never escape its folder
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .trim_matches('.');
    if base.is_empty() {
        "download".to_string()
    } else {
        base.to_string()
    }
}

/// Temporary download path: `<temp_dir>/<name><suffix>`
#[must_use]
pub fn temp_path(temp_dir: &Path, name: &str, suffix: &str) -> PathBuf {
    temp_dir.join(format!("{name}{suffix}"))
}

/// Move a file, falling back to copy + remove across filesystem boundaries
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %e,
                "rename failed, falling back to copy"
            );
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(())
        }
    }
}
