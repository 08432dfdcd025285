//! Input resolution: load a layout document from a path or URL.
//!
//! The layout collaborator's JSON either sits on disk next to the PDF or
//! is served by the layout service. Both end up as bytes parsed by
//! [`LayoutDocument::from_json_slice`]; a parse failure is reported as
//! [`RefMapError::MalformedLayout`] naming the source, so callers can tell
//! a bad payload apart from a bad path.

use crate::error::RefMapError;
use crate::model::LayoutDocument;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A parsed layout plus what is known about where it came from.
#[derive(Debug, Clone)]
pub struct LoadedLayout {
    pub document: LayoutDocument,
    /// File name of the source, without directories or query string.
    pub source_name: String,
    /// Bytes read.
    pub size: u64,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load and parse the layout at `input`.
///
/// URLs are fetched with a `timeout_secs` deadline; anything else is read
/// as a local path.
pub async fn load_layout(input: &str, timeout_secs: u64) -> Result<LoadedLayout, RefMapError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RefMapError::InvalidInput {
            input: input.to_string(),
        });
    }
    let (bytes, source_name) = if is_url(input) {
        (download_url(input, timeout_secs).await?, url_filename(input))
    } else {
        let path = PathBuf::from(input);
        let bytes = read_local(&path).await?;
        (bytes, path_filename(&path))
    };

    let document = parse_layout(&bytes, &source_name)?;
    info!(
        "Loaded layout '{}': {} pages, {} bytes",
        source_name,
        document.total_pages(),
        bytes.len()
    );
    Ok(LoadedLayout {
        document,
        source_name,
        size: bytes.len() as u64,
    })
}

/// Parse layout JSON, attributing errors to `source_name`.
pub fn parse_layout(bytes: &[u8], source_name: &str) -> Result<LayoutDocument, RefMapError> {
    LayoutDocument::from_json_slice(bytes).map_err(|e| RefMapError::MalformedLayout {
        source_name: source_name.to_string(),
        detail: e.to_string(),
    })
}

/// Read a local file, mapping I/O failures to input errors.
async fn read_local(path: &Path) -> Result<Vec<u8>, RefMapError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            debug!("Read local layout: {}", path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(RefMapError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(RefMapError::LayoutNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Fetch a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, RefMapError> {
    info!("Downloading layout from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RefMapError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            RefMapError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            RefMapError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(RefMapError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            RefMapError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            RefMapError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;
    Ok(bytes.to_vec())
}

/// Last path segment of a URL, or `layout.json`.
fn url_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() {
                    return last.to_string();
                }
            }
        }
    }
    "layout.json".to_string()
}

fn path_filename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
