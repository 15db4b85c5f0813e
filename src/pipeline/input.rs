//! Input resolution: turn a path or URL into a loaded [`Document`].
//!
//! ## Why download to a temp file?
//!
//! A URL input is written into a `TempDir` before loading so it behaves
//! exactly like a local file (same MIME detection by extension, same
//! read path). The directory is removed when [`ResolvedInput`] drops, on
//! every exit path.

use crate::document::{Document, PDF_MIME};
use crate::error::DocParseError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Extension → MIME type for the document types the service accepts.
const MIME_TABLE: &[(&str, &str)] = &[
    ("pdf", PDF_MIME),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("xml", "text/xml"),
    ("rtf", "text/rtf"),
];

/// A local path, or a downloaded temp file kept alive with its directory.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is kept alive until the input is dropped.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// MIME type for `path`, chosen by (case-insensitive) extension.
pub fn mime_for_path(path: &Path) -> Result<&'static str, DocParseError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    MIME_TABLE
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .ok_or_else(|| DocParseError::UnsupportedMimeType {
            path: path.to_path_buf(),
            extension,
        })
}

/// Resolve `input` to a local file, downloading URLs first.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, DocParseError> {
    if input.trim().is_empty() {
        return Err(DocParseError::InvalidInput {
            input: input.to_string(),
            reason: "empty path".into(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input))
    }
}

pub fn resolve_local(path: &Path) -> Result<ResolvedInput, DocParseError> {
    let path = path.to_path_buf();
    if !path.exists() {
        return Err(DocParseError::FileNotFound { path });
    }
    if !path.is_file() {
        return Err(DocParseError::InvalidInput {
            input: path.display().to_string(),
            reason: "not a regular file".into(),
        });
    }
    match std::fs::File::open(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DocParseError::PermissionDenied { path });
        }
        Err(_) => return Err(DocParseError::FileNotFound { path }),
    }
    debug!("Resolved local document: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Read a resolved input into memory.
///
/// The document id is the file name; MIME comes from the extension.
pub async fn load_document(input: &ResolvedInput) -> Result<Document, DocParseError> {
    let path = input.path();
    let mime_type = mime_for_path(path)?;
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => DocParseError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => DocParseError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    debug!("Loaded {} ({} bytes, {})", id, bytes.len(), mime_type);
    Ok(Document::new(id, bytes, mime_type))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, DocParseError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DocParseError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let download_err = |e: reqwest::Error| {
        if e.is_timeout() {
            DocParseError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DocParseError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(download_err)?;
    if !response.status().is_success() {
        return Err(DocParseError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(download_err)?;

    let temp_dir = TempDir::new().map_err(|e| DocParseError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| DocParseError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it has an extension, else `downloaded.pdf`.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for_path(Path::new("a.pdf")).unwrap(), "application/pdf");
        assert_eq!(mime_for_path(Path::new("A.PDF")).unwrap(), "application/pdf");
        assert_eq!(mime_for_path(Path::new("notes.txt")).unwrap(), "text/plain");
        assert_eq!(mime_for_path(Path::new("page.html")).unwrap(), "text/html");
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = mime_for_path(Path::new("photo.xyz")).unwrap_err();
        assert!(matches!(err, DocParseError::UnsupportedMimeType { .. }));
        assert!(mime_for_path(Path::new("Makefile")).is_err());
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(filename_from_url("https://x.org/papers/a.pdf"), "a.pdf");
        assert_eq!(filename_from_url("https://x.org/papers/"), "downloaded.pdf");
        assert_eq!(filename_from_url("https://x.org/download"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, DocParseError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn empty_input_is_invalid() {
        let err = resolve_input("  ", 5).await.unwrap_err();
        assert!(matches!(err, DocParseError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn loads_local_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let resolved = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        let doc = load_document(&resolved).await.unwrap();
        assert_eq!(doc.id(), "notes.txt");
        assert_eq!(doc.mime_type(), "text/plain");
        assert_eq!(doc.bytes(), b"hello");
    }
}
