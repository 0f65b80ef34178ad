//! Input resolution: normalise a user-supplied path or URL to a local file
//! and decide whether it is a PDF or a raster image.
//!
//! ## Why download to a temp file?
//!
//! pdfium requires a file-system path; it cannot stream from a byte buffer.
//! Downloading to a `TempDir` gives pdfium a path while ensuring cleanup
//! happens when `ResolvedInput` is dropped. The document kind is sniffed
//! from magic bytes before returning so callers get a meaningful error
//! instead of a pdfium or decoder failure deep in the pipeline.

use crate::error::DetectError;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// What kind of document a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
}

impl DocumentKind {
    /// Identify by magic bytes, falling back to the file extension.
    pub fn sniff(head: &[u8], path: &Path) -> Option<Self> {
        if head.starts_with(b"%PDF") {
            return Some(DocumentKind::Pdf);
        }
        if head.starts_with(&[0x89, b'P', b'N', b'G']) {
            return Some(DocumentKind::Png);
        }
        if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(DocumentKind::Jpeg);
        }
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("pdf") => Some(DocumentKind::Pdf),
            Some("png") => Some(DocumentKind::Png),
            Some("jpg") | Some("jpeg") => Some(DocumentKind::Jpeg),
            _ => None,
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, DocumentKind::Pdf)
    }
}

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local { path: PathBuf, kind: DocumentKind },
    /// Input was a URL; the document was downloaded to a temp directory,
    /// kept alive until processing completes.
    Downloaded {
        path: PathBuf,
        kind: DocumentKind,
        _temp_dir: TempDir,
    },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local { path, .. } | ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            ResolvedInput::Local { kind, .. } | ResolvedInput::Downloaded { kind, .. } => *kind,
        }
    }

    /// File name without extension; names the artifact directory.
    pub fn stem(&self) -> String {
        self.path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local document.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, DetectError> {
    if input.trim().is_empty() {
        return Err(DetectError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input))
    }
}

/// Resolve a local file path, validating existence, permissions, and kind.
pub fn resolve_local(path: &Path) -> Result<ResolvedInput, DetectError> {
    let path = path.to_path_buf();
    if !path.exists() {
        return Err(DetectError::FileNotFound { path });
    }

    let mut head = [0u8; 4];
    let read = match std::fs::File::open(&path) {
        Ok(mut f) => f.read(&mut head).unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DetectError::PermissionDenied { path });
        }
        Err(_) => return Err(DetectError::FileNotFound { path }),
    };

    let kind = DocumentKind::sniff(&head[..read], &path)
        .ok_or(DetectError::UnsupportedDocument {
            path: path.clone(),
            magic: head,
        })?;

    debug!("Resolved local {:?}: {}", kind, path.display());
    Ok(ResolvedInput::Local { path, kind })
}

/// Download a URL to a temporary directory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, DetectError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| DetectError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DetectError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = extract_filename(url);
    let temp_dir = TempDir::new().map_err(|e| DetectError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| DetectError::Internal(format!("Failed to write temp file: {}", e)))?;

    let kind = DocumentKind::sniff(&bytes[..bytes.len().min(4)], &file_path).ok_or_else(|| {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        DetectError::UnsupportedDocument {
            path: file_path.clone(),
            magic,
        }
    })?;

    info!("Downloaded to: {}", file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        kind,
        _temp_dir: temp_dir,
    })
}

/// Last non-empty URL path segment with an extension, else a generic name.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn sniff_prefers_magic_over_extension() {
        let p = Path::new("mislabelled.pdf");
        assert_eq!(
            DocumentKind::sniff(&[0x89, b'P', b'N', b'G'], p),
            Some(DocumentKind::Png)
        );
        assert_eq!(DocumentKind::sniff(b"%PDF", Path::new("x.bin")), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::sniff(b"????", Path::new("x.JPG")), Some(DocumentKind::Jpeg));
        assert_eq!(DocumentKind::sniff(b"????", Path::new("x.txt")), None);
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            resolve_local(Path::new("/definitely/not/here.pdf")),
            Err(DetectError::FileNotFound { .. })
        ));
    }

    #[test]
    fn unknown_content_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        match resolve_local(&path) {
            Err(DetectError::UnsupportedDocument { magic, .. }) => assert_eq!(&magic, b"hell"),
            other => panic!("expected UnsupportedDocument, got {:?}", other.map(|r| r.kind())),
        }
    }

    #[test]
    fn local_pdf_resolves_with_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exam-3.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let r = resolve_local(&path).unwrap();
        assert_eq!(r.kind(), DocumentKind::Pdf);
        assert_eq!(r.stem(), "exam-3");
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(extract_filename("https://x.org/a/scan.png"), "scan.png");
        assert_eq!(extract_filename("https://x.org/a/"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn blank_input_is_invalid() {
        assert!(matches!(
            resolve_input("  ", 5).await,
            Err(DetectError::InvalidInput { .. })
        ));
    }
}
