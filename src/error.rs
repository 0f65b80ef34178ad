//! Error types for the edgequake-detect library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DetectError`]: **Fatal** for one document (or for the whole process at
//!   startup): the input cannot be read, the PDF cannot be rasterised, the
//!   model weights cannot be loaded, the artifact cannot be written.
//!   Returned as `Err(DetectError)` from [`crate::document::process_document`]
//!   and from [`crate::context::ServiceContext::from_env`].
//!
//! * [`PageError`]: **Non-fatal**: a single page could not be decoded, the
//!   detector failed for the batch that page was in, or drawing failed. The
//!   page degrades to its unannotated original and the error is stored in
//!   [`crate::output::PageOutcome`] so callers can inspect partial success.
//!
//! The fleet scheduler turns a `DetectError` into a failed
//! [`crate::output::DocumentOutcome`] and keeps going with the other
//! documents; only startup errors abort the process.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-detect library.
#[derive(Debug, Error)]
pub enum DetectError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// The file is neither a PDF nor a supported raster image.
    #[error("Unsupported document '{path}'\nFirst bytes: {magic:?}")]
    UnsupportedDocument { path: PathBuf, magic: [u8; 4] },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Rasterisation errors ──────────────────────────────────────────────
    /// The document could not be turned into pages at all.
    #[error("Rasterisation failed for '{path}': {detail}")]
    Rasterization { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place the library next to the binary.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Startup errors ────────────────────────────────────────────────────
    /// Model weights are missing or could not be loaded.
    #[error("Startup failed: {0}")]
    Startup(String),

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output artifact.
    #[error("Failed to write artifact '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The annotated pages could not be encoded into the artifact format.
    #[error("Failed to encode artifact '{path}': {detail}")]
    Encode { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Fleet errors ──────────────────────────────────────────────────────
    /// A worker died or returned something unreadable for this document.
    #[error("Worker failed on '{document}': {detail}")]
    Worker { document: String, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::PageOutcome`] when a page fails. The page is
/// still rendered (unannotated) when its pixels are available, and the
/// document continues.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page pixels could not be decoded or letterboxed.
    #[error("Page {page}: decode failed: {detail}")]
    Decode { page: usize, detail: String },

    /// The detector failed for the batch this page belonged to.
    #[error("Page {page}: model invocation failed: {detail}")]
    ModelInvocation { page: usize, detail: String },

    /// Drawing the detections onto the page failed.
    #[error("Page {page}: render failed: {detail}")]
    Render { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Decode { page, .. }
            | PageError::ModelInvocation { page, .. }
            | PageError::Render { page, .. } => *page,
        }
    }
}
