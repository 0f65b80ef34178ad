//! Artifact store: encode annotated pages and write them under a versioned
//! name.
//!
//! Layout: `<output_dir>/<stem>/<stem>-<n>.<ext>`, where `n` is one more than
//! the highest existing sequence number for that stem. Rerunning a document
//! never overwrites an earlier result.
//!
//! Naming is single-writer: two processes racing on the same stem can pick
//! the same `n`. The fleet never schedules one document twice concurrently.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// JPEG quality for image artifacts.
pub const JPEG_QUALITY: u8 = 95;

/// Container format of a written artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// One page per annotated image.
    Pdf,
    Png,
    Jpeg,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Pdf => "pdf",
            ArtifactFormat::Png => "png",
            ArtifactFormat::Jpeg => "jpg",
        }
    }

    /// Guess from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(ArtifactFormat::Pdf),
            "png" => Some(ArtifactFormat::Png),
            "jpg" | "jpeg" => Some(ArtifactFormat::Jpeg),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Pdf => "application/pdf",
            ArtifactFormat::Png => "image/png",
            ArtifactFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no pages to encode")]
    NoPages,

    #[error("{format:?} holds a single page, got {pages}")]
    MultiPageImage { format: ArtifactFormat, pages: usize },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("pdf assembly failed: {0}")]
    Pdf(String),
}

/// Serialises annotated pages into artifact bytes.
pub trait ArtifactEncoder: Send + Sync {
    fn encode(&self, pages: &[RgbImage], format: ArtifactFormat) -> Result<Vec<u8>, EncodeError>;
}

/// PDF via pdfium, PNG and JPEG via `image`.
#[derive(Debug, Clone)]
pub struct DefaultEncoder {
    /// Density the pages were rendered at; sets PDF page size in points.
    pub dpi: u32,
}

impl Default for DefaultEncoder {
    fn default() -> Self {
        Self {
            dpi: crate::pipeline::raster::DEFAULT_DPI,
        }
    }
}

impl ArtifactEncoder for DefaultEncoder {
    fn encode(&self, pages: &[RgbImage], format: ArtifactFormat) -> Result<Vec<u8>, EncodeError> {
        if pages.is_empty() {
            return Err(EncodeError::NoPages);
        }
        match format {
            ArtifactFormat::Pdf => self.encode_pdf(pages),
            ArtifactFormat::Png | ArtifactFormat::Jpeg if pages.len() > 1 => {
                Err(EncodeError::MultiPageImage {
                    format,
                    pages: pages.len(),
                })
            }
            ArtifactFormat::Png => {
                let mut buf = Vec::new();
                pages[0].write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
                Ok(buf)
            }
            ArtifactFormat::Jpeg => {
                let mut buf = Vec::new();
                JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(&pages[0])?;
                Ok(buf)
            }
        }
    }
}

impl DefaultEncoder {
    fn encode_pdf(&self, pages: &[RgbImage]) -> Result<Vec<u8>, EncodeError> {
        let pdf_err = |e: PdfiumError| EncodeError::Pdf(format!("{:?}", e));
        let pdfium = crate::pipeline::raster::bind_pdfium()
            .map_err(|e| EncodeError::Pdf(e.to_string()))?;
        let mut document = pdfium.create_new_pdf().map_err(pdf_err)?;
        let points_per_px = 72.0 / self.dpi.max(1) as f32;

        for img in pages {
            let w = PdfPoints::new(img.width() as f32 * points_per_px);
            let h = PdfPoints::new(img.height() as f32 * points_per_px);
            let mut page = document
                .pages_mut()
                .create_page_at_end(PdfPagePaperSize::Custom(w, h))
                .map_err(pdf_err)?;
            page.objects_mut()
                .create_image_object(
                    PdfPoints::ZERO,
                    PdfPoints::ZERO,
                    &DynamicImage::ImageRgb8(img.clone()),
                    Some(w),
                    Some(h),
                )
                .map_err(pdf_err)?;
        }

        let bytes = document.save_to_bytes().map_err(pdf_err)?;
        debug!("Encoded {} page(s) → {} bytes PDF", pages.len(), bytes.len());
        Ok(bytes)
    }
}

// ── Naming ───────────────────────────────────────────────────────────────

/// Where an artifact goes and which version it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPath {
    pub stem: String,
    pub sequence: u32,
    pub path: PathBuf,
}

/// Pick `<dir>/<stem>-<max+1>.<ext>`, or `-1` when none exist yet.
pub fn next_artifact_path(dir: &Path, stem: &str, ext: &str) -> std::io::Result<ArtifactPath> {
    let pattern = format!(r"^{}-(\d+)\.{}$", regex::escape(stem), regex::escape(ext));
    let re = Regex::new(&pattern).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut highest = 0u32;
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(n) = re
                    .captures(name)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                {
                    highest = highest.max(n);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let sequence = highest + 1;
    Ok(ArtifactPath {
        stem: stem.to_string(),
        sequence,
        path: dir.join(format!("{stem}-{sequence}.{ext}")),
    })
}

/// Per-document directory: `<output_dir>/<stem>`.
pub fn document_dir(output_dir: &Path, stem: &str) -> PathBuf {
    output_dir.join(stem)
}

/// Find a stored artifact by its bare file name (`<stem>-<n>.<ext>`).
///
/// Names with path separators, `..`, or a leading dot are refused, so the
/// result always lies inside `output_dir`.
pub fn locate_artifact(output_dir: &Path, filename: &str) -> Option<PathBuf> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains("..")
        || filename.contains(['/', '\\'])
    {
        return None;
    }
    let re = Regex::new(r"^(.+)-\d+\.[A-Za-z0-9]+$").ok()?;
    let stem = re.captures(filename)?.get(1)?.as_str();
    let path = document_dir(output_dir, stem).join(filename);
    path.is_file().then_some(path)
}

/// Write `bytes` to `path` atomically: temp file in the same directory, then
/// rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("out")
    ));
    tokio::fs::write(&tmp_path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn first_artifact_is_one_then_increments() {
        let dir = tempfile::tempdir().unwrap();
        let first = next_artifact_path(dir.path(), "report", "pdf").unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.path, dir.path().join("report-1.pdf"));

        std::fs::write(&first.path, b"x").unwrap();
        let second = next_artifact_path(dir.path(), "report", "pdf").unwrap();
        assert_eq!(second.path, dir.path().join("report-2.pdf"));
    }

    #[test]
    fn sequence_follows_highest_not_count() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["report-1.pdf", "report-7.pdf", "report-x.pdf", "report-3.png", "other-9.pdf"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(next_artifact_path(dir.path(), "report", "pdf").unwrap().sequence, 8);
    }

    #[test]
    fn stems_with_regex_metacharacters_are_literal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.b-4.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("aXb-9.pdf"), b"x").unwrap();
        assert_eq!(next_artifact_path(dir.path(), "a.b", "pdf").unwrap().sequence, 5);
    }

    #[test]
    fn missing_directory_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let p = next_artifact_path(&dir.path().join("nope"), "scan", "png").unwrap();
        assert_eq!(p.sequence, 1);
    }

    #[test]
    fn locate_finds_stored_artifact_and_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document_dir(dir.path(), "scan");
        std::fs::create_dir_all(&doc).unwrap();
        std::fs::write(doc.join("scan-2.png"), b"x").unwrap();

        assert_eq!(locate_artifact(dir.path(), "scan-2.png"), Some(doc.join("scan-2.png")));
        assert_eq!(locate_artifact(dir.path(), "scan-3.png"), None);
        assert_eq!(locate_artifact(dir.path(), "../scan-2.png"), None);
        assert_eq!(locate_artifact(dir.path(), "scan/scan-2.png"), None);
        assert_eq!(locate_artifact(dir.path(), "notes.txt"), None);
    }

    #[test]
    fn png_encodes_single_page() {
        let page = RgbImage::from_pixel(5, 5, Rgb([1, 2, 3]));
        let bytes = DefaultEncoder::default()
            .encode(std::slice::from_ref(&page), ArtifactFormat::Png)
            .unwrap();
        let back = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(back, page);
    }

    #[test]
    fn image_formats_reject_multiple_pages() {
        let pages = vec![RgbImage::new(2, 2), RgbImage::new(2, 2)];
        assert!(matches!(
            DefaultEncoder::default().encode(&pages, ArtifactFormat::Jpeg),
            Err(EncodeError::MultiPageImage { pages: 2, .. })
        ));
        assert!(matches!(
            DefaultEncoder::default().encode(&[], ArtifactFormat::Png),
            Err(EncodeError::NoPages)
        ));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ArtifactFormat::from_extension("JPEG"), Some(ArtifactFormat::Jpeg));
        assert_eq!(ArtifactFormat::from_extension("tiff"), None);
        assert_eq!(ArtifactFormat::Jpeg.extension(), "jpg");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scan-1.png");
        write_atomic(&path, b"payload").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
