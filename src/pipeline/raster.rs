//! Rasterisation: turn a document into full-resolution RGB pages.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async tasks. Callers run
//! [`Rasterizer::rasterize`] inside `tokio::task::spawn_blocking` so Tokio
//! worker threads never stall on page rendering.
//!
//! ## Why a fixed DPI?
//!
//! The detector was trained on 300 DPI scans. Rendering at the same density
//! keeps glyph and rule sizes in the range it has seen, whatever the page's
//! physical size. `max_pixels` is an optional safety cap for posters.

use crate::error::{DetectError, PageError};
use image::RgbImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Render density matching the detector's training data.
pub const DEFAULT_DPI: u32 = 300;

/// Produces one page image per document page, in order.
///
/// A document that cannot be opened at all is a [`DetectError`]; a single
/// page that fails to render is a [`PageError`] in its slot.
pub trait Rasterizer: Send + Sync {
    fn rasterize(&self, path: &Path) -> Result<Vec<Result<RgbImage, PageError>>, DetectError>;
}

/// pdfium-backed PDF rasteriser.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    pub dpi: u32,
    /// Cap on either rendered dimension, in pixels.
    pub max_pixels: Option<u32>,
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            max_pixels: None,
        }
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(&self, path: &Path) -> Result<Vec<Result<RgbImage, PageError>>, DetectError> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| DetectError::Rasterization {
                path: path.to_path_buf(),
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let total = pages.len() as usize;
        info!("PDF loaded: {} pages ({})", total, path.display());

        let mut config = PdfRenderConfig::new().scale_page_by_factor(self.dpi as f32 / 72.0);
        if let Some(max) = self.max_pixels {
            config = config
                .set_maximum_width(max as i32)
                .set_maximum_height(max as i32);
        }

        let mut out = Vec::with_capacity(total);
        for (idx, page) in pages.iter().enumerate() {
            let page_num = idx + 1;
            match page.render_with_config(&config) {
                Ok(bitmap) => {
                    let image = bitmap.as_image().to_rgb8();
                    debug!(
                        "Rendered page {} → {}x{} px",
                        page_num,
                        image.width(),
                        image.height()
                    );
                    out.push(Ok(image));
                }
                Err(e) => {
                    warn!("Page {} failed to render: {:?}", page_num, e);
                    out.push(Err(PageError::Decode {
                        page: page_num,
                        detail: format!("{:?}", e),
                    }));
                }
            }
        }
        Ok(out)
    }
}

/// Decode a single raster image file as a one-page document.
pub fn decode_image(path: &Path) -> Result<Vec<Result<RgbImage, PageError>>, DetectError> {
    let img = image::open(path).map_err(|e| DetectError::Rasterization {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(vec![Ok(img.to_rgb8())])
}

/// Decode in-memory image bytes (PNG, JPEG).
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Bind to a pdfium shared library.
///
/// Resolution order: `PDFIUM_LIB_PATH` (file or directory), the working
/// directory, the directory of the running executable, then the system
/// library search path.
pub fn bind_pdfium() -> Result<Pdfium, DetectError> {
    let mut attempts: Vec<String> = Vec::new();

    for candidate in library_candidates() {
        match Pdfium::bind_to_library(&candidate) {
            Ok(bindings) => {
                debug!("Bound pdfium at {}", candidate.display());
                return Ok(Pdfium::new(bindings));
            }
            Err(e) => attempts.push(format!("{}: {:?}", candidate.display(), e)),
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(e) => {
            attempts.push(format!("system library: {:?}", e));
            Err(DetectError::PdfiumBindingFailed(attempts.join("; ")))
        }
    }
}

fn library_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(p) = std::env::var("PDFIUM_LIB_PATH") {
        let p = PathBuf::from(p);
        if p.is_dir() {
            out.push(Pdfium::pdfium_platform_library_name_at_path(&p));
        } else {
            out.push(p);
        }
    }
    out.push(Pdfium::pdfium_platform_library_name_at_path("./"));
    if let Some(dir) = std::env::current_exe().ok().and_then(|e| e.parent().map(Path::to_path_buf)) {
        out.push(Pdfium::pdfium_platform_library_name_at_path(&dir));
    }
    out.retain(|p| p.exists());
    out
}
