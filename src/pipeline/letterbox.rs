//! Letterbox transform: page ⇄ fixed square detector canvas.
//!
//! ## Why letterbox instead of stretch?
//!
//! Layout detectors are trained on undistorted pages. Stretching an A4 scan
//! into a square squashes text lines and shifts every box the model emits.
//! Scaling uniformly and padding the short side with white keeps aspect
//! ratio, and the three numbers in [`LetterboxParams`] are enough to map any
//! canvas coordinate back onto the original page exactly.
//!
//! ```text
//!   original w×h  ──enhance──▶ resize(⌊w·s⌋×⌊h·s⌋) ──paste at (x_off, y_off)──▶ C×C canvas
//!   C×C canvas    ──crop(x_off, y_off, ⌊w·s⌋, ⌊h·s⌋)──▶ Lanczos3 resize ──▶ w×h
//! ```

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Padding value for every channel of the canvas background.
pub const PAD_VALUE: u8 = 255;

/// Canvas edge length the default detector was exported with.
pub const DEFAULT_CANVAS_SIZE: u32 = 1024;

/// Geometry of one forward transform. Sufficient to invert it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LetterboxParams {
    /// Uniform scale applied to the original: `min(C/w, C/h)`.
    pub scale: f64,
    /// Left padding on the canvas, in pixels.
    pub x_offset: u32,
    /// Top padding on the canvas, in pixels.
    pub y_offset: u32,
}

impl LetterboxParams {
    /// Compute the parameters for placing a `width × height` page on a
    /// `canvas_size²` canvas.
    pub fn compute(width: u32, height: u32, canvas_size: u32) -> Result<Self, LetterboxError> {
        if width == 0 || height == 0 {
            return Err(LetterboxError::EmptyImage { width, height });
        }
        if canvas_size == 0 {
            return Err(LetterboxError::EmptyCanvas);
        }
        let c = canvas_size as f64;
        let scale = (c / width as f64).min(c / height as f64);
        let (sw, sh) = scaled_dims(width, height, scale, canvas_size);
        Ok(Self {
            scale,
            x_offset: (canvas_size - sw) / 2,
            y_offset: (canvas_size - sh) / 2,
        })
    }

    /// Size of the scaled page region on the canvas.
    pub fn scaled_size(&self, original_size: (u32, u32), canvas_size: u32) -> (u32, u32) {
        scaled_dims(original_size.0, original_size.1, self.scale, canvas_size)
    }
}

/// `⌊w·s⌋ × ⌊h·s⌋`, at least one pixel and never larger than the canvas.
fn scaled_dims(width: u32, height: u32, scale: f64, canvas_size: u32) -> (u32, u32) {
    // The epsilon absorbs float error when `scale == C/w` exactly.
    let dim = |v: u32| (((v as f64) * scale + 1e-9).floor() as u32).clamp(1, canvas_size.max(1));
    (dim(width), dim(height))
}

/// Optional contrast/noise treatment applied before resizing.
///
/// Only the detector input is enhanced. Annotated output is always drawn on
/// the untouched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceProfile {
    /// Pixels passed through unchanged.
    None,
    /// 3×3 median filter. Removes scanner speckle without softening edges.
    #[default]
    Denoise,
    /// Grayscale → histogram equalisation → Otsu threshold, back to RGB.
    Binarize,
}

/// Errors raised by the letterbox transform.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LetterboxError {
    #[error("image has zero area ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("canvas size must be at least 1 px")]
    EmptyCanvas,
}

/// Enhance, scale, and pad `raw` onto a `canvas_size²` white canvas.
pub fn forward(
    raw: &RgbImage,
    canvas_size: u32,
    profile: EnhanceProfile,
) -> Result<(RgbImage, LetterboxParams), LetterboxError> {
    let (w, h) = raw.dimensions();
    let params = LetterboxParams::compute(w, h, canvas_size)?;
    let (sw, sh) = params.scaled_size((w, h), canvas_size);

    let resized = match profile {
        EnhanceProfile::None => imageops::resize(raw, sw, sh, FilterType::Triangle),
        other => imageops::resize(&enhance(raw, other), sw, sh, FilterType::Triangle),
    };

    let mut canvas = RgbImage::from_pixel(canvas_size, canvas_size, Rgb([PAD_VALUE; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        params.x_offset as i64,
        params.y_offset as i64,
    );
    Ok((canvas, params))
}

/// Crop the page region out of `canvas` and resize it to exactly
/// `original_size`.
pub fn inverse(
    canvas: &RgbImage,
    params: &LetterboxParams,
    original_size: (u32, u32),
) -> Result<RgbImage, LetterboxError> {
    let (w, h) = original_size;
    if w == 0 || h == 0 {
        return Err(LetterboxError::EmptyImage { width: w, height: h });
    }
    let (cw, ch) = canvas.dimensions();
    if cw == 0 || ch == 0 {
        return Err(LetterboxError::EmptyCanvas);
    }
    let (sw, sh) = params.scaled_size(original_size, cw.min(ch));
    let region = imageops::crop_imm(canvas, params.x_offset, params.y_offset, sw, sh).to_image();
    Ok(imageops::resize(&region, w, h, FilterType::Lanczos3))
}

/// Map a canvas box `[x1, y1, x2, y2]` onto the original page, clamped to
/// `[0, w] × [0, h]`.
pub fn inverse_box(bbox: [f32; 4], params: &LetterboxParams, original_size: (u32, u32)) -> [f32; 4] {
    let (w, h) = (original_size.0 as f64, original_size.1 as f64);
    let s = params.scale;
    let (xo, yo) = (params.x_offset as f64, params.y_offset as f64);
    let map = |v: f32, off: f64, max: f64| (((v as f64) - off) / s).clamp(0.0, max) as f32;
    [
        map(bbox[0], xo, w),
        map(bbox[1], yo, h),
        map(bbox[2], xo, w),
        map(bbox[3], yo, h),
    ]
}

/// Map a page box onto the canvas. The inverse of [`inverse_box`] up to
/// rounding.
pub fn forward_box(bbox: [f32; 4], params: &LetterboxParams) -> [f32; 4] {
    let s = params.scale;
    let (xo, yo) = (params.x_offset as f64, params.y_offset as f64);
    let map = |v: f32, off: f64| ((v as f64) * s + off) as f32;
    [
        map(bbox[0], xo),
        map(bbox[1], yo),
        map(bbox[2], xo),
        map(bbox[3], yo),
    ]
}

fn enhance(raw: &RgbImage, profile: EnhanceProfile) -> RgbImage {
    match profile {
        EnhanceProfile::None => raw.clone(),
        EnhanceProfile::Denoise => imageproc::filter::median_filter(raw, 1, 1),
        EnhanceProfile::Binarize => {
            let gray = imageops::grayscale(raw);
            let equalized = imageproc::contrast::equalize_histogram(&gray);
            let level = imageproc::contrast::otsu_level(&equalized);
            DynamicImage::ImageLuma8(binarize(&equalized, level)).to_rgb8()
        }
    }
}

fn binarize(gray: &GrayImage, level: u8) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > level { 255 } else { 0 };
    }
    out
}
