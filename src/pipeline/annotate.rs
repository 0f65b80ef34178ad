//! Result renderer: draw detections onto a page at full resolution.
//!
//! Detections are drawn in canvas space and the whole canvas is mapped back,
//! so box geometry, mask edges, and label placement go through exactly the
//! same transform the detector saw.

use crate::pipeline::detect::{Detection, DetectionSet};
use crate::pipeline::letterbox::{self, EnhanceProfile, LetterboxError};
use ab_glyph::{Font, FontVec, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Class colours, indexed by `class_id % 5`: dark blue, red, green, light
/// blue, light yellow.
pub const PALETTE: [Rgb<u8>; 5] = [
    Rgb([0, 0, 139]),
    Rgb([255, 0, 0]),
    Rgb([92, 184, 92]),
    Rgb([139, 229, 232]),
    Rgb([235, 233, 187]),
];

const LABEL_BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_TEXT: Rgb<u8> = Rgb([0, 0, 0]);

pub fn class_color(class_id: u32) -> Rgb<u8> {
    PALETTE[(class_id as usize) % PALETTE.len()]
}

/// What text to draw above each box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    None,
    ClassId,
    #[default]
    Confidence,
    Both,
}

impl LabelMode {
    fn text(&self, det: &Detection) -> Option<String> {
        match self {
            LabelMode::None => None,
            LabelMode::ClassId => Some(det.class_id.to_string()),
            LabelMode::Confidence => Some(format!("{:.2}", det.confidence)),
            LabelMode::Both => Some(format!("{} {:.2}", det.class_id, det.confidence)),
        }
    }
}

/// Drawing options.
#[derive(Clone)]
pub struct RenderOptions {
    /// Weight of the class colour where a mask is on. Default: 0.4.
    pub mask_opacity: f32,
    /// Mask probability above which a pixel counts as inside. Default: 0.5.
    pub mask_threshold: f32,
    /// Box outline width in canvas pixels. Default: 2.
    pub box_thickness: u32,
    pub label: LabelMode,
    /// Labels are skipped when no font is loaded.
    pub font: Option<Arc<FontVec>>,
    /// Label glyph height in canvas pixels. Default: 14.
    pub font_scale: f32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            mask_opacity: 0.4,
            mask_threshold: 0.5,
            box_thickness: 2,
            label: LabelMode::default(),
            font: None,
            font_scale: 14.0,
        }
    }
}

impl fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOptions")
            .field("mask_opacity", &self.mask_opacity)
            .field("mask_threshold", &self.mask_threshold)
            .field("box_thickness", &self.box_thickness)
            .field("label", &self.label)
            .field("font", &self.font.as_ref().map(|_| "<FontVec>"))
            .field("font_scale", &self.font_scale)
            .finish()
    }
}

impl RenderOptions {
    /// Load a TrueType/OpenType font for labels.
    pub fn with_font_path(mut self, path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("not a usable font: {}", path.display()),
            )
        })?;
        self.font = Some(Arc::new(font));
        Ok(self)
    }

    /// Probe common system font locations. Leaves `font` unset when none
    /// load.
    pub fn with_system_font(mut self) -> Self {
        const FONT_PATHS: [&str; 5] = [
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
            "/System/Library/Fonts/Supplemental/Arial.ttf",
            "C:\\Windows\\Fonts\\arial.ttf",
        ];
        for path in FONT_PATHS {
            if let Ok(bytes) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(bytes) {
                    info!("Loaded label font: {}", path);
                    self.font = Some(Arc::new(font));
                    return self;
                }
            }
        }
        debug!("No system font found, labels will be skipped");
        self
    }
}

/// Draw `set` onto `original` and return a page of the same size.
///
/// An empty set returns the page untouched.
pub fn render(
    original: &RgbImage,
    set: &DetectionSet,
    opts: &RenderOptions,
) -> Result<RgbImage, LetterboxError> {
    if set.is_empty() {
        return Ok(original.clone());
    }

    let (mut canvas, params) = letterbox::forward(original, set.canvas_size, EnhanceProfile::None)?;

    for det in &set.detections {
        let color = class_color(det.class_id);
        if let Some(mask) = &det.mask {
            blend_mask(&mut canvas, mask, color, opts);
        }
    }
    // Outlines and labels go on top of every mask.
    for det in &set.detections {
        let color = class_color(det.class_id);
        draw_box(&mut canvas, &det.bbox, color, opts.box_thickness);
        if let (Some(text), Some(font)) = (opts.label.text(det), opts.font.as_deref()) {
            draw_label(&mut canvas, &det.bbox, &text, font, opts.font_scale);
        }
    }

    letterbox::inverse(&canvas, &params, original.dimensions())
}

fn blend_mask(canvas: &mut RgbImage, mask: &crate::model::Mask, color: Rgb<u8>, opts: &RenderOptions) {
    let a = opts.mask_opacity.clamp(0.0, 1.0);
    let (w, h) = canvas.dimensions();
    for y in 0..h.min(mask.height) {
        for x in 0..w.min(mask.width) {
            if mask.get(x, y) <= opts.mask_threshold {
                continue;
            }
            let px = canvas.get_pixel_mut(x, y);
            for c in 0..3 {
                px.0[c] = (px.0[c] as f32 * (1.0 - a) + color.0[c] as f32 * a).round() as u8;
            }
        }
    }
}

fn box_rect(bbox: &[f32; 4]) -> Option<Rect> {
    let left = bbox[0].round() as i32;
    let top = bbox[1].round() as i32;
    let width = (bbox[2] - bbox[0]).round() as i32;
    let height = (bbox[3] - bbox[1]).round() as i32;
    (width > 0 && height > 0).then(|| Rect::at(left, top).of_size(width as u32, height as u32))
}

fn draw_box(canvas: &mut RgbImage, bbox: &[f32; 4], color: Rgb<u8>, thickness: u32) {
    let Some(rect) = box_rect(bbox) else {
        return;
    };
    for t in 0..thickness.max(1) as i32 {
        let grown = Rect::at(rect.left() - t, rect.top() - t).of_size(
            rect.width() + (2 * t) as u32,
            rect.height() + (2 * t) as u32,
        );
        draw_hollow_rect_mut(canvas, grown, color);
    }
}

fn text_width(text: &str, font: &FontVec, scale: f32) -> f32 {
    let scaled = font.as_scaled(scale);
    text.chars()
        .map(|ch| scaled.h_advance(scaled.scaled_glyph(ch).id))
        .sum()
}

/// White tab above the box (inside it when there is no room) with black text.
fn draw_label(canvas: &mut RgbImage, bbox: &[f32; 4], text: &str, font: &FontVec, scale: f32) {
    let width = text_width(text, font, scale).ceil().max(1.0) as u32;
    let height = scale.ceil().max(1.0) as u32 + 2;
    let x = bbox[0].round().max(0.0) as i32;
    let above = bbox[1].round() as i32 - height as i32;
    let y = if above >= 0 { above } else { bbox[1].round().max(0.0) as i32 };

    draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(width, height), LABEL_BACKGROUND);
    draw_text_mut(canvas, LABEL_TEXT, x, y + 1, scale, font, text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mask;
    use crate::pipeline::letterbox::LetterboxParams;

    fn set_for(page: &RgbImage, canvas: u32, detections: Vec<Detection>) -> DetectionSet {
        let (w, h) = page.dimensions();
        DetectionSet {
            detections,
            params: LetterboxParams::compute(w, h, canvas).unwrap(),
            original_size: (w, h),
            canvas_size: canvas,
        }
    }

    fn det(bbox: [f32; 4], class_id: u32) -> Detection {
        Detection {
            bbox,
            class_id,
            confidence: 0.87,
            mask: None,
        }
    }

    #[test]
    fn empty_set_is_passthrough() {
        let page = RgbImage::from_fn(30, 20, |x, y| Rgb([x as u8, y as u8, 7]));
        let set = set_for(&page, 64, vec![]);
        let out = render(&page, &set, &RenderOptions::default()).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn output_keeps_original_size() {
        let page = RgbImage::from_pixel(300, 120, Rgb([255, 255, 255]));
        let set = set_for(&page, 128, vec![det([10.0, 40.0, 100.0, 80.0], 1)]);
        let out = render(&page, &set, &RenderOptions::default()).unwrap();
        assert_eq!(out.dimensions(), (300, 120));
    }

    #[test]
    fn box_outline_uses_class_colour() {
        let page = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        // Square page on a same-size canvas: scale 1, no offsets.
        let set = set_for(&page, 100, vec![det([20.0, 20.0, 60.0, 60.0], 1)]);
        let out = render(&page, &set, &RenderOptions::default()).unwrap();
        let edge = out.get_pixel(40, 20);
        assert!(edge.0[0] > 200 && edge.0[1] < 80, "edge pixel {edge:?}");
        let inside = out.get_pixel(40, 40);
        assert_eq!(inside, &Rgb([255, 255, 255]));
    }

    #[test]
    fn mask_tints_only_above_threshold() {
        let page = RgbImage::from_pixel(50, 50, Rgb([255, 255, 255]));
        let mut data = vec![0.0; 50 * 50];
        for y in 10..30 {
            for x in 10..30 {
                data[y * 50 + x] = 0.9;
            }
        }
        let mut d = det([5.0, 5.0, 45.0, 45.0], 2);
        d.mask = Some(Mask::new(50, 50, data));
        let set = set_for(&page, 50, vec![d]);
        let opts = RenderOptions {
            box_thickness: 1,
            ..RenderOptions::default()
        };
        let out = render(&page, &set, &opts).unwrap();
        assert_ne!(out.get_pixel(20, 20), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(40, 40), &Rgb([255, 255, 255]));
    }

    #[test]
    fn palette_wraps_by_class() {
        assert_eq!(class_color(0), class_color(5));
        assert_eq!(class_color(1), Rgb([255, 0, 0]));
    }

    #[test]
    fn label_text_modes() {
        let d = det([0.0, 0.0, 1.0, 1.0], 3);
        assert_eq!(LabelMode::Confidence.text(&d).as_deref(), Some("0.87"));
        assert_eq!(LabelMode::ClassId.text(&d).as_deref(), Some("3"));
        assert_eq!(LabelMode::Both.text(&d).as_deref(), Some("3 0.87"));
        assert_eq!(LabelMode::None.text(&d), None);
    }

    #[test]
    fn debug_hides_font_bytes() {
        let s = format!("{:?}", RenderOptions::default());
        assert!(s.contains("font: None"));
    }
}
