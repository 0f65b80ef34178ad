//! Configuration types for document detection runs.
//!
//! All per-document behaviour is controlled through [`PipelineConfig`], built
//! via its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share a config between fleet workers and to log exactly
//! what a run used.
//!
//! # Design choice: builder over constructor
//! Most callers only change the output directory and maybe the thresholds.
//! The builder lets them set what they care about and rely on documented
//! defaults for the rest; setters clamp, `build()` rejects what clamping
//! cannot fix.

use crate::error::DetectError;
use crate::model::PredictOptions;
use crate::pipeline::annotate::RenderOptions;
use crate::pipeline::artifact::ArtifactFormat;
use crate::pipeline::batch::BackendMemoryClass;
use crate::pipeline::cache::DEFAULT_CACHE_CAPACITY;
use crate::pipeline::letterbox::{EnhanceProfile, DEFAULT_CANVAS_SIZE};
use crate::pipeline::raster::DEFAULT_DPI;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;

/// Configuration for processing one or many documents.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_detect::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_dir("predictions/run-1")
///     .conf_threshold(0.25)
///     .cache_capacity(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.canvas_size, 1024);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Edge of the square detector canvas. Multiple of 32, 32–4096. Default: 1024.
    pub canvas_size: u32,

    /// Treatment applied to pages before they are letterboxed for the
    /// detector. Default: [`EnhanceProfile::Denoise`].
    pub enhance: EnhanceProfile,

    /// Minimum detection confidence. Range 0–1. Default: 0.1.
    pub conf_threshold: f32,

    /// NMS IoU threshold. Range 0–1. Default: 0.45.
    pub iou_threshold: f32,

    /// Suppress overlapping boxes regardless of class. Default: true.
    pub class_agnostic_nms: bool,

    /// Detections kept per page. Default: 50.
    pub max_detections: usize,

    /// Canvases kept in the preprocess cache. Minimum 1. Default: 8.
    pub cache_capacity: usize,

    /// Override the memory class implied by the model's device.
    pub memory_class: Option<BackendMemoryClass>,

    /// Rasterisation density for PDF inputs. Range 72–600. Default: 300.
    pub dpi: u32,

    /// Cap on either rendered page dimension. Default: none.
    pub max_rendered_pixels: Option<u32>,

    /// Root of the artifact store. Default: `predictions`.
    pub output_dir: PathBuf,

    /// Artifact container. `None` writes PDFs for PDF inputs and keeps the
    /// input's own format for images.
    pub artifact_format: Option<ArtifactFormat>,

    /// Drawing options for annotated pages.
    pub render: RenderOptions,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let predict = PredictOptions::default();
        Self {
            canvas_size: DEFAULT_CANVAS_SIZE,
            enhance: EnhanceProfile::default(),
            conf_threshold: predict.conf_threshold,
            iou_threshold: predict.iou_threshold,
            class_agnostic_nms: predict.class_agnostic_nms,
            max_detections: predict.max_detections,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            memory_class: None,
            dpi: DEFAULT_DPI,
            max_rendered_pixels: None,
            output_dir: PathBuf::from("predictions"),
            artifact_format: None,
            render: RenderOptions::default(),
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("canvas_size", &self.canvas_size)
            .field("enhance", &self.enhance)
            .field("conf_threshold", &self.conf_threshold)
            .field("iou_threshold", &self.iou_threshold)
            .field("class_agnostic_nms", &self.class_agnostic_nms)
            .field("max_detections", &self.max_detections)
            .field("cache_capacity", &self.cache_capacity)
            .field("memory_class", &self.memory_class)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("output_dir", &self.output_dir)
            .field("artifact_format", &self.artifact_format)
            .field("render", &self.render)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn DetectionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Options forwarded to the detector on every call.
    pub fn predict_options(&self) -> PredictOptions {
        PredictOptions {
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            class_agnostic_nms: self.class_agnostic_nms,
            max_detections: self.max_detections,
            canvas_size: self.canvas_size,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn canvas_size(mut self, px: u32) -> Self {
        self.config.canvas_size = px.clamp(32, 4096);
        self
    }

    pub fn enhance(mut self, profile: EnhanceProfile) -> Self {
        self.config.enhance = profile;
        self
    }

    pub fn conf_threshold(mut self, t: f32) -> Self {
        self.config.conf_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn iou_threshold(mut self, t: f32) -> Self {
        self.config.iou_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn class_agnostic_nms(mut self, v: bool) -> Self {
        self.config.class_agnostic_nms = v;
        self
    }

    pub fn max_detections(mut self, n: usize) -> Self {
        self.config.max_detections = n.max(1);
        self
    }

    pub fn cache_capacity(mut self, n: usize) -> Self {
        self.config.cache_capacity = n.max(1);
        self
    }

    pub fn memory_class(mut self, class: BackendMemoryClass) -> Self {
        self.config.memory_class = Some(class);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = Some(px.max(100));
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn artifact_format(mut self, format: ArtifactFormat) -> Self {
        self.config.artifact_format = Some(format);
        self
    }

    pub fn render(mut self, opts: RenderOptions) -> Self {
        self.config.render = opts;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DetectError> {
        let c = &self.config;
        if c.canvas_size % 32 != 0 {
            return Err(DetectError::InvalidConfig(format!(
                "canvas size must be a multiple of 32, got {}",
                c.canvas_size
            )));
        }
        if c.output_dir.as_os_str().is_empty() {
            return Err(DetectError::InvalidConfig(
                "output directory must not be empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.render.mask_opacity) {
            return Err(DetectError::InvalidConfig(format!(
                "mask opacity must be 0–1, got {}",
                c.render.mask_opacity
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_detector_training() {
        let c = PipelineConfig::default();
        assert_eq!(c.canvas_size, 1024);
        assert_eq!(c.dpi, 300);
        assert_eq!(c.cache_capacity, 8);
        assert_eq!(c.enhance, EnhanceProfile::Denoise);
        assert_eq!(c.predict_options(), PredictOptions::default());
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .conf_threshold(3.0)
            .iou_threshold(-1.0)
            .cache_capacity(0)
            .dpi(5000)
            .build()
            .unwrap();
        assert_eq!(c.conf_threshold, 1.0);
        assert_eq!(c.iou_threshold, 0.0);
        assert_eq!(c.cache_capacity, 1);
        assert_eq!(c.dpi, 600);
    }

    #[test]
    fn odd_canvas_rejected() {
        let err = PipelineConfig::builder().canvas_size(1000).build().unwrap_err();
        assert!(matches!(err, DetectError::InvalidConfig(_)));
    }

    #[test]
    fn bad_mask_opacity_rejected() {
        let render = RenderOptions {
            mask_opacity: 1.5,
            ..RenderOptions::default()
        };
        assert!(PipelineConfig::builder().render(render).build().is_err());
    }

    #[test]
    fn predict_options_follow_config() {
        let c = PipelineConfig::builder()
            .canvas_size(640)
            .class_agnostic_nms(false)
            .max_detections(10)
            .build()
            .unwrap();
        let o = c.predict_options();
        assert_eq!(o.canvas_size, 640);
        assert!(!o.class_agnostic_nms);
        assert_eq!(o.max_detections, 10);
    }

    #[test]
    fn debug_does_not_require_callback_debug() {
        let s = format!("{:?}", PipelineConfig::default());
        assert!(s.contains("canvas_size"));
    }
}
