//! The detector seam.
//!
//! Everything model-specific lives behind [`DetectionModel`]: the pipeline
//! hands it a batch of letterboxed canvases and gets back one
//! [`RawPrediction`] per canvas, in canvas coordinates. Weights format,
//! runtime, and hardware are the implementation's business.
//!
//! [`onnx::OnnxDetector`] (feature `onnx`) is the production implementation.
//! Tests script their own.

pub mod nms;
#[cfg(feature = "onnx")]
pub mod onnx;

use crate::pipeline::batch::Device;
use crate::pipeline::letterbox::DEFAULT_CANVAS_SIZE;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Inference settings forwarded to the detector on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOptions {
    /// Minimum class score kept before NMS. Default: 0.1.
    ///
    /// Layout regions on degraded scans score low; the renderer shows the
    /// confidence so a reader can judge weak boxes.
    pub conf_threshold: f32,
    /// IoU above which the lower-scoring box is suppressed. Default: 0.45.
    pub iou_threshold: f32,
    /// Suppress across classes rather than within each class. Default: true.
    pub class_agnostic_nms: bool,
    /// Cap on detections per canvas after NMS. Default: 50.
    pub max_detections: usize,
    /// Canvas edge the model expects. Default: 1024.
    pub canvas_size: u32,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            conf_threshold: 0.1,
            iou_threshold: 0.45,
            class_agnostic_nms: true,
            max_detections: 50,
            canvas_size: DEFAULT_CANVAS_SIZE,
        }
    }
}

/// Per-pixel instance probabilities at canvas resolution, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Mask {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Probability at `(x, y)`, or 0 outside the mask.
    pub fn get(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.data
            .get((y as usize) * (self.width as usize) + x as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Data length matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == (self.width as usize) * (self.height as usize)
    }

    /// Rows of probabilities, for JSON bodies.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        if self.width == 0 {
            return Vec::new();
        }
        self.data
            .chunks(self.width as usize)
            .map(<[f32]>::to_vec)
            .collect()
    }
}

/// What a detector returned for one canvas.
///
/// Detect-only and segmentation exports differ in shape; both are accepted
/// and normalised by [`crate::pipeline::detect::DetectionAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    /// Nothing found.
    Empty,
    /// Boxes `[x1, y1, x2, y2]` in canvas pixels with parallel class ids and
    /// confidences.
    Boxes {
        boxes: Vec<[f32; 4]>,
        class_ids: Vec<u32>,
        confidences: Vec<f32>,
    },
    /// As `Boxes`, plus one mask per box.
    Segmented {
        boxes: Vec<[f32; 4]>,
        class_ids: Vec<u32>,
        confidences: Vec<f32>,
        masks: Vec<Mask>,
    },
}

impl RawPrediction {
    pub fn len(&self) -> usize {
        match self {
            RawPrediction::Empty => 0,
            RawPrediction::Boxes { boxes, .. } | RawPrediction::Segmented { boxes, .. } => {
                boxes.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised across the detector seam.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Weights missing or rejected by the runtime.
    #[error("failed to load model weights '{path}': {detail}")]
    Load { path: PathBuf, detail: String },

    /// The runtime failed while executing a batch.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The model produced tensors of an unexpected shape.
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// A black-box detector: square canvases in, detections out.
///
/// Implementations must be `Send + Sync`; the orchestrator calls
/// [`predict`](DetectionModel::predict) from a blocking thread while other
/// documents may hold the same `Arc`. Calls for one document are strictly
/// sequential.
pub trait DetectionModel: Send + Sync {
    /// Run the detector over `batch`. On success the result holds exactly one
    /// prediction per input, in input order.
    fn predict(
        &self,
        batch: &[&RgbImage],
        opts: &PredictOptions,
    ) -> Result<Vec<RawPrediction>, ModelError>;

    /// Backend the model runs on; decides the batch memory class.
    fn device(&self) -> Device;

    /// Human-readable identifier for logs and `/health`.
    fn name(&self) -> &str {
        "detector"
    }

    /// Best-effort hint to release cached device memory between batches.
    fn release_memory(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_options_defaults() {
        let o = PredictOptions::default();
        assert_eq!(o.conf_threshold, 0.1);
        assert_eq!(o.iou_threshold, 0.45);
        assert!(o.class_agnostic_nms);
        assert_eq!(o.max_detections, 50);
        assert_eq!(o.canvas_size, 1024);
    }

    #[test]
    fn mask_lookup_and_rows() {
        let m = Mask::new(3, 2, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5]);
        assert!(m.is_well_formed());
        assert_eq!(m.get(2, 1), 0.5);
        assert_eq!(m.get(3, 0), 0.0);
        assert_eq!(m.to_rows(), vec![vec![0.0, 0.1, 0.2], vec![0.3, 0.4, 0.5]]);
    }

    #[test]
    fn raw_prediction_len() {
        assert!(RawPrediction::Empty.is_empty());
        let p = RawPrediction::Boxes {
            boxes: vec![[0.0, 0.0, 1.0, 1.0]; 2],
            class_ids: vec![0, 1],
            confidences: vec![0.9, 0.8],
        };
        assert_eq!(p.len(), 2);
    }
}
