//! Detection adapter: drive the model over a batch and normalise its output.
//!
//! The model may fail, panic, return the wrong number of results, or emit
//! degenerate boxes. None of that is allowed to escape as a document error:
//! every input canvas gets exactly one `Result<DetectionSet, PageError>`, in
//! input order, and a failure only taints the sub-batch it happened in.

use crate::error::PageError;
use crate::model::{DetectionModel, Mask, PredictOptions, RawPrediction};
use crate::pipeline::batch::{plan_sub_batches, BackendMemoryClass};
use crate::pipeline::letterbox::{self, LetterboxParams};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// One detected region in canvas coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in canvas pixels, `x1 < x2` and `y1 < y2`.
    pub bbox: [f32; 4],
    pub class_id: u32,
    /// In `[0, 1]`.
    pub confidence: f32,
    /// Instance mask at canvas resolution, if the model segments.
    pub mask: Option<Mask>,
}

/// All detections for one page plus the geometry needed to map them back.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
    pub detections: Vec<Detection>,
    pub params: LetterboxParams,
    /// Page size before letterboxing.
    pub original_size: (u32, u32),
    /// Edge of the square canvas the boxes refer to.
    pub canvas_size: u32,
}

impl DetectionSet {
    pub fn empty(params: LetterboxParams, original_size: (u32, u32), canvas_size: u32) -> Self {
        Self {
            detections: Vec::new(),
            params,
            original_size,
            canvas_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Boxes mapped onto the original page.
    pub fn page_boxes(&self) -> Vec<[f32; 4]> {
        self.detections
            .iter()
            .map(|d| letterbox::inverse_box(d.bbox, &self.params, self.original_size))
            .collect()
    }
}

/// A page ready for the detector.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    /// 1-indexed.
    pub page_num: usize,
    pub canvas: Arc<RgbImage>,
    pub params: LetterboxParams,
    pub original_size: (u32, u32),
}

/// Wraps a [`DetectionModel`] with sub-batching, fault isolation, and output
/// validation.
#[derive(Clone)]
pub struct DetectionAdapter {
    model: Arc<dyn DetectionModel>,
    memory_class: Option<BackendMemoryClass>,
}

impl DetectionAdapter {
    pub fn new(model: Arc<dyn DetectionModel>) -> Self {
        Self {
            model,
            memory_class: None,
        }
    }

    /// Use `class` instead of the one implied by the model's device.
    pub fn with_memory_class(mut self, class: Option<BackendMemoryClass>) -> Self {
        self.memory_class = class;
        self
    }

    /// Memory class that decides sub-batch sizes.
    pub fn memory_class(&self) -> BackendMemoryClass {
        self.memory_class
            .unwrap_or_else(|| self.model.device().memory_class())
    }

    pub fn model(&self) -> &Arc<dyn DetectionModel> {
        &self.model
    }

    /// Detect on every page in `batch`. The output has the same length and
    /// order as the input.
    ///
    /// Blocking: call from `spawn_blocking`.
    pub fn infer(
        &self,
        batch: &[PreparedPage],
        opts: &PredictOptions,
    ) -> Vec<Result<DetectionSet, PageError>> {
        let class = self.memory_class();
        let mut out = Vec::with_capacity(batch.len());
        let mut start = 0;

        for len in plan_sub_batches(batch.len(), class) {
            let chunk = &batch[start..start + len];
            start += len;
            out.extend(self.infer_sub_batch(chunk, opts));
        }
        out
    }

    fn infer_sub_batch(
        &self,
        chunk: &[PreparedPage],
        opts: &PredictOptions,
    ) -> Vec<Result<DetectionSet, PageError>> {
        let canvases: Vec<&RgbImage> = chunk.iter().map(|p| p.canvas.as_ref()).collect();
        debug!(
            "Detector call: {} canvas(es), pages {:?}",
            canvases.len(),
            chunk.iter().map(|p| p.page_num).collect::<Vec<_>>()
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| self.model.predict(&canvases, opts)));
        let predictions = match outcome {
            Ok(Ok(preds)) if preds.len() == chunk.len() => preds,
            Ok(Ok(preds)) => {
                return fail_all(
                    chunk,
                    format!(
                        "model returned {} results for {} inputs",
                        preds.len(),
                        chunk.len()
                    ),
                )
            }
            Ok(Err(e)) => return fail_all(chunk, e.to_string()),
            Err(panic) => return fail_all(chunk, format!("model panicked: {}", panic_message(&*panic))),
        };

        chunk
            .iter()
            .zip(predictions)
            .map(|(page, raw)| normalise(page, raw))
            .collect()
    }
}

fn fail_all(chunk: &[PreparedPage], detail: String) -> Vec<Result<DetectionSet, PageError>> {
    warn!(
        "Detector failed for {} page(s), passing them through unannotated: {}",
        chunk.len(),
        detail
    );
    chunk
        .iter()
        .map(|p| {
            Err(PageError::ModelInvocation {
                page: p.page_num,
                detail: detail.clone(),
            })
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Validate one raw prediction and attach page geometry.
fn normalise(page: &PreparedPage, raw: RawPrediction) -> Result<DetectionSet, PageError> {
    let (cw, ch) = page.canvas.dimensions();
    let mut set = DetectionSet::empty(page.params, page.original_size, cw);

    let (boxes, class_ids, confidences, masks) = match raw {
        RawPrediction::Empty => return Ok(set),
        RawPrediction::Boxes {
            boxes,
            class_ids,
            confidences,
        } => (boxes, class_ids, confidences, None),
        RawPrediction::Segmented {
            boxes,
            class_ids,
            confidences,
            masks,
        } => (boxes, class_ids, confidences, Some(masks)),
    };

    let n = boxes.len();
    if class_ids.len() != n || confidences.len() != n || masks.as_ref().is_some_and(|m| m.len() != n) {
        return Err(PageError::ModelInvocation {
            page: page.page_num,
            detail: format!(
                "ragged prediction: {} boxes, {} classes, {} confidences, {} masks",
                n,
                class_ids.len(),
                confidences.len(),
                masks.as_ref().map_or(0, Vec::len)
            ),
        });
    }

    let mut masks = masks.map(Vec::into_iter);
    let mut dropped = 0usize;
    for ((bbox, class_id), confidence) in boxes.into_iter().zip(class_ids).zip(confidences) {
        let mask = masks.as_mut().and_then(Iterator::next);

        if !bbox.iter().all(|v| v.is_finite()) || bbox[0] >= bbox[2] || bbox[1] >= bbox[3] {
            dropped += 1;
            continue;
        }
        if confidence.is_nan() {
            dropped += 1;
            continue;
        }
        let mask = mask.filter(|m| m.width == cw && m.height == ch && m.is_well_formed());

        set.detections.push(Detection {
            bbox,
            class_id,
            confidence: confidence.clamp(0.0, 1.0),
            mask,
        });
    }

    if dropped > 0 {
        debug!("Page {}: dropped {} degenerate detection(s)", page.page_num, dropped);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;
    use crate::pipeline::batch::Device;
    use std::sync::Mutex;

    /// Replays a scripted response per call and records batch sizes.
    struct Scripted {
        device: Device,
        calls: Mutex<Vec<usize>>,
        respond: Box<dyn Fn(usize, usize) -> Result<Vec<RawPrediction>, ModelError> + Send + Sync>,
    }

    impl Scripted {
        fn new(
            device: Device,
            respond: impl Fn(usize, usize) -> Result<Vec<RawPrediction>, ModelError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                device,
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }
    }

    impl DetectionModel for Scripted {
        fn predict(
            &self,
            batch: &[&RgbImage],
            _opts: &PredictOptions,
        ) -> Result<Vec<RawPrediction>, ModelError> {
            let mut calls = self.calls.lock().unwrap();
            let call_idx = calls.len();
            calls.push(batch.len());
            drop(calls);
            (self.respond)(call_idx, batch.len())
        }

        fn device(&self) -> Device {
            self.device
        }
    }

    fn pages(n: usize) -> Vec<PreparedPage> {
        (1..=n)
            .map(|page_num| PreparedPage {
                page_num,
                canvas: Arc::new(RgbImage::new(64, 64)),
                params: LetterboxParams {
                    scale: 0.5,
                    x_offset: 0,
                    y_offset: 16,
                },
                original_size: (128, 64),
            })
            .collect()
    }

    fn one_box(conf: f32) -> RawPrediction {
        RawPrediction::Boxes {
            boxes: vec![[4.0, 20.0, 30.0, 40.0]],
            class_ids: vec![2],
            confidences: vec![conf],
        }
    }

    #[test]
    fn constrained_device_is_called_in_small_sub_batches() {
        let model = Scripted::new(Device::Mps, |_, n| Ok(vec![RawPrediction::Empty; n]));
        let adapter = DetectionAdapter::new(model.clone());
        let out = adapter.infer(&pages(5), &PredictOptions::default());
        assert_eq!(out.len(), 5);
        assert_eq!(*model.calls.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn standard_device_gets_whole_batch() {
        let model = Scripted::new(Device::Cuda, |_, n| Ok(vec![RawPrediction::Empty; n]));
        let adapter = DetectionAdapter::new(model.clone());
        adapter.infer(&pages(6), &PredictOptions::default());
        assert_eq!(*model.calls.lock().unwrap(), vec![6]);
    }

    #[test]
    fn memory_class_override_beats_device() {
        let model = Scripted::new(Device::Cuda, |_, n| Ok(vec![RawPrediction::Empty; n]));
        let adapter = DetectionAdapter::new(model.clone())
            .with_memory_class(Some(BackendMemoryClass::Constrained { ceiling: 3 }));
        adapter.infer(&pages(7), &PredictOptions::default());
        assert_eq!(*model.calls.lock().unwrap(), vec![3, 3, 1]);
    }

    #[test]
    fn model_error_taints_only_its_sub_batch() {
        let model = Scripted::new(Device::Mps, |call, n| {
            if call == 1 {
                Err(ModelError::Inference("out of memory".into()))
            } else {
                Ok(vec![one_box(0.8); n])
            }
        });
        let out = DetectionAdapter::new(model).infer(&pages(4), &PredictOptions::default());
        assert!(out[0].is_ok() && out[1].is_ok());
        for (i, r) in out[2..].iter().enumerate() {
            match r {
                Err(PageError::ModelInvocation { page, detail }) => {
                    assert_eq!(*page, i + 3);
                    assert!(detail.contains("out of memory"));
                }
                other => panic!("expected ModelInvocation, got {other:?}"),
            }
        }
    }

    #[test]
    fn wrong_result_count_fails_every_item() {
        let model = Scripted::new(Device::Cpu, |_, _| Ok(vec![RawPrediction::Empty]));
        let out = DetectionAdapter::new(model).infer(&pages(3), &PredictOptions::default());
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| matches!(r, Err(PageError::ModelInvocation { .. }))));
    }

    #[test]
    fn panicking_model_is_contained() {
        let model = Scripted::new(Device::Cpu, |_, _| panic!("kernel exploded"));
        let out = DetectionAdapter::new(model).infer(&pages(2), &PredictOptions::default());
        match &out[0] {
            Err(PageError::ModelInvocation { detail, .. }) => assert!(detail.contains("kernel exploded")),
            other => panic!("expected ModelInvocation, got {other:?}"),
        }
    }

    #[test]
    fn degenerate_boxes_dropped_and_confidence_clamped() {
        let model = Scripted::new(Device::Cpu, |_, _| {
            Ok(vec![RawPrediction::Boxes {
                boxes: vec![
                    [10.0, 10.0, 5.0, 20.0],
                    [0.0, 0.0, 10.0, 10.0],
                    [1.0, 1.0, 2.0, f32::NAN],
                ],
                class_ids: vec![0, 1, 2],
                confidences: vec![0.9, 1.7, 0.5],
            }])
        });
        let out = DetectionAdapter::new(model).infer(&pages(1), &PredictOptions::default());
        let set = out[0].as_ref().unwrap();
        assert_eq!(set.detections.len(), 1);
        assert_eq!(set.detections[0].class_id, 1);
        assert_eq!(set.detections[0].confidence, 1.0);
    }

    #[test]
    fn mask_with_wrong_resolution_is_dropped() {
        let model = Scripted::new(Device::Cpu, |_, _| {
            Ok(vec![RawPrediction::Segmented {
                boxes: vec![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 20.0, 20.0]],
                class_ids: vec![0, 1],
                confidences: vec![0.9, 0.8],
                masks: vec![
                    Mask::new(64, 64, vec![1.0; 64 * 64]),
                    Mask::new(32, 32, vec![1.0; 32 * 32]),
                ],
            }])
        });
        let out = DetectionAdapter::new(model).infer(&pages(1), &PredictOptions::default());
        let set = out[0].as_ref().unwrap();
        assert!(set.detections[0].mask.is_some());
        assert!(set.detections[1].mask.is_none());
    }

    #[test]
    fn ragged_prediction_is_a_page_error() {
        let model = Scripted::new(Device::Cpu, |_, _| {
            Ok(vec![RawPrediction::Boxes {
                boxes: vec![[0.0, 0.0, 1.0, 1.0]],
                class_ids: vec![],
                confidences: vec![0.5],
            }])
        });
        let out = DetectionAdapter::new(model).infer(&pages(1), &PredictOptions::default());
        assert!(matches!(out[0], Err(PageError::ModelInvocation { page: 1, .. })));
    }

    #[test]
    fn page_boxes_are_mapped_back() {
        let model = Scripted::new(Device::Cpu, |_, n| Ok(vec![one_box(0.7); n]));
        let out = DetectionAdapter::new(model).infer(&pages(1), &PredictOptions::default());
        let set = out[0].as_ref().unwrap();
        // scale 0.5, y_offset 16: [4,20,30,40] → [8,8,60,48]
        assert_eq!(set.page_boxes(), vec![[8.0, 8.0, 60.0, 48.0]]);
    }
}
