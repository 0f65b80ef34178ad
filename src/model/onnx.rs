//! ONNX Runtime detector for YOLOv8-family layout exports.
//!
//! Accepted output layouts:
//!
//! | Export | Output 0 | Output 1 |
//! |--------|----------|----------|
//! | detect | `[B, 4+nc, A]` (cx, cy, w, h, class scores) | – |
//! | segment | `[B, 4+nc+32, A]` (… plus mask coefficients) | protos `[B, 32, mh, mw]` |
//! | end-to-end (NMS in graph) | `[B, N, 6]` (x1, y1, x2, y2, score, class) | – |
//!
//! Decoding is done by free functions over flat `f32` slices so it can be
//! tested without a model file.

use super::nms::{non_max_suppression, Candidate};
use super::{DetectionModel, Mask, ModelError, PredictOptions, RawPrediction};
use crate::pipeline::batch::Device;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Number of mask coefficients a YOLOv8-seg head emits per anchor.
const MASK_COEFFS: usize = 32;

/// A YOLOv8 detect/segment model served by ONNX Runtime.
pub struct OnnxDetector {
    session: Mutex<Session>,
    device: Device,
    name: String,
}

impl OnnxDetector {
    /// Load weights from `path`.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ModelError::Load {
                path: path.to_path_buf(),
                detail: "file not found".into(),
            });
        }
        info!("Loading detector weights from {} ({})", path.display(), device);

        let load_err = |detail: String| ModelError::Load {
            path: PathBuf::from(path),
            detail,
        };
        let session = Session::builder()
            .map_err(|e| load_err(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| load_err(e.to_string()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        debug!("Detector '{}' ready", name);

        Ok(Self {
            session: Mutex::new(session),
            device,
            name,
        })
    }
}

impl DetectionModel for OnnxDetector {
    fn predict(
        &self,
        batch: &[&RgbImage],
        opts: &PredictOptions,
    ) -> Result<Vec<RawPrediction>, ModelError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let input = to_nchw(batch, opts.canvas_size)?;
        let input = Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;

        // Copy tensors out while the session lock is held; outputs borrow it.
        let (head, protos) = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| ModelError::Inference(format!("session lock poisoned: {e}")))?;
            let outputs = session
                .run(ort::inputs![input])
                .map_err(|e| ModelError::Inference(e.to_string()))?;

            let head = extract(&outputs[0])?;
            let protos = if outputs.len() > 1 {
                Some(extract(&outputs[1])?)
            } else {
                None
            };
            (head, protos)
        };

        (0..batch.len())
            .map(|b| decode(&head, protos.as_ref(), b, opts))
            .collect()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An owned output tensor.
#[derive(Debug, Clone)]
pub struct OwnedTensor {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

fn extract(value: &ort::value::DynValue) -> Result<OwnedTensor, ModelError> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| ModelError::Output(format!("failed to extract tensor: {e}")))?;
    Ok(OwnedTensor {
        dims: shape.iter().map(|&d| d.max(0) as usize).collect(),
        data: data.to_vec(),
    })
}

/// Stack canvases into a `[B, 3, C, C]` tensor scaled to `[0, 1]`.
fn to_nchw(batch: &[&RgbImage], canvas_size: u32) -> Result<Array4<f32>, ModelError> {
    let c = canvas_size as usize;
    let mut input = Array4::<f32>::zeros((batch.len(), 3, c, c));
    for (b, img) in batch.iter().enumerate() {
        if img.dimensions() != (canvas_size, canvas_size) {
            return Err(ModelError::Inference(format!(
                "canvas {} is {}x{}, model expects {c}x{c}",
                b,
                img.width(),
                img.height()
            )));
        }
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[b, 0, y, x]] = f32::from(pixel[0]) / 255.0;
            input[[b, 1, y, x]] = f32::from(pixel[1]) / 255.0;
            input[[b, 2, y, x]] = f32::from(pixel[2]) / 255.0;
        }
    }
    Ok(input)
}

/// Decode image `b` of a batch from the head (and optional protos).
pub fn decode(
    head: &OwnedTensor,
    protos: Option<&OwnedTensor>,
    b: usize,
    opts: &PredictOptions,
) -> Result<RawPrediction, ModelError> {
    if head.dims.len() != 3 {
        return Err(ModelError::Output(format!(
            "expected 3-D detection head, got {:?}",
            head.dims
        )));
    }
    if b >= head.dims[0] {
        return Err(ModelError::Output(format!(
            "batch index {b} out of range for head {:?}",
            head.dims
        )));
    }
    if head.dims[2] == 6 && head.dims[1] != 6 {
        decode_end_to_end(head, b, opts)
    } else {
        decode_raw_head(head, protos, b, opts)
    }
}

fn decode_end_to_end(
    head: &OwnedTensor,
    b: usize,
    opts: &PredictOptions,
) -> Result<RawPrediction, ModelError> {
    let n = head.dims[1];
    let rows = &head.data[b * n * 6..(b + 1) * n * 6];

    let mut boxes = Vec::new();
    let mut class_ids = Vec::new();
    let mut confidences = Vec::new();
    for row in rows.chunks_exact(6) {
        if row[4] < opts.conf_threshold || boxes.len() >= opts.max_detections {
            continue;
        }
        boxes.push([row[0], row[1], row[2], row[3]]);
        confidences.push(row[4]);
        class_ids.push(row[5].max(0.0) as u32);
    }
    if boxes.is_empty() {
        return Ok(RawPrediction::Empty);
    }
    Ok(RawPrediction::Boxes {
        boxes,
        class_ids,
        confidences,
    })
}

fn decode_raw_head(
    head: &OwnedTensor,
    protos: Option<&OwnedTensor>,
    b: usize,
    opts: &PredictOptions,
) -> Result<RawPrediction, ModelError> {
    let (features, anchors) = (head.dims[1], head.dims[2]);
    let coeffs = if protos.is_some() { MASK_COEFFS } else { 0 };
    if features <= 4 + coeffs {
        return Err(ModelError::Output(format!(
            "head has {features} features, need more than {}",
            4 + coeffs
        )));
    }
    let num_classes = features - 4 - coeffs;
    let base = b * features * anchors;
    let data = &head.data[base..base + features * anchors];
    let feature = |f: usize, a: usize| data[f * anchors + a];

    let mut candidates = Vec::new();
    let mut anchor_of = Vec::new();
    for a in 0..anchors {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, feature(4 + c, a)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < opts.conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (feature(0, a), feature(1, a), feature(2, a), feature(3, a));
        candidates.push(Candidate {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            class_id: class_id as u32,
            score,
        });
        anchor_of.push(a);
    }

    let keep = non_max_suppression(
        &candidates,
        opts.iou_threshold,
        opts.class_agnostic_nms,
        opts.max_detections,
    );
    if keep.is_empty() {
        return Ok(RawPrediction::Empty);
    }

    let boxes: Vec<[f32; 4]> = keep.iter().map(|&i| candidates[i].bbox).collect();
    let class_ids = keep.iter().map(|&i| candidates[i].class_id).collect();
    let confidences = keep.iter().map(|&i| candidates[i].score).collect();

    let Some(protos) = protos else {
        return Ok(RawPrediction::Boxes {
            boxes,
            class_ids,
            confidences,
        });
    };

    let masks = keep
        .iter()
        .map(|&i| {
            let a = anchor_of[i];
            let coeffs: Vec<f32> = (0..MASK_COEFFS)
                .map(|k| feature(4 + num_classes + k, a))
                .collect();
            build_mask(protos, b, &coeffs, &candidates[i].bbox, opts.canvas_size)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawPrediction::Segmented {
        boxes,
        class_ids,
        confidences,
        masks,
    })
}

/// `sigmoid(coeffs · protos)`, bilinearly upsampled to the canvas and zeroed
/// outside `bbox`.
fn build_mask(
    protos: &OwnedTensor,
    b: usize,
    coeffs: &[f32],
    bbox: &[f32; 4],
    canvas_size: u32,
) -> Result<Mask, ModelError> {
    if protos.dims.len() != 4 || protos.dims[1] != coeffs.len() || b >= protos.dims[0] {
        return Err(ModelError::Output(format!(
            "unexpected proto shape {:?}",
            protos.dims
        )));
    }
    let (k, mh, mw) = (protos.dims[1], protos.dims[2], protos.dims[3]);
    let plane = mh * mw;
    let base = b * k * plane;

    let mut low = vec![0.0f32; plane];
    for (j, &c) in coeffs.iter().enumerate() {
        let p = &protos.data[base + j * plane..base + (j + 1) * plane];
        for (dst, &v) in low.iter_mut().zip(p) {
            *dst += c * v;
        }
    }
    for v in low.iter_mut() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }

    let size = canvas_size as usize;
    let mut data = vec![0.0f32; size * size];
    let x0 = bbox[0].max(0.0).floor() as usize;
    let y0 = bbox[1].max(0.0).floor() as usize;
    let x1 = (bbox[2].max(0.0).ceil() as usize).min(size);
    let y1 = (bbox[3].max(0.0).ceil() as usize).min(size);
    let sx = mw as f32 / size as f32;
    let sy = mh as f32 / size as f32;

    for y in y0..y1 {
        let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (mh - 1) as f32);
        let (ya, yb, ty) = (fy.floor() as usize, (fy.floor() as usize + 1).min(mh - 1), fy.fract());
        for x in x0..x1 {
            let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (mw - 1) as f32);
            let (xa, xb, tx) = (fx.floor() as usize, (fx.floor() as usize + 1).min(mw - 1), fx.fract());
            let top = low[ya * mw + xa] * (1.0 - tx) + low[ya * mw + xb] * tx;
            let bottom = low[yb * mw + xa] * (1.0 - tx) + low[yb * mw + xb] * tx;
            data[y * size + x] = top * (1.0 - ty) + bottom * ty;
        }
    }

    Ok(Mask::new(canvas_size, canvas_size, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `[1, 4+nc, A]` head from per-anchor `(cx, cy, w, h, scores…)` rows.
    fn head(rows: &[Vec<f32>]) -> OwnedTensor {
        let features = rows[0].len();
        let anchors = rows.len();
        let mut data = vec![0.0; features * anchors];
        for (a, row) in rows.iter().enumerate() {
            for (f, &v) in row.iter().enumerate() {
                data[f * anchors + a] = v;
            }
        }
        OwnedTensor {
            dims: vec![1, features, anchors],
            data,
        }
    }

    #[test]
    fn raw_head_thresholds_and_suppresses() {
        let h = head(&[
            vec![50.0, 50.0, 20.0, 20.0, 0.9, 0.0],
            vec![51.0, 50.0, 20.0, 20.0, 0.7, 0.1],
            vec![200.0, 200.0, 10.0, 10.0, 0.0, 0.05],
            vec![300.0, 100.0, 40.0, 10.0, 0.2, 0.6],
        ]);
        let pred = decode(&h, None, 0, &PredictOptions::default()).unwrap();
        match pred {
            RawPrediction::Boxes {
                boxes,
                class_ids,
                confidences,
            } => {
                assert_eq!(class_ids, vec![0, 1]);
                assert_eq!(confidences, vec![0.9, 0.6]);
                assert_eq!(boxes[0], [40.0, 40.0, 60.0, 60.0]);
                assert_eq!(boxes[1], [280.0, 95.0, 320.0, 105.0]);
            }
            other => panic!("expected boxes, got {other:?}"),
        }
    }

    #[test]
    fn nothing_above_threshold_is_empty() {
        let h = head(&[vec![10.0, 10.0, 5.0, 5.0, 0.01, 0.02]]);
        assert_eq!(
            decode(&h, None, 0, &PredictOptions::default()).unwrap(),
            RawPrediction::Empty
        );
    }

    #[test]
    fn end_to_end_head_is_passed_through() {
        let head = OwnedTensor {
            dims: vec![1, 3, 6],
            data: vec![
                1.0, 2.0, 30.0, 40.0, 0.8, 3.0, //
                5.0, 5.0, 9.0, 9.0, 0.05, 1.0, //
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            ],
        };
        match decode(&head, None, 0, &PredictOptions::default()).unwrap() {
            RawPrediction::Boxes {
                boxes, class_ids, ..
            } => {
                assert_eq!(boxes, vec![[1.0, 2.0, 30.0, 40.0]]);
                assert_eq!(class_ids, vec![3]);
            }
            other => panic!("expected boxes, got {other:?}"),
        }
    }

    #[test]
    fn segment_head_builds_canvas_masks_clipped_to_box() {
        // One class, one anchor, coefficient 0 set high; proto plane 0 all ones.
        let mut row = vec![8.0, 8.0, 8.0, 8.0, 0.9];
        row.extend(std::iter::once(10.0).chain(std::iter::repeat(0.0).take(MASK_COEFFS - 1)));
        let h = head(&[row]);
        let (mh, mw) = (4, 4);
        let mut protos = vec![0.0; MASK_COEFFS * mh * mw];
        protos[..mh * mw].fill(1.0);
        let protos = OwnedTensor {
            dims: vec![1, MASK_COEFFS, mh, mw],
            data: protos,
        };
        let opts = PredictOptions {
            canvas_size: 16,
            ..PredictOptions::default()
        };

        match decode(&h, Some(&protos), 0, &opts).unwrap() {
            RawPrediction::Segmented { masks, boxes, .. } => {
                assert_eq!(boxes, vec![[4.0, 4.0, 12.0, 12.0]]);
                let m = &masks[0];
                assert_eq!((m.width, m.height), (16, 16));
                assert!(m.get(8, 8) > 0.99);
                assert_eq!(m.get(1, 1), 0.0);
                assert_eq!(m.get(13, 8), 0.0);
            }
            other => panic!("expected segmented, got {other:?}"),
        }
    }

    #[test]
    fn malformed_head_is_an_error() {
        let bad = OwnedTensor {
            dims: vec![1, 84],
            data: vec![0.0; 84],
        };
        assert!(matches!(
            decode(&bad, None, 0, &PredictOptions::default()),
            Err(ModelError::Output(_))
        ));
    }

    #[test]
    fn missing_weights_fail_to_load() {
        let err = OnnxDetector::load("/nonexistent/best.onnx", Device::Cpu)
            .err()
            .expect("load should fail");
        assert!(matches!(err, ModelError::Load { .. }));
    }
}
