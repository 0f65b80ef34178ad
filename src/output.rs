//! Result types: what a document run, a fleet run, and the HTTP surface
//! report back.
//!
//! Everything here is `Serialize + Deserialize`. The process-isolated fleet
//! worker prints a [`DocumentReport`] as one JSON line and the parent parses
//! it back, so these types double as the worker wire format.

use crate::error::PageError;
use crate::pipeline::artifact::{ArtifactFormat, ArtifactPath};
use crate::pipeline::detect::DetectionSet;
use crate::pipeline::letterbox::LetterboxParams;
use serde::{Deserialize, Serialize};

// ── Per-page ─────────────────────────────────────────────────────────────

/// Detections for one page in the shape API clients consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    /// `[x1, y1, x2, y2]` on the detector canvas.
    pub boxes: Vec<[f32; 4]>,
    /// The same boxes mapped onto the original page.
    pub page_boxes: Vec<[f32; 4]>,
    pub classes: Vec<u32>,
    pub confidence: Vec<f32>,
    /// Per-box probability grids at canvas resolution, row-major.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<Vec<Vec<Vec<f32>>>>,
    /// `(width, height)` of the page before letterboxing.
    pub original_size: (u32, u32),
    pub preprocessing_params: LetterboxParams,
}

impl Annotations {
    /// Flatten a detection set. Masks are only carried when `include_masks`
    /// is set and every detection has one.
    pub fn from_set(set: &DetectionSet, include_masks: bool) -> Self {
        let masks = include_masks
            .then(|| {
                set.detections
                    .iter()
                    .map(|d| d.mask.as_ref().map(|m| m.to_rows()))
                    .collect::<Option<Vec<_>>>()
            })
            .flatten()
            .filter(|m| !m.is_empty());

        Self {
            boxes: set.detections.iter().map(|d| d.bbox).collect(),
            page_boxes: set.page_boxes(),
            classes: set.detections.iter().map(|d| d.class_id).collect(),
            confidence: set.detections.iter().map(|d| d.confidence).collect(),
            masks,
            original_size: set.original_size,
            preprocessing_params: set.params,
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// How a single page fared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 1-indexed.
    pub page_num: usize,
    /// `None` when the page failed; it was then written unannotated, or
    /// dropped if its pixels never decoded.
    pub annotations: Option<Annotations>,
    pub error: Option<PageError>,
    pub duration_ms: u64,
}

impl PageOutcome {
    pub fn detections(&self) -> usize {
        self.annotations.as_ref().map_or(0, Annotations::len)
    }
}

// ── Per-document ─────────────────────────────────────────────────────────

/// Counters for one document run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub total_pages: usize,
    /// Pages written with at least one detection drawn.
    pub annotated_pages: usize,
    /// Pages written unchanged: nothing found, or the detector failed.
    pub passthrough_pages: usize,
    /// Pages with a [`PageError`].
    pub failed_pages: usize,
    pub total_detections: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub raster_duration_ms: u64,
    pub detect_duration_ms: u64,
    pub render_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Result of processing one document end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    /// The input as given (path or URL).
    pub document: String,
    pub artifact: ArtifactPath,
    pub format: ArtifactFormat,
    /// In source order.
    pub pages: Vec<PageOutcome>,
    pub stats: DocumentStats,
}

// ── Fleet ────────────────────────────────────────────────────────────────

/// What the fleet learned about one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Completed(DocumentReport),
    Failed { document: String, error: String },
}

impl DocumentOutcome {
    pub fn document(&self) -> &str {
        match self {
            DocumentOutcome::Completed(report) => &report.document,
            DocumentOutcome::Failed { document, .. } => document,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DocumentOutcome::Completed(_))
    }
}

/// Summary of a fleet run. Outcomes are in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetReport {
    pub outcomes: Vec<DocumentOutcome>,
    pub waves: usize,
    pub workers: usize,
    pub duration_ms: u64,
}

impl FleetReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────

/// One entry per uploaded file, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileResult {
    Analyzed {
        filename: String,
        annotations: Annotations,
        /// `/temp/<artifact>` when something was drawn, else `null`.
        visualization_path: Option<String>,
    },
    Failed {
        filename: String,
        error: String,
    },
}

impl FileResult {
    pub fn filename(&self) -> &str {
        match self {
            FileResult::Analyzed { filename, .. } | FileResult::Failed { filename, .. } => filename,
        }
    }
}

/// Body of `POST /analyze`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub results: Vec<FileResult>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mask;
    use crate::pipeline::detect::Detection;

    fn set(with_mask: bool) -> DetectionSet {
        let params = LetterboxParams::compute(200, 100, 100).unwrap();
        DetectionSet {
            detections: vec![Detection {
                bbox: [10.0, 30.0, 50.0, 60.0],
                class_id: 4,
                confidence: 0.5,
                mask: with_mask.then(|| Mask::new(100, 100, vec![0.0; 100 * 100])),
            }],
            params,
            original_size: (200, 100),
            canvas_size: 100,
        }
    }

    #[test]
    fn annotations_map_boxes_to_page() {
        let a = Annotations::from_set(&set(false), true);
        assert_eq!(a.classes, vec![4]);
        // scale 0.5, y offset 25
        assert_eq!(a.page_boxes, vec![[20.0, 10.0, 100.0, 70.0]]);
        assert!(a.masks.is_none());
    }

    #[test]
    fn masks_only_when_asked() {
        assert!(Annotations::from_set(&set(true), false).masks.is_none());
        let a = Annotations::from_set(&set(true), true);
        assert_eq!(a.masks.as_ref().map(|m| m[0].len()), Some(100));
    }

    #[test]
    fn file_result_json_shapes() {
        let ok = FileResult::Analyzed {
            filename: "a.png".into(),
            annotations: Annotations::from_set(&set(false), false),
            visualization_path: None,
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert!(v["visualization_path"].is_null());
        assert_eq!(v["annotations"]["original_size"], serde_json::json!([200, 100]));
        assert!(v["annotations"].get("masks").is_none());

        let failed = FileResult::Failed {
            filename: "b.png".into(),
            error: "bad image".into(),
        };
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["error"], "bad image");
        assert!(v.get("annotations").is_none());
    }

    #[test]
    fn outcome_round_trips_as_worker_line() {
        let outcome = DocumentOutcome::Failed {
            document: "x.pdf".into(),
            error: "boom".into(),
        };
        let line = serde_json::to_string(&outcome).unwrap();
        assert!(line.contains("\"status\":\"failed\""));
        let back: DocumentOutcome = serde_json::from_str(&line).unwrap();
        assert_eq!(back, outcome);
        assert!(!back.is_success());
    }
}
