//! # edgequake-detect
//!
//! Batch layout detection for scanned documents: find regions (text blocks,
//! tables, figures, stamps) on every page of a PDF or image with a YOLO-family
//! detector, and write an annotated copy of the document.
//!
//! ## Why letterbox?
//!
//! Detectors are trained on square inputs. Stretching an A4 page onto a
//! square distorts glyph shapes; cropping loses content. Each page is scaled
//! uniformly and padded with white onto a `C×C` canvas, and every box the
//! model returns is mapped back through the exact inverse, so drawings land
//! on the full-resolution page.
//!
//! ## Pipeline Overview
//!
//! ```text
//! documents
//!  │
//!  ├─ Fleet     waves of 6, isolated workers, cache cleared between waves
//!  │   └─ Document
//!  │       ├─ 1. Input      local path or URL, sniff PDF / PNG / JPEG
//!  │       ├─ 2. Raster     pdfium at 300 DPI (spawn_blocking)
//!  │       ├─ 3. Letterbox  enhance + pad onto the canvas, memoised by content
//!  │       ├─ 4. Batch      sizes by page count, capped on unified-memory GPUs
//!  │       ├─ 5. Detect     model seam, per-page errors, validated output
//!  │       ├─ 6. Render     masks, boxes, labels, inverse to page size
//!  │       └─ 7. Write      <output>/<stem>/<stem>-<n>.pdf
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_detect::{process_document, PipelineConfig, ServiceContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Weights from EDGEQUAKE_WEIGHTS, device from EDGEQUAKE_DEVICE.
//!     let config = PipelineConfig::builder().output_dir("predictions").build()?;
//!     let ctx = Arc::new(ServiceContext::from_env(config)?);
//!     let report = process_document(&ctx, "scan.pdf").await?;
//!     println!("wrote {}", report.artifact.path.display());
//!     eprintln!("{} detections on {} pages",
//!         report.stats.total_detections,
//!         report.stats.total_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`    | on  | The `pdfdetect` binary (clap + anyhow + tracing-subscriber + indicatif); implies `server` |
//! | `onnx`   | on  | [`model::onnx::OnnxDetector`] via ONNX Runtime |
//! | `server` | via `cli` | axum HTTP surface: `/analyze`, `/health`, `/temp/{filename}` |
//!
//! Bring your own detector by implementing [`DetectionModel`] and building
//! with `default-features = false`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod fleet;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
#[cfg(feature = "server")]
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use context::{check_weights, ServiceContext};
pub use document::{analyze_files, analyze_image, process_document, DocumentStage};
pub use error::{DetectError, PageError};
pub use fleet::{FleetScheduler, WorkerMode};
pub use model::{DetectionModel, Mask, ModelError, PredictOptions, RawPrediction};
pub use output::{
    AnalyzeResponse, Annotations, DocumentOutcome, DocumentReport, DocumentStats, FileResult,
    FleetReport, HealthResponse, PageOutcome,
};
pub use pipeline::batch::{BackendMemoryClass, Device};
pub use pipeline::letterbox::{EnhanceProfile, LetterboxParams};
pub use progress::{DetectionProgressCallback, NoopProgressCallback, ProgressCallback};
