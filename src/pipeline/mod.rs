//! Pipeline stages for document layout detection.
//!
//! Each submodule implements one transformation step and is testable on its
//! own; the orchestration lives in [`crate::document`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ raster ──▶ letterbox ⇄ cache ──▶ batch ──▶ detect ──▶ annotate ──▶ artifact
//! (path/URL) (pdfium)   (canvas C×C)          (sizes)   (model)    (draw+invert)  (versioned file)
//! ```
//!
//! 1. [`input`]: resolve a path or URL, sniff PDF / PNG / JPEG
//! 2. [`raster`]: render PDF pages at 300 DPI (`spawn_blocking`)
//! 3. [`letterbox`]: enhance, scale, and pad onto the detector canvas
//! 4. [`cache`]: bounded memo of canvases keyed by page content
//! 5. [`batch`]: batch and sub-batch sizes per backend memory class
//! 6. [`detect`]: drive the model, isolate failures, validate output
//! 7. [`annotate`]: draw boxes, masks, labels; map back to full size
//! 8. [`artifact`]: encode and write `<stem>/<stem>-<n>.<ext>`

pub mod annotate;
pub mod artifact;
pub mod batch;
pub mod cache;
pub mod detect;
pub mod input;
pub mod letterbox;
pub mod raster;
