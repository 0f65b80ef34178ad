//! Progress-callback trait for per-document detection events.
//!
//! Inject an [`Arc<dyn DetectionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow a
//! document through its stages and pages.
//!
//! # Example
//!
//! ```rust
//! use edgequake_detect::{DetectionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl DetectionProgressCallback for PageCounter {
//!     fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _detections: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::document::DocumentStage;
use std::sync::Arc;

/// Called by the orchestrator as a document moves through the pipeline.
///
/// Implementations must be `Send + Sync`: the fleet runs several documents
/// at once and they may share one callback. All methods default to no-ops.
pub trait DetectionProgressCallback: Send + Sync {
    /// Called once the page count is known.
    fn on_document_start(&self, document: &str, total_pages: usize) {
        let _ = (document, total_pages);
    }

    /// Called on every stage transition, including `Failed`.
    fn on_stage(&self, document: &str, stage: &DocumentStage) {
        let _ = (document, stage);
    }

    /// Called when a page has been rendered with its detections.
    ///
    /// # Arguments
    /// * `page_num`: 1-indexed page number
    /// * `total_pages`: total pages in the document
    /// * `detections`: boxes drawn on the page
    fn on_page_complete(&self, page_num: usize, total_pages: usize, detections: usize) {
        let _ = (page_num, total_pages, detections);
    }

    /// Called when a page degraded to passthrough.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after the artifact is written.
    fn on_document_complete(&self, document: &str, total_pages: usize, success_count: usize) {
        let _ = (document, total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl DetectionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn DetectionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Tracking {
        stages: Mutex<Vec<String>>,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl DetectionProgressCallback for Tracking {
        fn on_stage(&self, _document: &str, stage: &DocumentStage) {
            self.stages.lock().unwrap().push(stage.to_string());
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _detections: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_start("a", 3);
        cb.on_stage("a", &DocumentStage::Detecting);
        cb.on_page_complete(1, 3, 4);
        cb.on_page_error(2, 3, "boom");
        cb.on_document_complete("a", 3, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let t = Tracking::default();
        t.on_stage("a", &DocumentStage::Rasterizing);
        t.on_stage("a", &DocumentStage::Failed { page: 2 });
        t.on_page_complete(1, 2, 0);
        t.on_page_error(2, 2, "model");
        assert_eq!(*t.stages.lock().unwrap(), vec!["rasterizing", "failed(page 2)"]);
        assert_eq!(t.completes.load(Ordering::SeqCst), 1);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_document_start("x", 10);
    }
}
