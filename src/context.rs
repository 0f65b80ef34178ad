//! Process-wide state shared by every document run.
//!
//! A [`ServiceContext`] is built once at startup (CLI `run`/`worker`/`serve`,
//! or a library caller) and passed around as `Arc<ServiceContext>`. It owns
//! the loaded detector, the rasteriser and encoder seams, the run
//! configuration, and the preprocess cache. There are no globals: the HTTP
//! handlers receive it through axum `State`.

use crate::config::PipelineConfig;
use crate::error::DetectError;
use crate::model::DetectionModel;
use crate::pipeline::artifact::{ArtifactEncoder, DefaultEncoder};
use crate::pipeline::cache::{CacheStats, PreprocessCache};
use crate::pipeline::detect::DetectionAdapter;
use crate::pipeline::raster::{PdfiumRasterizer, Rasterizer};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Fail fast when `path` is not a readable weights file.
///
/// Process-isolated fleets call this in the parent so a bad path stops the
/// run before any child starts.
pub fn check_weights(path: &Path) -> Result<(), DetectError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        DetectError::Startup(format!("detector weights '{}': {e}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(DetectError::Startup(format!(
            "detector weights '{}' is not a file",
            path.display()
        )));
    }
    std::fs::File::open(path).map_err(|e| {
        DetectError::Startup(format!("detector weights '{}': {e}", path.display()))
    })?;
    Ok(())
}

pub struct ServiceContext {
    model: Arc<dyn DetectionModel>,
    rasterizer: Arc<dyn Rasterizer>,
    encoder: Arc<dyn ArtifactEncoder>,
    config: PipelineConfig,
    cache: Mutex<PreprocessCache>,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("model", &self.model.name())
            .field("device", &self.model.device())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    /// Wrap an already-loaded model. Rasterisation and encoding use pdfium
    /// at the configured DPI.
    pub fn new(model: Arc<dyn DetectionModel>, config: PipelineConfig) -> Self {
        let rasterizer = PdfiumRasterizer {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
        };
        let encoder = DefaultEncoder { dpi: config.dpi };
        Self {
            model,
            rasterizer: Arc::new(rasterizer),
            encoder: Arc::new(encoder),
            cache: Mutex::new(PreprocessCache::new(config.cache_capacity)),
            config,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn ArtifactEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Load the ONNX detector named by `EDGEQUAKE_WEIGHTS` on the device
    /// named by `EDGEQUAKE_DEVICE`.
    ///
    /// # Errors
    /// [`DetectError::Startup`] when the variable is unset or the weights
    /// cannot be loaded.
    #[cfg(feature = "onnx")]
    pub fn from_env(config: PipelineConfig) -> Result<Self, DetectError> {
        let weights = std::env::var("EDGEQUAKE_WEIGHTS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                DetectError::Startup(
                    "EDGEQUAKE_WEIGHTS is not set; point it at the detector's .onnx weights".into(),
                )
            })?;
        Self::from_weights(
            Path::new(&weights),
            crate::pipeline::batch::Device::detect(),
            config,
        )
    }

    /// Load the ONNX detector from an explicit weights file.
    #[cfg(feature = "onnx")]
    pub fn from_weights(
        weights: &Path,
        device: crate::pipeline::batch::Device,
        config: PipelineConfig,
    ) -> Result<Self, DetectError> {
        check_weights(weights)?;
        let model = crate::model::onnx::OnnxDetector::load(weights, device)
            .map_err(|e| DetectError::Startup(e.to_string()))?;
        Ok(Self::new(Arc::new(model), config))
    }

    pub fn model(&self) -> &Arc<dyn DetectionModel> {
        &self.model
    }

    pub fn rasterizer(&self) -> &Arc<dyn Rasterizer> {
        &self.rasterizer
    }

    pub fn encoder(&self) -> &Arc<dyn ArtifactEncoder> {
        &self.encoder
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Adapter over the model, honouring any configured memory class.
    pub fn adapter(&self) -> DetectionAdapter {
        DetectionAdapter::new(Arc::clone(&self.model)).with_memory_class(self.config.memory_class)
    }

    /// Run `f` with the cache locked.
    ///
    /// A panic in another holder does not make the cache unusable; its
    /// contents are only memoised canvases.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut PreprocessCache) -> R) -> R {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut cache)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.with_cache(|c| c.stats())
    }

    pub fn clear_cache(&self) {
        self.with_cache(PreprocessCache::clear);
    }

    /// Drop cached canvases and ask the backend to free device memory.
    pub fn release(&self) {
        self.clear_cache();
        self.model.release_memory();
        debug!("Released preprocess cache and backend memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelError, PredictOptions, RawPrediction};
    use crate::pipeline::batch::{BackendMemoryClass, Device};
    use crate::pipeline::cache::{fingerprint, CacheEntry};
    use crate::pipeline::letterbox::LetterboxParams;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Idle {
        releases: AtomicUsize,
    }

    impl DetectionModel for Idle {
        fn predict(
            &self,
            batch: &[&RgbImage],
            _opts: &PredictOptions,
        ) -> Result<Vec<RawPrediction>, ModelError> {
            Ok(vec![RawPrediction::Empty; batch.len()])
        }

        fn device(&self) -> Device {
            Device::Mps
        }

        fn release_memory(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry() -> CacheEntry {
        CacheEntry {
            canvas: Arc::new(RgbImage::new(4, 4)),
            params: LetterboxParams {
                scale: 1.0,
                x_offset: 0,
                y_offset: 0,
            },
        }
    }

    #[test]
    fn release_clears_cache_and_notifies_model() {
        let model = Arc::new(Idle::default());
        let ctx = ServiceContext::new(model.clone(), PipelineConfig::default());
        ctx.with_cache(|c| c.put(fingerprint(&RgbImage::new(2, 2)), entry()));
        assert_eq!(ctx.with_cache(|c| c.len()), 1);

        ctx.release();
        assert_eq!(ctx.with_cache(|c| c.len()), 0);
        assert_eq!(model.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adapter_uses_configured_memory_class() {
        let config = PipelineConfig::builder()
            .memory_class(BackendMemoryClass::Standard)
            .build()
            .unwrap();
        let ctx = ServiceContext::new(Arc::new(Idle::default()), config);
        assert_eq!(ctx.adapter().memory_class(), BackendMemoryClass::Standard);

        let ctx = ServiceContext::new(Arc::new(Idle::default()), PipelineConfig::default());
        assert_eq!(ctx.adapter().memory_class(), BackendMemoryClass::constrained());
    }

    #[test]
    fn weights_check_rejects_missing_paths_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let missing = check_weights(&dir.path().join("best.onnx")).unwrap_err();
        assert!(matches!(missing, DetectError::Startup(ref m) if m.contains("best.onnx")));

        let not_file = check_weights(dir.path()).unwrap_err();
        assert!(matches!(not_file, DetectError::Startup(ref m) if m.contains("not a file")));

        let weights = dir.path().join("model.onnx");
        std::fs::write(&weights, b"onnx").unwrap();
        assert!(check_weights(&weights).is_ok());
    }

    #[cfg(feature = "onnx")]
    #[test]
    fn missing_weights_is_startup_error() {
        let err = ServiceContext::from_weights(
            std::path::Path::new("/no/such/weights.onnx"),
            Device::Cpu,
            PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DetectError::Startup(_)), "got {err:?}");
    }
}
