//! Document orchestrator: one document in, one annotated artifact out.
//!
//! ## Stages
//!
//! ```text
//! Rasterizing → Preprocessing → Batching → Detecting → Rendering → Writing → Done
//!                                              │
//!                                              └─ Failed { page }   (page degrades, run continues)
//! any fatal error ─────────────────────────────▶ DocumentFailed
//! ```
//!
//! ## Why pages never fail a document
//!
//! Rasterisation failing outright, encoding, and writing are fatal. Anything
//! that goes wrong for a single page after that (the detector erroring or
//! panicking for its batch, a bad letterbox, a drawing failure) degrades
//! that page to its unannotated original. The artifact always has one page
//! per decodable source page, in source order.
//!
//! CPU-heavy steps (pdfium, letterboxing, inference, drawing, encoding) run
//! on `spawn_blocking` threads. Detection batches run one after another.

use crate::context::ServiceContext;
use crate::error::{DetectError, PageError};
use crate::output::{Annotations, DocumentReport, DocumentStats, FileResult, PageOutcome};
use crate::pipeline::annotate::{self, RenderOptions};
use crate::pipeline::artifact::{self, ArtifactFormat};
use crate::pipeline::batch::batch_ranges;
use crate::pipeline::cache::{fingerprint, CacheEntry};
use crate::pipeline::detect::{DetectionSet, PreparedPage};
use crate::pipeline::input::{self, DocumentKind};
use crate::pipeline::letterbox;
use crate::pipeline::raster;
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Uploaded images decoded at once by [`analyze_files`].
pub const DECODE_CONCURRENCY: usize = 4;

/// Where a document run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DocumentStage {
    Rasterizing,
    Preprocessing,
    Batching,
    Detecting,
    Rendering,
    Writing,
    Done,
    /// A page degraded to passthrough. The run continues.
    Failed { page: usize },
    /// Terminal: the document produced no artifact.
    DocumentFailed,
}

impl fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStage::Rasterizing => f.write_str("rasterizing"),
            DocumentStage::Preprocessing => f.write_str("preprocessing"),
            DocumentStage::Batching => f.write_str("batching"),
            DocumentStage::Detecting => f.write_str("detecting"),
            DocumentStage::Rendering => f.write_str("rendering"),
            DocumentStage::Writing => f.write_str("writing"),
            DocumentStage::Done => f.write_str("done"),
            DocumentStage::Failed { page } => write!(f, "failed(page {page})"),
            DocumentStage::DocumentFailed => f.write_str("document_failed"),
        }
    }
}

fn enter_stage(document: &str, callback: Option<&ProgressCallback>, stage: DocumentStage) {
    debug!(document, %stage, "Stage transition");
    if let Some(cb) = callback {
        cb.on_stage(document, &stage);
    }
}

/// Per-page working state while a document is in flight.
struct PageSlot {
    page_num: usize,
    image: Result<RgbImage, PageError>,
    prepared: Option<PreparedPage>,
    detection: Option<Result<DetectionSet, PageError>>,
    detect_ms: u64,
}

// ── Documents ────────────────────────────────────────────────────────────

/// Detect layout regions on every page of `input` (path or URL) and write
/// the annotated artifact to `<output_dir>/<stem>/<stem>-<n>.<ext>`.
///
/// # Returns
/// `Ok(DocumentReport)` whenever an artifact was written, even if some or
/// all pages degraded to passthrough (see `report.stats.failed_pages`).
///
/// # Errors
/// Fatal errors only: unreadable or unsupported input, a document with no
/// decodable page, encoding or writing the artifact.
pub async fn process_document(
    ctx: &Arc<ServiceContext>,
    input: &str,
) -> Result<DocumentReport, DetectError> {
    let callback = ctx.config().progress_callback.clone();
    match run_document(ctx, input, callback.as_ref()).await {
        Ok(report) => Ok(report),
        Err(e) => {
            warn!("Document '{}' failed: {}", input, e);
            enter_stage(input, callback.as_ref(), DocumentStage::DocumentFailed);
            Err(e)
        }
    }
}

async fn run_document(
    ctx: &Arc<ServiceContext>,
    input_str: &str,
    callback: Option<&ProgressCallback>,
) -> Result<DocumentReport, DetectError> {
    let total_start = Instant::now();
    let config = ctx.config();
    let stage = |s: DocumentStage| enter_stage(input_str, callback, s);
    info!("Processing document: {}", input_str);

    // ── Step 1: Resolve input ────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let stem = resolved.stem();
    let kind = resolved.kind();

    // ── Step 2: Rasterise ────────────────────────────────────────────────
    stage(DocumentStage::Rasterizing);
    let raster_start = Instant::now();
    let raw_pages = rasterize(ctx, resolved.path(), kind).await?;
    let raster_duration_ms = raster_start.elapsed().as_millis() as u64;

    if raw_pages.iter().all(Result::is_err) {
        let detail = raw_pages
            .iter()
            .find_map(|p| p.as_ref().err())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "document has no pages".to_string());
        return Err(DetectError::Rasterization {
            path: resolved.path().to_path_buf(),
            detail,
        });
    }
    let total_pages = raw_pages.len();
    info!("Rasterised {} page(s) in {}ms", total_pages, raster_duration_ms);
    if let Some(cb) = callback {
        cb.on_document_start(input_str, total_pages);
    }

    // ── Step 3: Letterbox through the cache ──────────────────────────────
    stage(DocumentStage::Preprocessing);
    let cache_before = ctx.cache_stats();
    let slots: Vec<PageSlot> = raw_pages
        .into_iter()
        .enumerate()
        .map(|(idx, image)| PageSlot {
            page_num: idx + 1,
            image,
            prepared: None,
            detection: None,
            detect_ms: 0,
        })
        .collect();
    let mut slots = preprocess(ctx, slots).await?;
    let cache_after = ctx.cache_stats();

    // ── Step 4: Plan batches ─────────────────────────────────────────────
    stage(DocumentStage::Batching);
    let ready: Vec<PreparedPage> = slots.iter().filter_map(|s| s.prepared.clone()).collect();
    let adapter = ctx.adapter();
    let ranges = batch_ranges(ready.len(), adapter.memory_class());
    debug!(
        "Planned {} batch(es) for {} page(s): {:?}",
        ranges.len(),
        ready.len(),
        ranges.iter().map(|r| r.len()).collect::<Vec<_>>()
    );

    // ── Step 5: Detect, one batch at a time ──────────────────────────────
    stage(DocumentStage::Detecting);
    let detect_start = Instant::now();
    let opts = config.predict_options();
    for range in ranges {
        let batch: Vec<PreparedPage> = ready[range].to_vec();
        let page_nums: Vec<usize> = batch.iter().map(|p| p.page_num).collect();
        let batch_start = Instant::now();

        let adapter = adapter.clone();
        let opts = opts.clone();
        let results = tokio::task::spawn_blocking(move || adapter.infer(&batch, &opts))
            .await
            .unwrap_or_else(|e| {
                warn!("Detector task failed for pages {:?}: {}", page_nums, e);
                page_nums
                    .iter()
                    .map(|&page| {
                        Err(PageError::ModelInvocation {
                            page,
                            detail: format!("detector task failed: {e}"),
                        })
                    })
                    .collect()
            });
        ctx.model().release_memory();

        let per_page_ms = batch_start.elapsed().as_millis() as u64 / page_nums.len().max(1) as u64;
        for (page_num, result) in page_nums.iter().zip(results) {
            let slot = &mut slots[page_num - 1];
            slot.detection = Some(result);
            slot.detect_ms = per_page_ms;
        }
    }
    let detect_duration_ms = detect_start.elapsed().as_millis() as u64;

    // ── Step 6: Render in source order ───────────────────────────────────
    stage(DocumentStage::Rendering);
    let render_start = Instant::now();
    let render_opts = config.render.clone();
    let document = input_str.to_string();
    let cb = callback.cloned();
    let (rendered, pages) = tokio::task::spawn_blocking(move || {
        render_pages(slots, &render_opts, &document, cb.as_ref())
    })
    .await
    .map_err(|e| DetectError::Internal(format!("render task failed: {e}")))?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;

    // ── Step 7: Encode and write ─────────────────────────────────────────
    stage(DocumentStage::Writing);
    let format = choose_format(config.artifact_format, kind, rendered.len());
    let dir = artifact::document_dir(&config.output_dir, &stem);
    let target = artifact::next_artifact_path(&dir, &stem, format.extension())
        .map_err(|e| DetectError::OutputWriteFailed {
            path: dir.clone(),
            source: e,
        })?;

    let encoder = Arc::clone(ctx.encoder());
    let bytes = tokio::task::spawn_blocking(move || encoder.encode(&rendered, format))
        .await
        .map_err(|e| DetectError::Internal(format!("encoder task failed: {e}")))?
        .map_err(|e| DetectError::Encode {
            path: target.path.clone(),
            detail: e.to_string(),
        })?;

    artifact::write_atomic(&target.path, &bytes)
        .await
        .map_err(|e| DetectError::OutputWriteFailed {
            path: target.path.clone(),
            source: e,
        })?;

    // ── Step 8: Report ───────────────────────────────────────────────────
    let failed = pages.iter().filter(|p| p.error.is_some()).count();
    let annotated = pages
        .iter()
        .filter(|p| p.error.is_none() && p.detections() > 0)
        .count();
    let written = pages
        .iter()
        .filter(|p| !matches!(p.error, Some(PageError::Decode { .. })))
        .count();
    let stats = DocumentStats {
        total_pages,
        annotated_pages: annotated,
        passthrough_pages: written.saturating_sub(annotated),
        failed_pages: failed,
        total_detections: pages.iter().map(PageOutcome::detections).sum(),
        cache_hits: cache_after.hits.saturating_sub(cache_before.hits),
        cache_misses: cache_after.misses.saturating_sub(cache_before.misses),
        raster_duration_ms,
        detect_duration_ms,
        render_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Wrote {} ({} page(s), {} annotated, {} failed) in {}ms",
        target.path.display(),
        written,
        annotated,
        failed,
        stats.total_duration_ms
    );
    stage(DocumentStage::Done);
    if let Some(cb) = callback {
        cb.on_document_complete(input_str, total_pages, total_pages - failed);
    }

    Ok(DocumentReport {
        document: input_str.to_string(),
        artifact: target,
        format,
        pages,
        stats,
    })
}

async fn rasterize(
    ctx: &Arc<ServiceContext>,
    path: &Path,
    kind: DocumentKind,
) -> Result<Vec<Result<RgbImage, PageError>>, DetectError> {
    let path = path.to_path_buf();
    let rasterizer = Arc::clone(ctx.rasterizer());
    tokio::task::spawn_blocking(move || {
        if kind.is_pdf() {
            rasterizer.rasterize(&path)
        } else {
            raster::decode_image(&path)
        }
    })
    .await
    .map_err(|e| DetectError::Internal(format!("rasteriser task failed: {e}")))?
}

async fn preprocess(
    ctx: &Arc<ServiceContext>,
    mut slots: Vec<PageSlot>,
) -> Result<Vec<PageSlot>, DetectError> {
    let ctx = Arc::clone(ctx);
    tokio::task::spawn_blocking(move || {
        for slot in &mut slots {
            let Ok(image) = &slot.image else { continue };
            match prepare_page(&ctx, slot.page_num, image) {
                Ok(prepared) => slot.prepared = Some(prepared),
                Err(e) => {
                    warn!("{}", e);
                    slot.detection = Some(Err(e));
                }
            }
        }
        slots
    })
    .await
    .map_err(|e| DetectError::Internal(format!("preprocess task failed: {e}")))
}

/// Letterbox one page, reusing the cached canvas when the same pixels were
/// seen before.
fn prepare_page(
    ctx: &ServiceContext,
    page_num: usize,
    image: &RgbImage,
) -> Result<PreparedPage, PageError> {
    let config = ctx.config();
    let key = fingerprint(image);
    // The lock covers lookup and insert only; letterboxing runs unlocked.
    let entry = match ctx.with_cache(|cache| cache.get(&key)) {
        Some(hit) => hit,
        None => {
            let (canvas, params) = letterbox::forward(image, config.canvas_size, config.enhance)
                .map_err(|e| PageError::Decode {
                    page: page_num,
                    detail: e.to_string(),
                })?;
            let entry = CacheEntry {
                canvas: Arc::new(canvas),
                params,
            };
            ctx.with_cache(|cache| cache.put(key, entry.clone()));
            entry
        }
    };

    Ok(PreparedPage {
        page_num,
        canvas: entry.canvas,
        params: entry.params,
        original_size: image.dimensions(),
    })
}

/// Draw every page, falling back to the original on any page error.
fn render_pages(
    slots: Vec<PageSlot>,
    opts: &RenderOptions,
    document: &str,
    callback: Option<&ProgressCallback>,
) -> (Vec<RgbImage>, Vec<PageOutcome>) {
    let total = slots.len();
    let mut rendered = Vec::with_capacity(total);
    let mut outcomes = Vec::with_capacity(total);

    for slot in slots {
        let start = Instant::now();
        let page_num = slot.page_num;
        let detection = slot.detection.unwrap_or_else(|| {
            Err(PageError::ModelInvocation {
                page: page_num,
                detail: "page was never scheduled".into(),
            })
        });

        let (annotations, error) = match (slot.image, detection) {
            (Err(e), _) => (None, Some(e)),
            (Ok(image), Err(e)) => {
                rendered.push(image);
                (None, Some(e))
            }
            (Ok(image), Ok(set)) => {
                let annotations = Annotations::from_set(&set, false);
                match annotate::render(&image, &set, opts) {
                    Ok(page) => {
                        rendered.push(page);
                        (Some(annotations), None)
                    }
                    Err(e) => {
                        rendered.push(image);
                        let err = PageError::Render {
                            page: page_num,
                            detail: e.to_string(),
                        };
                        (Some(annotations), Some(err))
                    }
                }
            }
        };

        match &error {
            None => {
                let n = annotations.as_ref().map_or(0, Annotations::len);
                if let Some(cb) = callback {
                    cb.on_page_complete(page_num, total, n);
                }
            }
            Some(e) => {
                enter_stage(document, callback, DocumentStage::Failed { page: page_num });
                if let Some(cb) = callback {
                    cb.on_page_error(page_num, total, &e.to_string());
                }
            }
        }

        outcomes.push(PageOutcome {
            page_num,
            annotations,
            error,
            duration_ms: slot.detect_ms + start.elapsed().as_millis() as u64,
        });
    }
    (rendered, outcomes)
}

/// PDFs stay PDFs and images keep their format unless overridden. Image
/// formats hold one page, so multi-page output falls back to PDF.
fn choose_format(
    configured: Option<ArtifactFormat>,
    kind: DocumentKind,
    pages: usize,
) -> ArtifactFormat {
    let format = configured.unwrap_or(match kind {
        DocumentKind::Pdf => ArtifactFormat::Pdf,
        DocumentKind::Png => ArtifactFormat::Png,
        DocumentKind::Jpeg => ArtifactFormat::Jpeg,
    });
    if format != ArtifactFormat::Pdf && pages > 1 {
        warn!(
            "{:?} holds one page but the document has {}; writing PDF",
            format, pages
        );
        return ArtifactFormat::Pdf;
    }
    format
}

// ── Single images (HTTP surface) ─────────────────────────────────────────

/// Analyse uploaded images. Returns one entry per file, in upload order.
///
/// Decoding fans out over [`DECODE_CONCURRENCY`] blocking threads; detection
/// then runs one image at a time.
pub async fn analyze_files(
    ctx: &Arc<ServiceContext>,
    files: Vec<(String, Vec<u8>)>,
) -> Vec<FileResult> {
    let mut decoded: Vec<(usize, String, Result<RgbImage, String>)> =
        stream::iter(files.into_iter().enumerate().map(|(idx, (filename, bytes))| async move {
            let image = match tokio::task::spawn_blocking(move || raster::decode_image_bytes(&bytes)).await {
                Ok(Ok(image)) => Ok(image),
                Ok(Err(e)) => Err(format!("cannot decode image: {e}")),
                Err(e) => Err(format!("decoder task failed: {e}")),
            };
            (idx, filename, image)
        }))
        .buffer_unordered(DECODE_CONCURRENCY)
        .collect()
        .await;
    decoded.sort_by_key(|(idx, ..)| *idx);

    let mut results = Vec::with_capacity(decoded.len());
    for (_, filename, image) in decoded {
        let result = match image {
            Ok(image) => analyze_decoded(ctx, filename, image).await,
            Err(error) => {
                warn!("{}: {}", filename, error);
                FileResult::Failed { filename, error }
            }
        };
        results.push(result);
    }
    results
}

/// Analyse a single uploaded image.
pub async fn analyze_image(ctx: &Arc<ServiceContext>, filename: &str, bytes: Vec<u8>) -> FileResult {
    analyze_files(ctx, vec![(filename.to_string(), bytes)])
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| FileResult::Failed {
            filename: filename.to_string(),
            error: "no result produced".into(),
        })
}

async fn analyze_decoded(ctx: &Arc<ServiceContext>, filename: String, image: RgbImage) -> FileResult {
    let failed = |filename: String, error: String| {
        warn!("{}: {}", filename, error);
        FileResult::Failed { filename, error }
    };

    let job_ctx = Arc::clone(ctx);
    let job = tokio::task::spawn_blocking(move || -> Result<(DetectionSet, Option<RgbImage>), PageError> {
        let prepared = prepare_page(&job_ctx, 1, &image)?;
        let opts = job_ctx.config().predict_options();
        let detected = job_ctx
            .adapter()
            .infer(std::slice::from_ref(&prepared), &opts)
            .into_iter()
            .next();
        // A detector failure reads as "nothing found" for this upload.
        let set = match detected {
            Some(Ok(set)) => set,
            Some(Err(e)) => {
                warn!("{}; reporting no detections", e);
                DetectionSet::empty(prepared.params, prepared.original_size, prepared.canvas.width())
            }
            None => {
                warn!("Detector returned nothing for page 1; reporting no detections");
                DetectionSet::empty(prepared.params, prepared.original_size, prepared.canvas.width())
            }
        };
        if set.is_empty() {
            return Ok((set, None));
        }
        let rendered = annotate::render(&image, &set, &job_ctx.config().render).map_err(|e| {
            PageError::Render {
                page: 1,
                detail: e.to_string(),
            }
        })?;
        Ok((set, Some(rendered)))
    });

    let (set, rendered) = match job.await {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => return failed(filename, e.to_string()),
        Err(e) => return failed(filename, format!("detector task failed: {e}")),
    };
    let annotations = Annotations::from_set(&set, true);

    let Some(rendered) = rendered else {
        return FileResult::Analyzed {
            filename,
            annotations,
            visualization_path: None,
        };
    };

    match write_visualization(ctx, &filename, rendered).await {
        Ok(name) => FileResult::Analyzed {
            filename,
            annotations,
            visualization_path: Some(format!("/temp/{name}")),
        },
        Err(e) => failed(filename, e.to_string()),
    }
}

/// Encode and store a rendered upload; returns the artifact's file name.
async fn write_visualization(
    ctx: &Arc<ServiceContext>,
    filename: &str,
    rendered: RgbImage,
) -> Result<String, DetectError> {
    let config = ctx.config();
    let upload = Path::new(filename);
    let stem = upload
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && !s.starts_with('.'))
        .unwrap_or_else(|| "upload".to_string());
    let format = config
        .artifact_format
        .filter(|f| *f != ArtifactFormat::Pdf)
        .or_else(|| {
            upload
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ArtifactFormat::from_extension)
                .filter(|f| *f != ArtifactFormat::Pdf)
        })
        .unwrap_or(ArtifactFormat::Png);

    let dir = artifact::document_dir(&config.output_dir, &stem);
    let target = artifact::next_artifact_path(&dir, &stem, format.extension())
        .map_err(|e| DetectError::OutputWriteFailed { path: dir, source: e })?;

    let encoder = Arc::clone(ctx.encoder());
    let bytes = tokio::task::spawn_blocking(move || encoder.encode(std::slice::from_ref(&rendered), format))
        .await
        .map_err(|e| DetectError::Internal(format!("encoder task failed: {e}")))?
        .map_err(|e| DetectError::Encode {
            path: target.path.clone(),
            detail: e.to_string(),
        })?;
    artifact::write_atomic(&target.path, &bytes)
        .await
        .map_err(|e| DetectError::OutputWriteFailed {
            path: target.path.clone(),
            source: e,
        })?;

    debug!("Visualization for {} → {}", filename, target.path.display());
    Ok(format!("{}-{}.{}", stem, target.sequence, format.extension()))
}
