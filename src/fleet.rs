//! Fleet scheduler: many documents, bounded parallelism, crash isolation.
//!
//! Documents are split into waves of `wave_size`. Within a wave, a fixed
//! pool of workers pulls document paths from a task queue
//! (`tokio::sync::mpsc`) and pushes [`DocumentOutcome`]s onto a result
//! channel as each one finishes. Between waves the shared cache is cleared
//! and backend memory released, so a long run's footprint is bounded by one
//! wave.
//!
//! ## Why two worker modes?
//!
//! [`WorkerMode::Process`] re-invokes the binary as `pdfdetect worker <doc>`:
//! a segfault in pdfium or the inference runtime takes down one child, not
//! the run. [`WorkerMode::InProcess`] runs each document as a Tokio task on a
//! shared [`ServiceContext`]; a panic surfaces as a `JoinError` and fails
//! that document only. It is what library callers and tests use.

use crate::context::ServiceContext;
use crate::document::process_document;
use crate::error::DetectError;
use crate::output::{DocumentOutcome, DocumentReport, FleetReport};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Documents per wave.
pub const DEFAULT_WAVE_SIZE: usize = 6;

/// `min(6, max(4, cpus - 2))`.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(2).clamp(4, 6)
}

/// How a document is isolated from the others.
#[derive(Clone)]
pub enum WorkerMode {
    /// A Tokio task per document on a shared context.
    InProcess(Arc<ServiceContext>),
    /// A child process per document: `<exe> worker <args…> <doc>`, which
    /// prints one JSON [`DocumentReport`] line on stdout.
    Process { exe: PathBuf, args: Vec<String> },
}

impl std::fmt::Debug for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMode::InProcess(_) => f.write_str("InProcess"),
            WorkerMode::Process { exe, args } => f
                .debug_struct("Process")
                .field("exe", exe)
                .field("args", args)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetScheduler {
    mode: WorkerMode,
    wave_size: usize,
    max_workers: Option<usize>,
}

impl FleetScheduler {
    pub fn new(mode: WorkerMode) -> Self {
        Self {
            mode,
            wave_size: DEFAULT_WAVE_SIZE,
            max_workers: None,
        }
    }

    pub fn with_wave_size(mut self, n: usize) -> Self {
        self.wave_size = n.max(1);
        self
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = Some(n.max(1));
        self
    }

    pub fn wave_size(&self) -> usize {
        self.wave_size
    }

    /// Workers per wave; independent of the wave size.
    pub fn worker_count(&self) -> usize {
        let n = default_worker_count();
        self.max_workers.map_or(n, |cap| n.min(cap))
    }

    /// Process every document and return once all have finished.
    pub async fn run(&self, documents: Vec<String>) -> FleetReport {
        let start = Instant::now();
        let waves = documents.len().div_ceil(self.wave_size);
        let outcomes: Vec<DocumentOutcome> = self.run_stream(documents).collect().await;

        let report = FleetReport {
            outcomes,
            waves,
            workers: self.worker_count(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Fleet complete: {} succeeded, {} failed, {} wave(s) in {}ms",
            report.succeeded(),
            report.failed(),
            report.waves,
            report.duration_ms
        );
        report
    }

    /// Process every document, yielding outcomes as they finish.
    ///
    /// Completion order is not submission order.
    pub fn run_stream(&self, documents: Vec<String>) -> ReceiverStream<DocumentOutcome> {
        let (result_tx, result_rx) = mpsc::channel(self.wave_size.max(1));
        let mode = self.mode.clone();
        let wave_size = self.wave_size;
        let workers = self.worker_count();

        tokio::spawn(async move {
            let total_waves = documents.len().div_ceil(wave_size);
            for (idx, wave) in documents.chunks(wave_size).enumerate() {
                info!(
                    "Wave {}/{}: {} document(s), {} worker(s)",
                    idx + 1,
                    total_waves,
                    wave.len(),
                    workers.min(wave.len())
                );
                run_wave(&mode, wave.to_vec(), workers, &result_tx).await;

                if let WorkerMode::InProcess(ctx) = &mode {
                    ctx.release();
                }
                if result_tx.is_closed() {
                    debug!("Fleet consumer went away, stopping after wave {}", idx + 1);
                    break;
                }
            }
        });

        ReceiverStream::new(result_rx)
    }
}

async fn run_wave(
    mode: &WorkerMode,
    wave: Vec<String>,
    workers: usize,
    results: &mpsc::Sender<DocumentOutcome>,
) {
    let (task_tx, task_rx) = mpsc::channel::<String>(wave.len().max(1));
    let worker_total = workers.min(wave.len()).max(1);
    for doc in wave {
        if task_tx.send(doc).await.is_err() {
            break;
        }
    }
    drop(task_tx);

    let queue = Arc::new(Mutex::new(task_rx));
    let handles: Vec<_> = (0..worker_total)
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let mode = mode.clone();
            let results = results.clone();
            tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(document) = next else { break };
                    debug!("Worker {} took {}", worker_id, document);
                    let outcome = dispatch(&mode, document).await;
                    if let DocumentOutcome::Failed { document, error } = &outcome {
                        warn!("{} failed: {}", document, error);
                    }
                    if results.send(outcome).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            warn!("Fleet worker task ended abnormally: {}", e);
        }
    }
}

async fn dispatch(mode: &WorkerMode, document: String) -> DocumentOutcome {
    match mode {
        WorkerMode::InProcess(ctx) => {
            let ctx = Arc::clone(ctx);
            let doc = document.clone();
            let task = tokio::spawn(async move { process_document(&ctx, &doc).await });
            match task.await {
                Ok(Ok(report)) => DocumentOutcome::Completed(report),
                Ok(Err(e)) => DocumentOutcome::Failed {
                    document,
                    error: e.to_string(),
                },
                Err(e) => {
                    let error = DetectError::Worker {
                        document: document.clone(),
                        detail: format!("crashed: {e}"),
                    }
                    .to_string();
                    DocumentOutcome::Failed { document, error }
                }
            }
        }
        WorkerMode::Process { exe, args } => match run_child(exe, args, &document).await {
            Ok(report) => DocumentOutcome::Completed(report),
            Err(e) => DocumentOutcome::Failed {
                document,
                error: e.to_string(),
            },
        },
    }
}

async fn run_child(exe: &Path, args: &[String], document: &str) -> Result<DocumentReport, DetectError> {
    let worker_err = |detail: String| DetectError::Worker {
        document: document.to_string(),
        detail,
    };
    let output = tokio::process::Command::new(exe)
        .arg("worker")
        .args(args)
        .arg(document)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| worker_err(format!("cannot start '{}': {e}", exe.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output");
        return Err(worker_err(format!("exited with {}: {}", output.status, reason.trim())));
    }

    parse_worker_output(&output.stdout, document)
}

/// The last non-empty stdout line must be a [`DocumentReport`].
fn parse_worker_output(stdout: &[u8], document: &str) -> Result<DocumentReport, DetectError> {
    let worker_err = |detail: String| DetectError::Worker {
        document: document.to_string(),
        detail,
    };
    let stdout = String::from_utf8_lossy(stdout);
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| worker_err("produced no report".into()))?;
    serde_json::from_str::<DocumentReport>(line)
        .map_err(|e| worker_err(format!("unreadable report: {e}")))
}
