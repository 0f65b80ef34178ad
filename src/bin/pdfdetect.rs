//! CLI binary for edgequake-detect.
//!
//! A thin shim over the library crate: maps CLI flags to `PipelineConfig`,
//! drives the fleet or the HTTP server, and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_detect::fleet::{FleetScheduler, WorkerMode, DEFAULT_WAVE_SIZE};
use edgequake_detect::pipeline::annotate::{LabelMode, RenderOptions};
use edgequake_detect::pipeline::artifact::ArtifactFormat;
use edgequake_detect::server::{start_server, ApiState};
use edgequake_detect::{
    check_weights, process_document, BackendMemoryClass, DetectionProgressCallback, Device,
    DocumentOutcome, DocumentStage, EnhanceProfile, FleetReport, PipelineConfig, ProgressCallback,
    ServiceContext,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress using indicatif ─────────────────────────────────────────────

/// One bar over documents. In-process runs also feed it stage transitions
/// and page failures through [`DetectionProgressCallback`].
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new(total_documents: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total_documents as u64);
        bar.set_style(style);
        bar.set_prefix("Detecting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn document_done(&self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Completed(report) => {
                let s = &report.stats;
                self.bar.println(format!(
                    "  {} {}  {}  {}  →  {}",
                    green("✓"),
                    report.document,
                    dim(&format!("{} pages, {} detections", s.total_pages, s.total_detections)),
                    dim(&format!("{:.1}s", s.total_duration_ms as f64 / 1000.0)),
                    bold(&report.artifact.path.display().to_string()),
                ));
            }
            DocumentOutcome::Failed { document, error } => {
                let msg = truncate(error, 100);
                self.bar
                    .println(format!("  {} {}  {}", red("✗"), document, red(&msg)));
            }
        }
        self.bar.inc(1);
    }
}

impl DetectionProgressCallback for CliProgressCallback {
    fn on_stage(&self, document: &str, stage: &DocumentStage) {
        if !matches!(stage, DocumentStage::Failed { .. }) {
            self.bar.set_message(format!("{} {}", short_name(document), dim(&stage.to_string())));
        }
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        self.bar.println(format!(
            "    {} page {:>3}/{:<3}  {}",
            cyan("⚠"),
            page_num,
            total_pages,
            dim(&truncate(error, 80)),
        ));
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        s.to_string()
    }
}

fn short_name(document: &str) -> &str {
    document.rsplit(['/', '\\']).next().unwrap_or(document)
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Annotate every document in a folder (isolated worker processes)
  pdfdetect run scans/ -o predictions

  # A few files, in-process, smaller waves
  pdfdetect run --in-process --wave-size 2 a.pdf b.pdf c.png

  # Binarise faded scans before detection, label class and score
  pdfdetect run --enhance binarize --labels both archive/

  # HTTP API on port 8000
  pdfdetect serve --addr 0.0.0.0:8000

OUTPUT:
  <output>/<stem>/<stem>-<n>.pdf   n = highest existing + 1, never overwritten

ENVIRONMENT VARIABLES:
  EDGEQUAKE_WEIGHTS   Detector weights (.onnx). Required.
  EDGEQUAKE_DEVICE    cuda | mps | cpu. mps caps detector calls at 2 pages.
  PDFIUM_LIB_PATH     Path to libpdfium (file or directory)
  RUST_LOG            Override log filter (e.g. edgequake_detect=debug)
"#;

/// Detect layout regions on scanned documents and write annotated copies.
#[derive(Parser, Debug)]
#[command(
    name = "pdfdetect",
    version,
    about = "Detect layout regions on scanned PDFs and images",
    long_about = "Letterbox every page onto the detector canvas, run a YOLO-family layout \
detector in adaptive batches, and write an annotated, full-resolution copy of each document.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EDGEQUAKE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EDGEQUAKE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process documents (files, folders, URLs) in waves.
    Run(RunArgs),

    /// Process one document and print its JSON report. Used by `run`.
    #[command(hide = true)]
    Worker {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        document: String,
    },

    /// Serve POST /analyze, GET /health, GET /temp/{filename}.
    Serve {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Listen address.
        #[arg(long, env = "EDGEQUAKE_ADDR", default_value = "0.0.0.0:8000")]
        addr: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// PDF / PNG / JPEG files, folders of them, or HTTP(S) URLs.
    #[arg(required = true)]
    documents: Vec<String>,

    #[command(flatten)]
    model: ModelArgs,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Documents per wave; memory is released between waves.
    #[arg(long, env = "EDGEQUAKE_WAVE_SIZE", default_value_t = DEFAULT_WAVE_SIZE)]
    wave_size: usize,

    /// Cap on concurrent workers (default: min(6, max(4, cpus-2))).
    #[arg(long, env = "EDGEQUAKE_WORKERS")]
    workers: Option<usize>,

    /// Run documents as tasks in this process instead of child processes.
    #[arg(long, env = "EDGEQUAKE_IN_PROCESS")]
    in_process: bool,

    /// Print the fleet report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "EDGEQUAKE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Detector weights (.onnx).
    #[arg(long, env = "EDGEQUAKE_WEIGHTS")]
    weights: Option<PathBuf>,

    /// Compute backend: cuda, mps, cpu.
    #[arg(long, env = "EDGEQUAKE_DEVICE")]
    device: Option<Device>,
}

#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// Artifact root directory.
    #[arg(short, long, env = "EDGEQUAKE_OUTPUT", default_value = "predictions")]
    output: PathBuf,

    /// Detector canvas edge in pixels (multiple of 32).
    #[arg(long, env = "EDGEQUAKE_CANVAS", default_value_t = 1024)]
    canvas: u32,

    /// Minimum detection confidence (0–1).
    #[arg(long, env = "EDGEQUAKE_CONF", default_value_t = 0.1)]
    conf: f32,

    /// NMS IoU threshold (0–1).
    #[arg(long, env = "EDGEQUAKE_IOU", default_value_t = 0.45)]
    iou: f32,

    /// Rasterisation DPI for PDFs (72–600).
    #[arg(long, env = "EDGEQUAKE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Page treatment before detection.
    #[arg(long, env = "EDGEQUAKE_ENHANCE", value_enum, default_value = "denoise")]
    enhance: EnhanceArg,

    /// Label drawn next to each box.
    #[arg(long, env = "EDGEQUAKE_LABELS", value_enum, default_value = "confidence")]
    labels: LabelArg,

    /// TrueType font for labels (default: probe system fonts).
    #[arg(long, env = "EDGEQUAKE_FONT")]
    font: Option<PathBuf>,

    /// Artifact format (default: PDF for PDFs, same format for images).
    #[arg(long, env = "EDGEQUAKE_FORMAT", value_enum)]
    format: Option<FormatArg>,

    /// Letterboxed canvases kept in memory.
    #[arg(long, env = "EDGEQUAKE_CACHE", default_value_t = 8)]
    cache: usize,

    /// Cap every detector call at this many pages, whatever the device.
    #[arg(long, env = "EDGEQUAKE_MAX_BATCH")]
    max_batch: Option<usize>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "EDGEQUAKE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EnhanceArg {
    None,
    Denoise,
    Binarize,
}

impl From<EnhanceArg> for EnhanceProfile {
    fn from(v: EnhanceArg) -> Self {
        match v {
            EnhanceArg::None => EnhanceProfile::None,
            EnhanceArg::Denoise => EnhanceProfile::Denoise,
            EnhanceArg::Binarize => EnhanceProfile::Binarize,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LabelArg {
    None,
    Class,
    Confidence,
    Both,
}

impl From<LabelArg> for LabelMode {
    fn from(v: LabelArg) -> Self {
        match v {
            LabelArg::None => LabelMode::None,
            LabelArg::Class => LabelMode::ClassId,
            LabelArg::Confidence => LabelMode::Confidence,
            LabelArg::Both => LabelMode::Both,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Pdf,
    Png,
    Jpeg,
}

impl From<FormatArg> for ArtifactFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Pdf => ArtifactFormat::Pdf,
            FormatArg::Png => ArtifactFormat::Png,
            FormatArg::Jpeg => ArtifactFormat::Jpeg,
        }
    }
}

impl ModelArgs {
    /// Flags that reproduce these args in a child worker.
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(w) = &self.weights {
            args.extend(["--weights".to_string(), w.display().to_string()]);
        }
        if let Some(d) = self.device {
            args.extend(["--device".to_string(), d.to_string()]);
        }
        args
    }

    /// Validate the weights without loading them.
    fn check(&self) -> Result<()> {
        let Some(weights) = &self.weights else {
            anyhow::bail!(
                "No detector weights given.\nSet EDGEQUAKE_WEIGHTS=/path/to/model.onnx or pass --weights."
            );
        };
        check_weights(weights).context("Cannot start workers")?;
        Ok(())
    }

    fn load(&self, config: PipelineConfig) -> Result<ServiceContext> {
        let device = self.device.unwrap_or_else(Device::detect);
        let weights = match &self.weights {
            Some(w) => w.clone(),
            None => anyhow::bail!(
                "No detector weights given.\nSet EDGEQUAKE_WEIGHTS=/path/to/model.onnx or pass --weights."
            ),
        };
        ServiceContext::from_weights(&weights, device, config)
            .with_context(|| format!("Failed to load detector from {}", weights.display()))
    }
}

impl PipelineArgs {
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output".to_string(),
            self.output.display().to_string(),
            "--canvas".to_string(),
            self.canvas.to_string(),
            "--conf".to_string(),
            self.conf.to_string(),
            "--iou".to_string(),
            self.iou.to_string(),
            "--dpi".to_string(),
            self.dpi.to_string(),
            "--enhance".to_string(),
            value_name(&self.enhance),
            "--labels".to_string(),
            value_name(&self.labels),
            "--cache".to_string(),
            self.cache.to_string(),
            "--download-timeout".to_string(),
            self.download_timeout.to_string(),
        ];
        if let Some(f) = &self.font {
            args.extend(["--font".to_string(), f.display().to_string()]);
        }
        if let Some(f) = &self.format {
            args.extend(["--format".to_string(), value_name(f)]);
        }
        if let Some(n) = self.max_batch {
            args.extend(["--max-batch".to_string(), n.to_string()]);
        }
        args
    }

    fn build_config(&self, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
        let render = RenderOptions {
            label: self.labels.into(),
            ..RenderOptions::default()
        };
        let render = match (&self.font, self.labels) {
            (_, LabelArg::None) => render,
            (Some(path), _) => render
                .with_font_path(path)
                .with_context(|| format!("Failed to load font {}", path.display()))?,
            (None, _) => render.with_system_font(),
        };

        let mut builder = PipelineConfig::builder()
            .output_dir(&self.output)
            .canvas_size(self.canvas)
            .conf_threshold(self.conf)
            .iou_threshold(self.iou)
            .dpi(self.dpi)
            .enhance(self.enhance.into())
            .cache_capacity(self.cache)
            .render(render)
            .download_timeout_secs(self.download_timeout);

        if let Some(f) = self.format {
            builder = builder.artifact_format(f.into());
        }
        if let Some(n) = self.max_batch {
            builder = builder.memory_class(BackendMemoryClass::Constrained { ceiling: n });
        }
        if let Some(cb) = progress {
            builder = builder.progress_callback(cb);
        }
        builder.build().context("Invalid configuration")
    }
}

fn value_name<T: clap::ValueEnum>(v: &T) -> String {
    v.to_possible_value()
        .map(|p| p.get_name().to_string())
        .unwrap_or_default()
}

/// Expand folders to the documents directly inside them, sorted by name.
fn expand_documents(inputs: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if !path.is_dir() {
            out.push(input.clone());
            continue;
        }
        let mut found: Vec<String> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .and_then(ArtifactFormat::from_extension)
                        .is_some()
            })
            .map(|p| p.display().to_string())
            .collect();
        found.sort();
        out.extend(found);
    }
    Ok(out)
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args, cli.verbose, cli.quiet).await,
        Command::Worker {
            model,
            pipeline,
            document,
        } => {
            // stdout carries the report; logs stay on stderr.
            init_logging(if cli.verbose { "debug" } else { "warn" });
            let ctx = Arc::new(model.load(pipeline.build_config(None)?)?);
            let report = process_document(&ctx, &document)
                .await
                .with_context(|| format!("Failed to process {document}"))?;
            println!(
                "{}",
                serde_json::to_string(&report).context("Failed to serialise report")?
            );
            Ok(())
        }
        Command::Serve {
            model,
            pipeline,
            addr,
        } => {
            init_logging(if cli.verbose {
                "debug"
            } else if cli.quiet {
                "error"
            } else {
                "info,tower_http=info"
            });
            let ctx = Arc::new(model.load(pipeline.build_config(None)?)?);
            start_server(&addr, ApiState::new(ctx))
                .await
                .with_context(|| format!("Server on {addr} stopped"))
        }
    }
}

async fn run(args: RunArgs, verbose: bool, quiet: bool) -> Result<()> {
    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar is the feedback when it is on; keep library logs to
    // errors unless asked.
    let show_progress = !quiet && !args.no_progress && !args.json;
    let filter = if verbose {
        "debug"
    } else if quiet || show_progress {
        "error"
    } else {
        "info"
    };
    init_logging(filter);

    let documents = expand_documents(&args.documents)?;
    if documents.is_empty() {
        anyhow::bail!("No PDF, PNG, or JPEG documents found in the given inputs");
    }

    let cli_progress = show_progress.then(|| CliProgressCallback::new(documents.len()));

    // ── Build the fleet ──────────────────────────────────────────────────
    let mode = if args.in_process {
        let cb = cli_progress
            .clone()
            .map(|cb| cb as Arc<dyn DetectionProgressCallback>);
        let config = args.pipeline.build_config(cb)?;
        WorkerMode::InProcess(Arc::new(args.model.load(config)?))
    } else {
        // Validate flags here so a typo fails once, not once per child.
        args.pipeline.build_config(None)?;
        args.model.check()?;
        let exe = std::env::current_exe().context("Cannot locate the pdfdetect executable")?;
        let mut child_args = args.model.to_args();
        child_args.extend(args.pipeline.to_args());
        if verbose {
            child_args.push("--verbose".to_string());
        }
        WorkerMode::Process {
            exe,
            args: child_args,
        }
    };

    let mut fleet = FleetScheduler::new(mode).with_wave_size(args.wave_size);
    if let Some(n) = args.workers {
        fleet = fleet.with_max_workers(n);
    }

    if !quiet && !args.json {
        let msg = format!(
            "Processing {} document(s) in waves of {} with {} worker(s)…",
            documents.len(),
            fleet.wave_size(),
            fleet.worker_count()
        );
        match &cli_progress {
            Some(p) => p.bar.println(format!("{} {}", cyan("◆"), bold(&msg))),
            None => eprintln!("{msg}"),
        }
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let start = Instant::now();
    let waves = documents.len().div_ceil(fleet.wave_size());
    let mut stream = fleet.run_stream(documents);
    let mut outcomes = Vec::new();
    while let Some(outcome) = stream.next().await {
        match &cli_progress {
            Some(p) => p.document_done(&outcome),
            None if !quiet && !args.json => match &outcome {
                DocumentOutcome::Completed(r) => {
                    eprintln!("ok     {} → {}", r.document, r.artifact.path.display())
                }
                DocumentOutcome::Failed { document, error } => {
                    eprintln!("FAILED {document}: {error}")
                }
            },
            None => {}
        }
        outcomes.push(outcome);
    }

    let report = FleetReport {
        outcomes,
        waves,
        workers: fleet.worker_count(),
        duration_ms: start.elapsed().as_millis() as u64,
    };

    if let Some(p) = &cli_progress {
        p.bar.finish_and_clear();
    }

    // ── Summary ──────────────────────────────────────────────────────────
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        let (ok, failed) = (report.succeeded(), report.failed());
        eprintln!(
            "{} {}/{} documents  {} wave(s)  {:.1}s{}",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&ok.to_string()),
            ok + failed,
            report.waves,
            report.duration_ms as f64 / 1000.0,
            if failed > 0 {
                format!("  ({} failed)", red(&failed.to_string()))
            } else {
                String::new()
            },
        );
    }

    if report.succeeded() == 0 && !report.outcomes.is_empty() {
        anyhow::bail!("Every document failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_mode_refuses_missing_weights_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let args = ModelArgs {
            weights: Some(dir.path().join("missing.onnx")),
            device: None,
        };
        let err = args.check().unwrap_err();
        assert!(format!("{err:#}").contains("missing.onnx"), "{err:#}");

        let none = ModelArgs {
            weights: None,
            device: None,
        };
        assert!(none.check().is_err());

        let weights = dir.path().join("model.onnx");
        std::fs::write(&weights, b"onnx").unwrap();
        let ok = ModelArgs {
            weights: Some(weights),
            device: None,
        };
        assert!(ok.check().is_ok());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["pdfdetect", "run", "a.pdf", "--wave-size", "3"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.documents, vec!["a.pdf".to_string()]);
                assert_eq!(args.wave_size, 3);
            }
            _ => panic!("expected run"),
        }
    }
}
