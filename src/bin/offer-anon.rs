//! CLI binary for offer-anonymizer.
//!
//! A thin shim over the library: maps flags to `PipelineConfig`, keeps jobs
//! in `{storage}/jobs/` and prints results.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use offer_anonymizer::{
    inspect, Action, Block, Classifier, ClassifierError, DigitalTwin, FsStorage, Job,
    JobPipeline, JobStatus, JobStore, JobWorker, Mode, NormBox, ParseOutcome, PdfiumRasterizer,
    PipelineConfig, PipelineObserver, Replacement, SharedObserver, Storage, StorageJobStore,
    VisionClassifier, WorkerConfig, WorkerEvent,
};
use offer_anonymizer::job::{FindingsReport, SectionsReport};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Renders job progress (0–100) as a bar and prints advisories above it.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Job");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineObserver for CliObserver {
    fn on_status(&self, _job_id: Uuid, status: JobStatus) {
        self.bar.set_message(status.to_string());
    }

    fn on_progress(&self, _job_id: Uuid, progress: u8) {
        self.bar.set_position(progress as u64);
    }

    fn on_advisory(&self, _job_id: Uuid, message: &str) {
        self.bar.println(format!("  {} {}", yellow("!"), message));
    }

    fn on_failed(&self, _job_id: Uuid, error: &str) {
        self.bar.println(format!("  {} {}", red("✗"), error));
    }
}

/// Stands in for the classifier when no provider is configured, so commands
/// that never analyse (render, edits, status) still work without an API key.
struct MissingProvider(String);

impl MissingProvider {
    fn unreachable(&self) -> ClassifierError {
        ClassifierError::Unreachable(format!("no classifier provider configured: {}", self.0))
    }
}

#[async_trait]
impl Classifier for MissingProvider {
    async fn detect_sections(
        &self,
        _images: &[Vec<u8>],
    ) -> Result<ParseOutcome<SectionsReport>, ClassifierError> {
        Err(self.unreachable())
    }

    async fn detect_findings(
        &self,
        _images: &[Vec<u8>],
    ) -> Result<ParseOutcome<FindingsReport>, ClassifierError> {
        Err(self.unreachable())
    }

    async fn extract_structured(
        &self,
        _images: &[Vec<u8>],
        _filename: &str,
    ) -> Result<ParseOutcome<DigitalTwin>, ClassifierError> {
        Err(self.unreachable())
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Upload, analyse and stop at review
  offer-anon run oferta.pdf --mode layout

  # Upload, analyse and render with the suggested actions
  offer-anon run oferta.pdf --render

  # Override decisions, then render
  offer-anon decide <JOB> finding_001=keep finding_004=mask
  offer-anon render <JOB>

  # Edit the document during review
  offer-anon replace <JOB> --find "Salon Auto Kowalski" --replace "Dealer"
  offer-anon delete-pages <JOB> 2,0
  offer-anon delete-block <JOB> --page 0 --bbox 0,0,100,10

  # Inspect a PDF (no API key needed)
  offer-anon inspect oferta.pdf

  # Process queued jobs until Ctrl-C
  offer-anon worker

ENVIRONMENT VARIABLES:
  ANON_STORAGE_PATH        Storage root (default ./storage)
  ANON_MAX_FILE_SIZE_MB    Upload size cap (default 30)
  ANON_MAX_ANALYSIS_PAGES  Pages sent to the classifier (default 30)
  EDGEQUAKE_LLM_PROVIDER   Provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL          Model ID
  PDFIUM_LIB_PATH          Directory containing libpdfium
"#;

/// Anonymize vehicle-offer PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "offer-anon",
    version,
    about = "Anonymize vehicle-offer PDFs with a vision classifier and true content redaction",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Storage root for uploads, artifacts, outputs and job records.
    #[arg(long, global = true, env = "ANON_STORAGE_PATH", default_value = "./storage")]
    storage: PathBuf,

    /// LLM model ID.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Upload size cap in megabytes.
    #[arg(long, global = true, env = "ANON_MAX_FILE_SIZE_MB", default_value_t = 30)]
    max_file_size_mb: u64,

    /// Pages sent to the classifier.
    #[arg(long, global = true, env = "ANON_MAX_ANALYSIS_PAGES", default_value_t = 30)]
    max_analysis_pages: usize,

    /// Classifier render DPI (36–600).
    #[arg(long, global = true, env = "ANON_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(36..=600))]
    dpi: u32,

    /// Directory containing the pdfium shared library.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Print jobs as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a PDF and analyse it.
    Run {
        input: PathBuf,
        #[arg(long, value_enum, default_value = "unify")]
        mode: ModeArg,
        /// Render straight away with the suggested actions.
        #[arg(long)]
        render: bool,
    },
    /// Print page count, page sizes and whether the PDF looks scanned.
    Inspect { input: PathBuf },
    /// Print a job.
    Status { job: Uuid },
    /// List all jobs.
    List,
    /// Record decisions as `id=remove|mask|keep`.
    Decide {
        job: Uuid,
        #[arg(required = true)]
        decisions: Vec<String>,
    },
    /// Apply decisions and write the anonymized outputs.
    Render { job: Uuid },
    /// List text lines and images with their boxes, to pick edit targets.
    Blocks {
        job: Uuid,
        /// 0-indexed page; all pages when omitted.
        #[arg(long)]
        page: Option<usize>,
    },
    /// Re-queue a job (anything but queued or done) and process it again.
    Retry { job: Uuid },
    /// Replace (or with an empty --replace, delete) literal text.
    Replace {
        job: Uuid,
        #[arg(long)]
        find: String,
        #[arg(long, default_value = "")]
        replace: String,
        /// 0-indexed page; all pages when omitted.
        #[arg(long)]
        page: Option<usize>,
    },
    /// Remove whole pages (0-indexed, comma separated).
    DeletePages {
        job: Uuid,
        #[arg(value_delimiter = ',', required = true)]
        pages: Vec<usize>,
    },
    /// Remove the content inside a box given as x,y,w,h percentages.
    DeleteBlock {
        job: Uuid,
        #[arg(long)]
        page: usize,
        #[arg(long, value_delimiter = ',', num_args = 4)]
        bbox: Vec<f64>,
    },
    /// Pin (or with --off, unpin) a job against destructive edits.
    Pin {
        job: Uuid,
        #[arg(long)]
        off: bool,
    },
    /// Delete a job and its artifacts.
    Delete { job: Uuid },
    /// Process queued jobs until Ctrl-C.
    Worker {
        #[arg(long, env = "ANON_MAX_CONCURRENT_JOBS", default_value_t = 2)]
        concurrency: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Unify,
    Layout,
}

impl From<ModeArg> for Mode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Unify => Mode::Unify,
            ModeArg::Layout => Mode::Layout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if let Command::Inspect { input } = &cli.command {
        let bytes = std::fs::read(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let info = inspect(&bytes).context("Failed to inspect PDF")?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let observer = CliObserver::new();
    if cli.quiet || cli.json {
        observer.bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    let pipeline = Arc::new(build_pipeline(&cli, observer.clone()).await?);

    let job = match cli.command {
        Command::Inspect { .. } => unreachable!("handled above"),
        Command::Run {
            input,
            mode,
            render,
        } => {
            let bytes = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let filename = input
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("document.pdf")
                .to_string();
            let job = pipeline.create_job(&filename, &bytes, mode.into()).await?;
            let job = pipeline.process(job.id).await?;
            if render && job.status == JobStatus::Review {
                pipeline.render(job.id).await?
            } else {
                job
            }
        }
        Command::Status { job } => pipeline.job(job).await?,
        Command::List => {
            observer.finish();
            for job in pipeline.store().list().await? {
                println!(
                    "{}  {:<10} {:>3}%  {}",
                    job.id,
                    job.status.to_string(),
                    job.progress,
                    job.filename
                );
            }
            return Ok(());
        }
        Command::Decide { job, decisions } => {
            let parsed = parse_decisions(&decisions)?;
            pipeline.submit_decisions(job, parsed).await?
        }
        Command::Render { job } => pipeline.render(job).await?,
        Command::Retry { job } => {
            pipeline.retry(job).await?;
            pipeline.process(job).await?
        }
        Command::Replace {
            job,
            find,
            replace,
            page,
        } => {
            let (job, changes) = pipeline
                .text_replace(job, vec![Replacement { find, replace, page }])
                .await?;
            observer.finish();
            if !cli.quiet {
                eprintln!("{} {} occurrence(s) changed", green("✓"), changes.len());
            }
            job
        }
        Command::DeletePages { job, pages } => {
            let (job, deleted) = pipeline.delete_pages(job, pages).await?;
            observer.finish();
            if !cli.quiet {
                eprintln!(
                    "{} deleted pages {:?}: {} → {} pages",
                    green("✓"),
                    deleted.deleted_pages,
                    deleted.original_page_count,
                    deleted.new_page_count
                );
            }
            job
        }
        Command::DeleteBlock { job, page, bbox } => {
            let [x, y, w, h] = bbox.as_slice() else {
                bail!("--bbox needs exactly four values: x,y,w,h");
            };
            let block = Block {
                page,
                bbox: NormBox::new(*x, *y, *w, *h),
            };
            pipeline.delete_blocks(job, vec![block]).await?
        }
        Command::Blocks { job, page } => {
            let pages = pipeline.text_blocks(job, page).await?;
            observer.finish();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&pages)?);
                return Ok(());
            }
            for p in &pages {
                println!("{}", bold(&format!("Page {} ({:.0}×{:.0} pt)", p.page, p.width, p.height)));
                for b in &p.blocks {
                    println!(
                        "  {} {}",
                        dim(&format!(
                            "{:>6.2},{:>6.2},{:>6.2},{:>6.2}",
                            b.bbox.x, b.bbox.y, b.bbox.w, b.bbox.h
                        )),
                        b.text
                    );
                }
            }
            return Ok(());
        }
        Command::Pin { job, off } => pipeline.pin(job, !off).await?,
        Command::Delete { job } => {
            pipeline.delete_job(job).await?;
            observer.finish();
            if !cli.quiet {
                eprintln!("{} job {} deleted", green("✓"), job);
            }
            return Ok(());
        }
        Command::Worker { concurrency } => {
            observer.finish();
            return run_worker(pipeline, concurrency, cli.quiet).await;
        }
    };

    observer.finish();
    print_job(&job, cli.json)?;
    if job.status == JobStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn build_pipeline(cli: &Cli, observer: SharedObserver) -> Result<JobPipeline> {
    let mut builder = PipelineConfig::builder()
        .storage_root(&cli.storage)
        .analysis_dpi(cli.dpi)
        .max_file_size_mb(cli.max_file_size_mb)
        .max_analysis_pages(cli.max_analysis_pages);
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(path);
    }
    let config = builder.build().context("Invalid configuration")?;

    let classifier: Arc<dyn Classifier> = match VisionClassifier::from_config(&config) {
        Ok(c) => Arc::new(c),
        Err(e) => Arc::new(MissingProvider(e.to_string())),
    };
    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(&config.storage_root));
    let store = StorageJobStore::open(Arc::clone(&storage))
        .await
        .with_context(|| format!("Failed to open job store in {}", cli.storage.display()))?;
    let rasterizer = Arc::new(PdfiumRasterizer::new(config.pdfium_lib_path.clone()));

    Ok(
        JobPipeline::new(storage, Arc::new(store), rasterizer, classifier, config)
            .with_observer(observer),
    )
}

fn parse_decisions(raw: &[String]) -> Result<BTreeMap<String, Action>> {
    raw.iter()
        .map(|item| {
            let (id, action) = item
                .split_once('=')
                .with_context(|| format!("Expected id=action, got '{item}'"))?;
            let action = match action.trim().to_ascii_lowercase().as_str() {
                "remove" => Action::Remove,
                "mask" => Action::Mask,
                "keep" => Action::Keep,
                other => bail!("Unknown action '{other}' (use remove, mask or keep)"),
            };
            Ok((id.trim().to_string(), action))
        })
        .collect()
}

fn print_job(job: &Job, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }
    let status = match job.status {
        JobStatus::Done | JobStatus::Review => green(&job.status.to_string()),
        JobStatus::Failed => red(&job.status.to_string()),
        _ => job.status.to_string(),
    };
    println!("{}  {}  {}", bold(&job.id.to_string()), status, job.filename);
    println!(
        "  {} pages, {} findings, confidence {:.2}",
        job.page_count,
        job.findings.len(),
        job.confidence
    );
    for f in &job.findings {
        println!(
            "  {:<14} {:<9} p{:<3} {:<7} {}",
            f.id,
            f.category,
            f.page,
            format!("{:?}", job.effective_action(f)).to_lowercase(),
            dim(&f.label)
        );
    }
    for note in &job.advisories {
        println!("  {} {}", yellow("!"), note);
    }
    if let Some(ref err) = job.error_message {
        println!("  {} {}", red("error:"), err);
    }
    if let Some(ref path) = job.output_pdf_path {
        println!("  output: {}", path);
    }
    Ok(())
}

async fn run_worker(pipeline: Arc<JobPipeline>, concurrency: usize, quiet: bool) -> Result<()> {
    let config = WorkerConfig::from_env().with_max_concurrent(concurrency);
    let handle = JobWorker::new(pipeline, config).start();
    let mut events = handle.events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown().await;
                break;
            }
            event = events.recv() => match event {
                Ok(WorkerEvent::JobCompleted { job_id, elapsed_ms }) if !quiet => {
                    eprintln!("{} {} ready for review ({:.1}s)", green("✓"), job_id, elapsed_ms as f64 / 1000.0);
                }
                Ok(WorkerEvent::JobFailed { job_id, error }) => {
                    eprintln!("{} {} {}", red("✗"), job_id, error);
                }
                Ok(WorkerEvent::WorkerStopped) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("{}", dim(&format!("skipped {n} worker events")));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}
