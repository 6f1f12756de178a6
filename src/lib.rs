//! # offer-anonymizer
//!
//! Anonymize vehicle-offer PDFs before they are shared.
//!
//! A vision classifier looks at rasterised pages and reports sensitive
//! regions (names, contacts, dealer identity, discounts, financing). An
//! operator reviews the findings, and the redaction engine removes the
//! underlying content from the PDF itself: text is cut out of the content
//! stream and images under a redaction are dropped or repainted, so nothing
//! can be recovered by copying text or extracting images.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Process   page count, thumbnails, classifier renders (pdfium)
//!  ├─ 2. Analyse   sections → findings → extraction, each under a timeout
//!  ├─ 3. Review    operator decisions; text replace / block delete / page delete
//!  └─ 4. Render    apply decisions → anonymized PDF + twin JSON + audit record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offer_anonymizer::{
//!     FsStorage, JobPipeline, MemoryJobStore, Mode, PdfiumRasterizer, PipelineConfig,
//!     VisionClassifier,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().storage_root("./storage").build()?;
//!     let classifier = Arc::new(VisionClassifier::from_config(&config)?);
//!     let pipeline = JobPipeline::new(
//!         Arc::new(FsStorage::new(&config.storage_root)),
//!         Arc::new(MemoryJobStore::new()),
//!         Arc::new(PdfiumRasterizer::new(config.pdfium_lib_path.clone())),
//!         classifier,
//!         config,
//!     );
//!
//!     let job = pipeline
//!         .create_job("offer.pdf", &std::fs::read("offer.pdf")?, Mode::Layout)
//!         .await?;
//!     let job = pipeline.process(job.id).await?;
//!     println!("{} findings", job.findings.len());
//!     let job = pipeline.render(job.id).await?;
//!     println!("{:?}", job.output_pdf_path);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `offer-anon` binary (clap + anyhow + tracing-subscriber) |
//!
//! The mutation functions in [`redact`] and [`pages`] work on bytes and need
//! neither pdfium nor a classifier.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analysis;
pub mod classifier;
pub mod config;
pub mod error;
pub mod geometry;
pub mod job;
pub mod jobs;
pub mod pages;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod redact;
pub mod storage;
pub mod store;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analysis::{
    AnalysisInput, AnalysisOrchestrator, AnalysisReport, Classifier, ClassifierError,
    ParseOutcome,
};
pub use classifier::VisionClassifier;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{AnonError, ErrorKind, StageError};
pub use geometry::{to_absolute, to_normalized, NormBox, Rect};
pub use job::{Action, AuditRecord, DigitalTwin, Finding, Job, JobStatus, Mode, Section};
pub use jobs::JobPipeline;
pub use pages::{delete_pages, inspect, DeletedPages, DocumentInfo};
pub use pipeline::render::{PageRasterizer, PdfiumRasterizer, RenderedPage};
pub use progress::{NoopObserver, PipelineObserver, SharedObserver};
pub use redact::{
    apply_findings, delete_blocks, text_blocks, text_replace, Block, BlockKind, ChangeAction,
    ChangeRecord, PageBlock, PageBlocks, Replacement, TextStyle,
};
pub use storage::{FsStorage, Storage};
pub use store::{JobStore, MemoryJobStore, StorageJobStore};
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};
