//! Analysis orchestration: three classifier stages under timeouts and caps.
//!
//! ```text
//! images (capped) ──▶ sections ──▶ findings ──▶ extraction (unify only)
//!                     └──────── watchdog = factor × per-call timeout ────┘
//! ```
//!
//! Each stage runs under its own `tokio::time::timeout`. A timeout, a
//! malformed response or a transient failure degrades that stage to an empty
//! result and records a [`StageError`]; only an unreachable transport or the
//! watchdog aborts the run.
//!
//! Timeouts are cooperative: the stage future is dropped, which abandons the
//! request from our side. Nothing guarantees the remote call stops, so a
//! timeout means "no usable result", never "the call did not happen".

use crate::config::PipelineConfig;
use crate::error::{AnonError, StageError};
use crate::job::{DigitalTwin, Finding, FindingsReport, Mode, Section, SectionsReport};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

// ── Classifier contract ──────────────────────────────────────────────────

/// Outcome of parsing a classifier response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Malformed { detail: String },
}

/// Classifier call failure.
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    /// The transport cannot be reached (DNS, refused connection, no provider).
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The call failed but the service is there (rate limit, 5xx).
    #[error("failed: {0}")]
    Failed(String),
}

/// External AI collaborator. Images are PNG bytes, one per analysed page.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn detect_sections(
        &self,
        images: &[Vec<u8>],
    ) -> Result<ParseOutcome<SectionsReport>, ClassifierError>;

    async fn detect_findings(
        &self,
        images: &[Vec<u8>],
    ) -> Result<ParseOutcome<FindingsReport>, ClassifierError>;

    async fn extract_structured(
        &self,
        images: &[Vec<u8>],
        filename: &str,
    ) -> Result<ParseOutcome<DigitalTwin>, ClassifierError>;
}

// ── Stages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Sections,
    Findings,
    Extraction,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Sections => "sections",
            Stage::Findings => "findings",
            Stage::Extraction => "extraction",
        }
    }

    /// Job progress once this stage has finished.
    pub fn checkpoint(self) -> u8 {
        match self {
            Stage::Sections => 55,
            Stage::Findings => 70,
            Stage::Extraction => 85,
        }
    }
}

/// Notified after each stage completes (degraded or not).
#[async_trait]
pub trait StageListener: Send {
    async fn stage_finished(&mut self, stage: Stage) -> Result<(), AnonError>;
}

/// Listener that ignores every stage.
pub struct IgnoreStages;

#[async_trait]
impl StageListener for IgnoreStages {
    async fn stage_finished(&mut self, _stage: Stage) -> Result<(), AnonError> {
        Ok(())
    }
}

// ── Input / output ───────────────────────────────────────────────────────

/// What the orchestrator needs to know about the document.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    /// Page renders in page order, before the page cap.
    pub images: Vec<Vec<u8>>,
    pub page_count: usize,
    pub file_size: u64,
    pub filename: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub document_type: String,
    pub sections: Vec<Section>,
    pub findings: Vec<Finding>,
    /// Present in unify mode (zero-confidence when extraction degraded).
    pub twin: Option<DigitalTwin>,
    pub confidence: f64,
    pub analysed_pages: usize,
    pub advisories: Vec<String>,
    pub stage_errors: Vec<StageError>,
}

/// `max(extraction confidence, mean finding confidence)`.
pub fn blend_confidence(twin: Option<&DigitalTwin>, findings: &[Finding]) -> f64 {
    let extraction = twin.map(|t| t.confidence).unwrap_or(0.0);
    if findings.is_empty() {
        return extraction;
    }
    let mean = findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64;
    extraction.max(mean)
}

/// Drop findings on pages the document does not have or with unusable boxes,
/// and give every finding a unique id. Returns the number dropped.
pub fn sanitize_findings(findings: &mut Vec<Finding>, page_count: usize) -> usize {
    let before = findings.len();
    findings.retain(|f| {
        let on_page = f.page_index().is_some_and(|p| p < page_count);
        let b = f.bbox;
        let box_ok = [b.x, b.y, b.w, b.h].iter().all(|v| v.is_finite()) && b.w >= 0.0 && b.h >= 0.0;
        on_page && box_ok
    });

    let mut seen = HashSet::new();
    for (i, f) in findings.iter_mut().enumerate() {
        if f.id.is_empty() || !seen.insert(f.id.clone()) {
            f.id = format!("f{}", i + 1);
            while !seen.insert(f.id.clone()) {
                f.id.push('_');
            }
        }
        f.confidence = f.confidence.clamp(0.0, 1.0);
    }
    before - findings.len()
}

// ── Orchestrator ─────────────────────────────────────────────────────────

pub struct AnalysisOrchestrator {
    classifier: Arc<dyn Classifier>,
    config: Arc<PipelineConfig>,
}

impl AnalysisOrchestrator {
    pub fn new(classifier: Arc<dyn Classifier>, config: Arc<PipelineConfig>) -> Self {
        Self { classifier, config }
    }

    /// Fatal precondition, checked before any classifier call.
    pub fn check_file_size(&self, size: u64) -> Result<(), AnonError> {
        if size > self.config.max_file_size_bytes() {
            return Err(AnonError::FileTooLarge {
                size_mb: size as f64 / (1024.0 * 1024.0),
                limit_mb: self.config.max_file_size_mb,
            });
        }
        Ok(())
    }

    /// Run every stage for `input`.
    pub async fn run(
        &self,
        mut input: AnalysisInput,
        listener: &mut dyn StageListener,
    ) -> Result<AnalysisReport, AnonError> {
        self.check_file_size(input.file_size)?;

        let mut report = AnalysisReport {
            document_type: "other".into(),
            ..Default::default()
        };
        let cap = self.config.max_analysis_pages;
        input.images.truncate(cap);
        if input.page_count > cap {
            report.advisories.push(format!(
                "Document has {} pages; only the first {} were analysed",
                input.page_count, cap
            ));
        }
        report.analysed_pages = input.images.len();

        let call_timeout = self.config.call_timeout(report.analysed_pages);
        let watchdog = self.config.watchdog_timeout(report.analysed_pages);
        let total = if input.mode == Mode::Unify { 3 } else { 2 };
        info!(
            "Analysing {} pages (per-call timeout {:?}, watchdog {:?})",
            report.analysed_pages, call_timeout, watchdog
        );

        let mut completed = 0usize;
        let outcome = tokio::time::timeout(
            watchdog,
            self.stages(&input, call_timeout, &mut report, &mut completed, listener),
        )
        .await;
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!("Analysis watchdog fired after {} of {} stages", completed, total);
                return Err(AnonError::AnalysisWatchdogExpired {
                    limit_ms: watchdog.as_millis() as u64,
                    completed,
                    total,
                });
            }
        }

        let dropped = sanitize_findings(&mut report.findings, input.page_count);
        if dropped > 0 {
            report
                .advisories
                .push(format!("Dropped {dropped} findings with invalid page or box"));
        }
        for error in &report.stage_errors {
            report.advisories.push(format!("Analysis degraded: {error}"));
        }
        report.confidence = blend_confidence(report.twin.as_ref(), &report.findings);
        info!(
            "Analysis finished: {} sections, {} findings, confidence {:.2}",
            report.sections.len(),
            report.findings.len(),
            report.confidence
        );
        Ok(report)
    }

    async fn stages(
        &self,
        input: &AnalysisInput,
        call_timeout: Duration,
        report: &mut AnalysisReport,
        completed: &mut usize,
        listener: &mut dyn StageListener,
    ) -> Result<(), AnonError> {
        let images = &input.images;

        match self
            .call(Stage::Sections, call_timeout, self.classifier.detect_sections(images))
            .await?
        {
            Ok(sections) => {
                report.document_type = sections.document_type;
                report.sections = sections.sections;
            }
            Err(e) => report.stage_errors.push(e),
        }
        *completed += 1;
        listener.stage_finished(Stage::Sections).await?;

        match self
            .call(Stage::Findings, call_timeout, self.classifier.detect_findings(images))
            .await?
        {
            Ok(findings) => report.findings = findings.findings,
            Err(e) => report.stage_errors.push(e),
        }
        *completed += 1;
        listener.stage_finished(Stage::Findings).await?;

        if input.mode == Mode::Unify {
            let twin = match self
                .call(
                    Stage::Extraction,
                    call_timeout,
                    self.classifier.extract_structured(images, &input.filename),
                )
                .await?
            {
                Ok(mut twin) => {
                    twin.source_file = input.filename.clone();
                    twin.mode = Mode::Unify;
                    twin.confidence = twin.confidence.clamp(0.0, 1.0);
                    twin
                }
                Err(e) => {
                    report.stage_errors.push(e);
                    DigitalTwin::empty(&input.filename)
                }
            };
            report.twin = Some(twin);
            *completed += 1;
            listener.stage_finished(Stage::Extraction).await?;
        }
        Ok(())
    }

    /// One classifier call under the per-call deadline. The outer `Result` is
    /// fatal; the inner one is a degraded stage.
    async fn call<T>(
        &self,
        stage: Stage,
        limit: Duration,
        request: impl Future<Output = Result<ParseOutcome<T>, ClassifierError>>,
    ) -> Result<Result<T, StageError>, AnonError> {
        let start = Instant::now();
        let name = stage.name().to_string();
        let result = tokio::time::timeout(limit, request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Err(_) => {
                warn!("{} timed out after {}ms", name, elapsed_ms);
                Ok(Err(StageError::Timeout {
                    stage: name,
                    elapsed_ms,
                }))
            }
            Ok(Err(ClassifierError::Unreachable(detail))) => {
                Err(AnonError::ClassifierUnreachable { stage: name, detail })
            }
            Ok(Err(ClassifierError::Failed(detail))) => {
                warn!("{} failed after {}ms: {}", name, elapsed_ms, detail);
                Ok(Err(StageError::Failed { stage: name, detail }))
            }
            Ok(Ok(ParseOutcome::Malformed { detail })) => {
                warn!("{} returned a malformed response: {}", name, detail);
                Ok(Err(StageError::Malformed { stage: name, detail }))
            }
            Ok(Ok(ParseOutcome::Parsed(value))) => {
                info!("{} finished in {}ms", name, elapsed_ms);
                Ok(Ok(value))
            }
        }
    }
}
