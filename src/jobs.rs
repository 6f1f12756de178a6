//! The job state machine.
//!
//! ```text
//! queued ──▶ processing ──▶ analyzing ──▶ review ──▶ rendering ──▶ done
//!    ▲            │              │           │            │
//!    └── retry ── failed ◀───────┴───────────┴────────────┘
//! ```
//!
//! [`JobPipeline`] is the error boundary for background work: `process` and
//! `render` capture any failure into the job's `error_message`, move it to
//! `failed` and return the job. Precondition failures (unknown job, wrong
//! status, bad page indices, pinned document) are returned as `Err` before any
//! state changes.
//!
//! Every mutation writes a new versioned artifact, then swaps the job's
//! `current_input_path`. A per-job async mutex keeps operations on one job
//! strictly sequential; different jobs run concurrently.
//!
//! Storage layout (relative to the storage root):
//!
//! ```text
//! uploads/{id}/{filename}                 original upload
//! thumbnails/{id}/page_{n}.png            previews of the current artifact
//! pages/{id}/page_{n}.png                 classifier inputs
//! artifacts/{id}/v{n}_{op}_{filename}     mutation results
//! outputs/{id}/anonymized_{filename}      rendered output
//! outputs/{id}/digital_twin.json          unify mode only
//! outputs/{id}/audit.json
//! ```

use crate::analysis::{AnalysisInput, AnalysisOrchestrator, Classifier, Stage, StageListener};
use crate::config::PipelineConfig;
use crate::error::AnonError;
use crate::job::{Action, AuditAction, AuditRecord, Finding, Job, JobStatus, Mode};
use crate::pages::{self, DeletedPages};
use crate::pipeline::encode::png_bytes;
use crate::pipeline::render::{PageRasterizer, RenderedPage};
use crate::progress::{NoopObserver, SharedObserver};
use crate::redact::{self, Block, ChangeRecord, PageBlocks, Replacement, TextStyle};
use crate::storage::Storage;
use crate::store::{require, JobStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ── Storage layout ───────────────────────────────────────────────────────

fn upload_path(id: Uuid, filename: &str) -> String {
    format!("uploads/{id}/{filename}")
}

fn thumbnail_dir(id: Uuid) -> String {
    format!("thumbnails/{id}")
}

fn analysis_dir(id: Uuid) -> String {
    format!("pages/{id}")
}

fn artifact_path(id: Uuid, version: usize, op: &str, filename: &str) -> String {
    format!("artifacts/{id}/v{version}_{op}_{filename}")
}

fn output_dir(id: Uuid) -> String {
    format!("outputs/{id}")
}

/// Keep only the final path component of an uploaded file name.
fn safe_filename(name: &str) -> Result<String, AnonError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| AnonError::InvalidStoragePath {
            path: name.to_string(),
        })
}

/// Run CPU-bound PDF work on the blocking pool.
async fn blocking<T, F>(what: &str, f: F) -> Result<T, AnonError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AnonError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AnonError::Internal(format!("{} task panicked: {}", what, e)))?
}

/// Drop findings on deleted pages and shift the rest down.
fn remap_findings(findings: &mut Vec<Finding>, deleted: &[usize]) {
    findings.retain_mut(|f| {
        let Some(page) = f.page_index() else {
            return false;
        };
        if deleted.binary_search(&page).is_ok() {
            return false;
        }
        f.page -= deleted.iter().filter(|&&d| d < page).count();
        true
    });
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Coordinates storage, rasterisation, analysis and redaction for jobs.
pub struct JobPipeline {
    storage: Arc<dyn Storage>,
    store: Arc<dyn JobStore>,
    rasterizer: Arc<dyn PageRasterizer>,
    orchestrator: AnalysisOrchestrator,
    config: Arc<PipelineConfig>,
    observer: SharedObserver,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl JobPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        store: Arc<dyn JobStore>,
        rasterizer: Arc<dyn PageRasterizer>,
        classifier: Arc<dyn Classifier>,
        config: PipelineConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            storage,
            store,
            rasterizer,
            orchestrator: AnalysisOrchestrator::new(classifier, Arc::clone(&config)),
            config,
            observer: Arc::new(NoopObserver),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Current state of a job.
    pub async fn job(&self, id: Uuid) -> Result<Job, AnonError> {
        require(self.store.as_ref(), id).await
    }

    async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Save the job at a checkpoint and notify the observer.
    async fn checkpoint(
        &self,
        job: &mut Job,
        status: JobStatus,
        progress: u8,
    ) -> Result<(), AnonError> {
        let changed = job.status != status;
        if changed {
            job.set_status(status);
        }
        job.advance(progress);
        self.store.save(job).await?;
        if changed {
            info!("Job {} → {}", job.id, status);
            self.observer.on_status(job.id, status);
        }
        debug!("Job {} progress {}", job.id, job.progress);
        self.observer.on_progress(job.id, job.progress);
        Ok(())
    }

    /// Move a job to `failed`, keeping the error text verbatim.
    async fn fail(&self, job: &mut Job, err: &AnonError) {
        let message = err.to_string();
        error!("Job {} failed during {}: {}", job.id, job.status, message);
        job.fail(message.clone());
        if let Err(save_err) = self.store.save(job).await {
            error!("Job {}: could not persist failure: {}", job.id, save_err);
        }
        self.observer.on_failed(job.id, &message);
    }

    fn expect_status(
        job: &Job,
        allowed: &[JobStatus],
        action: &'static str,
    ) -> Result<(), AnonError> {
        if allowed.contains(&job.status) {
            return Ok(());
        }
        Err(Self::invalid_transition(job, action))
    }

    /// Review and done jobs only.
    fn expect_editable(job: &Job, action: &'static str) -> Result<(), AnonError> {
        if job.status.is_editable() {
            return Ok(());
        }
        Err(Self::invalid_transition(job, action))
    }

    fn invalid_transition(job: &Job, action: &'static str) -> AnonError {
        AnonError::InvalidTransition {
            job_id: job.id,
            status: job.status,
            action,
        }
    }

    // ── Upload ───────────────────────────────────────────────────────────

    /// Store an upload and queue a job for it.
    pub async fn create_job(
        &self,
        filename: &str,
        bytes: &[u8],
        mode: Mode,
    ) -> Result<Job, AnonError> {
        let filename = safe_filename(filename)?;
        self.orchestrator.check_file_size(bytes.len() as u64)?;
        if !bytes.starts_with(b"%PDF") {
            let mut magic = [0u8; 4];
            let n = bytes.len().min(4);
            magic[..n].copy_from_slice(&bytes[..n]);
            return Err(AnonError::NotAPdf {
                path: filename,
                magic,
            });
        }

        let mut job = Job::new(filename.clone(), mode, String::new());
        job.current_input_path = upload_path(job.id, &filename);
        job.file_size = bytes.len() as u64;
        self.storage.save(&job.current_input_path, bytes).await?;
        self.store.save(&job).await?;

        info!(
            "Job {} queued: '{}' ({} bytes, {} mode)",
            job.id,
            filename,
            bytes.len(),
            mode
        );
        self.observer.on_status(job.id, JobStatus::Queued);
        Ok(job)
    }

    // ── Processing & analysis ────────────────────────────────────────────

    /// Rasterise, analyse and move the job to `review`.
    ///
    /// Accepts a `queued` job or one already claimed (`processing`). Any
    /// failure after that lands the job in `failed` and is returned inside
    /// the job, not as `Err`.
    pub async fn process(&self, id: Uuid) -> Result<Job, AnonError> {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        Self::expect_status(&job, &[JobStatus::Queued, JobStatus::Processing], "process")?;

        if let Err(e) = self.run_processing(&mut job).await {
            self.fail(&mut job, &e).await;
        }
        Ok(job)
    }

    async fn run_processing(&self, job: &mut Job) -> Result<(), AnonError> {
        self.checkpoint(job, JobStatus::Processing, 10).await?;

        let bytes = self.storage.load(&job.current_input_path).await?;
        self.orchestrator.check_file_size(bytes.len() as u64)?;
        job.file_size = bytes.len() as u64;

        let scan = bytes.clone();
        let info = blocking("Inspect", move || pages::inspect(&scan)).await?;
        job.page_count = info.page_count;
        if info.is_scanned {
            self.advise(
                job,
                "Document has little or no extractable text; text replacement will find no matches"
                    .into(),
            );
        }
        self.refresh_thumbnails(job, &bytes).await?;
        self.checkpoint(job, JobStatus::Processing, 20).await?;

        let images = self.analysis_images(job, &bytes).await?;
        self.checkpoint(job, JobStatus::Processing, 30).await?;

        self.checkpoint(job, JobStatus::Analyzing, 40).await?;
        let input = AnalysisInput {
            images,
            page_count: job.page_count,
            file_size: job.file_size,
            filename: job.filename.clone(),
            mode: job.mode,
        };
        let report = {
            let mut listener = StageCheckpoints {
                pipeline: self,
                job: &mut *job,
            };
            self.orchestrator.run(input, &mut listener).await?
        };

        job.document_type = Some(report.document_type);
        job.sections = report.sections;
        job.findings = report.findings;
        job.twin = report.twin;
        // Finding ids from a previous run mean nothing to this one.
        job.decisions.clear();
        for note in report.advisories {
            self.advise(job, note);
        }
        job.recompute_confidence();

        self.checkpoint(job, JobStatus::Review, 100).await?;
        info!(
            "Job {} ready for review: {} findings, {} sections, confidence {:.2}",
            job.id,
            job.findings.len(),
            job.sections.len(),
            job.confidence
        );
        Ok(())
    }

    fn advise(&self, job: &mut Job, note: String) {
        warn!("Job {}: {}", job.id, note);
        self.observer.on_advisory(job.id, &note);
        job.advisories.push(note);
    }

    /// Render the capped classifier inputs and keep them in storage.
    async fn analysis_images(&self, job: &Job, bytes: &[u8]) -> Result<Vec<Vec<u8>>, AnonError> {
        let rendered = self
            .rasterizer
            .render_pages(bytes, self.config.analysis_dpi, self.config.max_analysis_pages)
            .await?;
        let pngs = blocking("Encode", move || encode_all(rendered)).await?;

        let dir = analysis_dir(job.id);
        self.storage.remove(&dir).await?;
        let mut images = Vec::with_capacity(pngs.len());
        for (index, png) in pngs {
            self.storage
                .save(&format!("{dir}/page_{index}.png"), &png)
                .await?;
            images.push(png);
        }
        Ok(images)
    }

    /// Regenerate every thumbnail from `bytes`.
    ///
    /// The new set is written over the old one before anything is removed, so
    /// a failure at any point leaves every path the stored job lists on disk.
    /// Thumbnails past the new page count are removed last.
    async fn refresh_thumbnails(&self, job: &mut Job, bytes: &[u8]) -> Result<(), AnonError> {
        let rendered = self
            .rasterizer
            .thumbnails(bytes, self.config.thumbnail_max_width)
            .await?;
        let pngs = blocking("Encode", move || encode_all(rendered)).await?;

        let dir = thumbnail_dir(job.id);
        let mut paths = Vec::with_capacity(pngs.len());
        for (index, png) in pngs {
            paths.push(
                self.storage
                    .save(&format!("{dir}/page_{index}.png"), &png)
                    .await?,
            );
        }
        for stale in job.thumbnails.iter().filter(|old| !paths.contains(*old)) {
            self.storage.remove(stale).await?;
        }
        debug!("Job {}: {} thumbnails", job.id, paths.len());
        job.thumbnails = paths;
        Ok(())
    }

    // ── Review ───────────────────────────────────────────────────────────

    /// Record operator decisions. Pure data write; no status change.
    pub async fn submit_decisions(
        &self,
        id: Uuid,
        decisions: BTreeMap<String, Action>,
    ) -> Result<Job, AnonError> {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        Self::expect_editable(&job, "submit decisions")?;

        let unknown: Vec<&String> = decisions
            .keys()
            .filter(|key| {
                !job.findings.iter().any(|f| &f.id == *key)
                    && !job.sections.iter().any(|s| &s.id == *key)
            })
            .collect();
        if !unknown.is_empty() {
            return Err(AnonError::InvalidInstruction {
                detail: format!("unknown finding or section ids: {:?}", unknown),
            });
        }

        job.decisions.extend(decisions);
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        info!("Job {}: {} decisions recorded", job.id, job.decisions.len());
        Ok(job)
    }

    /// Pin or unpin the document. Pinned documents refuse destructive edits.
    pub async fn pin(&self, id: Uuid, pinned: bool) -> Result<Job, AnonError> {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        job.pinned = pinned;
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        Ok(job)
    }

    // ── Rendering ────────────────────────────────────────────────────────

    /// Apply the effective decisions to the current artifact and write the
    /// outputs. Can be re-run on a `done` job.
    pub async fn render(&self, id: Uuid) -> Result<Job, AnonError> {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        Self::expect_editable(&job, "render")?;

        if let Err(e) = self.run_render(&mut job).await {
            self.fail(&mut job, &e).await;
        }
        Ok(job)
    }

    async fn run_render(&self, job: &mut Job) -> Result<(), AnonError> {
        self.checkpoint(job, JobStatus::Rendering, 0).await?;

        let bytes = self.storage.load(&job.current_input_path).await?;
        let findings = job.findings.clone();
        let decisions = job.decisions.clone();
        let (out, applied) = blocking("Render", move || {
            redact::apply_findings(&bytes, &findings, &decisions)
        })
        .await?;

        let dir = output_dir(job.id);
        let pdf_path = self
            .storage
            .save(&format!("{dir}/anonymized_{}", job.filename), &out)
            .await?;

        let now = Utc::now();
        if job.mode == Mode::Unify {
            if let Some(twin) = job.twin.as_mut() {
                twin.processed_at = now;
                // A re-render replaces the previous render's entries only.
                twin.audit
                    .retain(|a| a.action_type != "mask" && a.action_type != "remove");
                twin.audit
                    .extend(render_audit_actions(&job.findings, &job.decisions, now));
            }
            if let Some(twin) = job.twin.as_ref() {
                let path = self
                    .storage
                    .save(
                        &format!("{dir}/digital_twin.json"),
                        &serde_json::to_vec_pretty(twin)?,
                    )
                    .await?;
                job.output_json_path = Some(path);
            }
        }

        let audit = AuditRecord {
            job_id: job.id,
            processed_at: now,
            mode: job.mode,
            decisions: job.decisions.clone(),
            findings_count: job.findings.len(),
            redactions_applied: applied,
        };
        let audit_path = self
            .storage
            .save(&format!("{dir}/audit.json"), &serde_json::to_vec_pretty(&audit)?)
            .await?;

        job.output_pdf_path = Some(pdf_path);
        job.audit_path = Some(audit_path);
        job.completed_at = Some(now);
        self.checkpoint(job, JobStatus::Done, 100).await?;
        info!("Job {} rendered: {} redactions applied", job.id, applied);
        Ok(())
    }

    // ── Retry ────────────────────────────────────────────────────────────

    /// Re-queue a job for a fresh analysis. Only `done` and `queued` jobs
    /// are refused.
    pub async fn retry(&self, id: Uuid) -> Result<Job, AnonError> {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        if matches!(job.status, JobStatus::Done | JobStatus::Queued) {
            return Err(AnonError::RetryRejected { status: job.status });
        }

        info!("Job {}: retry from {}", job.id, job.status);
        job.set_status(JobStatus::Queued);
        job.progress = 0;
        job.error_message = None;
        self.store.save(&job).await?;
        self.observer.on_status(job.id, JobStatus::Queued);
        Ok(job)
    }

    // ── Document mutations ───────────────────────────────────────────────

    /// Replace or delete literal text in the current artifact.
    pub async fn text_replace(
        &self,
        id: Uuid,
        replacements: Vec<Replacement>,
    ) -> Result<(Job, Vec<ChangeRecord>), AnonError> {
        let style = TextStyle {
            font: self.config.replacement_font.clone(),
            default_size: self.config.default_font_size,
        };
        self.mutate(id, "replace", move |bytes| {
            redact::text_replace(&bytes, &replacements, &style)
        })
        .await
    }

    /// Remove operator-drawn blocks from the current artifact.
    pub async fn delete_blocks(&self, id: Uuid, blocks: Vec<Block>) -> Result<Job, AnonError> {
        let (job, ()) = self
            .mutate(id, "blocks", move |bytes| {
                redact::delete_blocks(&bytes, &blocks).map(|out| (out, ()))
            })
            .await?;
        Ok(job)
    }

    /// Remove whole pages (0-indexed) from the current artifact.
    pub async fn delete_pages(
        &self,
        id: Uuid,
        indices: Vec<usize>,
    ) -> Result<(Job, DeletedPages), AnonError> {
        self.mutate(id, "pages", move |bytes| pages::delete_pages(&bytes, &indices))
            .await
    }

    /// Shared mutation protocol: preconditions, run `op` on the blocking
    /// pool, durably write the new artifact, then swap the pointer.
    async fn mutate<T, F>(&self, id: Uuid, op: &'static str, f: F) -> Result<(Job, T), AnonError>
    where
        T: Mutation + Send + 'static,
        F: FnOnce(Vec<u8>) -> Result<(Vec<u8>, T), AnonError> + Send + 'static,
    {
        let _guard = self.lock(id).await;
        let mut job = require(self.store.as_ref(), id).await?;
        Self::expect_editable(&job, op)?;
        if job.pinned {
            return Err(AnonError::DocumentPinned { job_id: job.id });
        }

        let bytes = self.storage.load(&job.current_input_path).await?;
        let (out, outcome) = blocking(op, move || f(bytes)).await?;

        let version = job.artifact_history.len() + 1;
        let path = artifact_path(job.id, version, op, &job.filename);
        if job.is_retained(&path) {
            return Err(AnonError::RetainedArtifact { path });
        }
        self.storage.save(&path, &out).await?;
        job.swap_artifact(path.clone(), op);
        info!("Job {}: {} → {}", job.id, op, path);

        outcome.apply(&mut job);
        self.refresh_thumbnails(&mut job, &out).await?;
        self.store.save(&job).await?;
        Ok((job, outcome))
    }

    /// Text lines and images of the current artifact, for one page
    /// (0-indexed) or all of them.
    pub async fn text_blocks(
        &self,
        id: Uuid,
        page: Option<usize>,
    ) -> Result<Vec<PageBlocks>, AnonError> {
        let job = require(self.store.as_ref(), id).await?;
        let bytes = self.storage.load(&job.current_input_path).await?;
        blocking("Text blocks", move || redact::text_blocks(&bytes, page)).await
    }

    // ── Deletion ─────────────────────────────────────────────────────────

    /// Delete a job and every artifact it owns. Pinned jobs are refused.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), AnonError> {
        {
            let _guard = self.lock(id).await;
            let job = require(self.store.as_ref(), id).await?;
            if job.pinned {
                return Err(AnonError::DocumentPinned { job_id: id });
            }
            for dir in [
                format!("uploads/{id}"),
                thumbnail_dir(id),
                analysis_dir(id),
                format!("artifacts/{id}"),
                output_dir(id),
            ] {
                self.storage.remove(&dir).await?;
            }
            self.store.delete(id).await?;
        }
        self.locks.lock().await.remove(&id);
        info!("Job {} deleted", id);
        Ok(())
    }
}

/// Job bookkeeping that follows a successful mutation.
trait Mutation {
    fn apply(&self, job: &mut Job);
}

impl Mutation for () {
    fn apply(&self, _job: &mut Job) {}
}

impl Mutation for Vec<ChangeRecord> {
    fn apply(&self, job: &mut Job) {
        if let Some(twin) = job.twin.as_mut() {
            let now = Utc::now();
            twin.audit.extend(self.iter().map(|c| AuditAction {
                action_type: "edit_text".into(),
                target: format!("page {}", c.page),
                before: Some(c.find.clone()),
                after: Some(c.replace.clone()),
                timestamp: now,
            }));
        }
    }
}

impl Mutation for DeletedPages {
    fn apply(&self, job: &mut Job) {
        job.page_count = self.new_page_count;
        let before = job.findings.len();
        remap_findings(&mut job.findings, &self.deleted_pages);
        let dropped = before - job.findings.len();
        if dropped > 0 {
            job.advisories.push(format!(
                "{dropped} findings were on deleted pages and have been dropped"
            ));
        }
        if let Some(twin) = job.twin.as_mut() {
            twin.audit.push(AuditAction {
                action_type: "remove_page".into(),
                target: format!("pages {:?}", self.deleted_pages),
                before: Some(self.original_page_count.to_string()),
                after: Some(self.new_page_count.to_string()),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Audit trail entries for the findings a render redacts.
fn render_audit_actions(
    findings: &[Finding],
    decisions: &BTreeMap<String, Action>,
    at: chrono::DateTime<Utc>,
) -> Vec<AuditAction> {
    findings
        .iter()
        .filter_map(|f| {
            let action_type = match f.resolve(decisions) {
                Action::Remove => "remove",
                Action::Mask => "mask",
                Action::Keep => return None,
            };
            Some(AuditAction {
                action_type: action_type.into(),
                target: format!("{} ({}, page {})", f.id, f.category, f.page),
                before: None,
                after: None,
                timestamp: at,
            })
        })
        .collect()
}

fn encode_all(rendered: Vec<RenderedPage>) -> Result<Vec<(usize, Vec<u8>)>, AnonError> {
    rendered
        .into_iter()
        .map(|page| -> Result<(usize, Vec<u8>), AnonError> {
            Ok((page.index, png_bytes(&page.image)?))
        })
        .collect()
}

/// Persists the 55 / 70 / 85 checkpoints as analysis stages finish.
struct StageCheckpoints<'a> {
    pipeline: &'a JobPipeline,
    job: &'a mut Job,
}

#[async_trait]
impl<'a> StageListener for StageCheckpoints<'a> {
    async fn stage_finished(&mut self, stage: Stage) -> Result<(), AnonError> {
        self.pipeline
            .checkpoint(self.job, JobStatus::Analyzing, stage.checkpoint())
            .await
    }
}
