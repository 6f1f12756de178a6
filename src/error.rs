//! Error types for the offer-anonymizer library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`AnonError`] — **Fatal**: the operation cannot proceed (bad page
//!   indices, missing artifact, unreachable classifier, PDF write failure,
//!   pinned document). Returned as `Err(AnonError)` from every public
//!   operation; background stages capture it into the job's `error_message`.
//!
//! * [`StageError`] — **Degraded**: one analysis stage timed out or returned
//!   something unparseable. The stage contributes an empty result and the
//!   job keeps going; the error is kept as an advisory on the job.
//!
//! [`AnonError::kind`] folds the fatal variants into the five failure classes
//! the pipeline reasons about ([`ErrorKind`]).

use crate::job::JobStatus;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failure class of an [`AnonError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before mutation; no state changed.
    InputValidation,
    /// Classifier timeout or malformed response (normally a [`StageError`]).
    TransientAnalysis,
    /// Classifier transport unreachable; the job fails.
    FatalTransport,
    /// PDF read/write failure during a mutation or render.
    MutationFailure,
    /// Attempt to mutate a pinned document or a retained artifact.
    ConcurrencyViolation,
    /// Bugs, panics in blocking tasks, bad configuration.
    Internal,
}

/// All fatal errors returned by the offer-anonymizer library.
#[derive(Debug, Error)]
pub enum AnonError {
    // ── Input validation ──────────────────────────────────────────────────
    /// The artifact the job points at does not exist in storage.
    #[error("Artifact not found: '{path}'\nThe job may reference a deleted upload.")]
    ArtifactNotFound { path: String },

    /// The bytes are not a PDF.
    #[error("File '{path}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { path: String, magic: [u8; 4] },

    /// The PDF could not be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: String, detail: String },

    /// Uploaded file exceeds the configured size cap.
    #[error("File is {size_mb:.1} MB, limit is {limit_mb} MB")]
    FileTooLarge { size_mb: f64, limit_mb: u64 },

    /// One or more page indices fall outside `[0, page_count)`.
    #[error("Invalid page numbers: {invalid:?} (document has {page_count} pages)")]
    InvalidPages { invalid: Vec<usize>, page_count: usize },

    /// A page-deletion call named no pages.
    #[error("No pages specified")]
    EmptyPageSelection,

    /// Page width or height is zero, negative or not finite.
    #[error("Degenerate page geometry {width}x{height}: width and height must be positive")]
    DegeneratePage { width: f64, height: f64 },

    /// A bounding box or replacement instruction is unusable.
    #[error("Invalid instruction: {detail}")]
    InvalidInstruction { detail: String },

    /// Storage paths must stay below the storage root.
    #[error("Storage path '{path}' must be relative and must not leave the storage root")]
    InvalidStoragePath { path: String },

    /// No job with this id exists.
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    /// Retry was requested for a job that is finished or already waiting.
    #[error("Job is already {status}, cannot retry")]
    RetryRejected { status: JobStatus },

    /// The requested operation is not allowed from the job's current status.
    #[error("Job {job_id} is {status}; cannot {action}")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    // ── Analysis errors ───────────────────────────────────────────────────
    /// The classifier transport cannot be reached at all.
    #[error("Classifier unreachable during {stage}: {detail}")]
    ClassifierUnreachable { stage: String, detail: String },

    /// The aggregate watchdog over the whole analysis sequence fired.
    #[error("Analysis exceeded the {limit_ms}ms watchdog ({completed} of {total} stages finished)")]
    AnalysisWatchdogExpired {
        limit_ms: u64,
        completed: usize,
        total: usize,
    },

    /// The configured VLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Mutation errors ───────────────────────────────────────────────────
    /// lopdf failed to rewrite or serialise the document.
    #[error("PDF mutation failed: {detail}")]
    MutationFailed { detail: String },

    /// pdfium could not rasterise a page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The pdfium shared library could not be loaded.
    #[error("Failed to bind to pdfium library: {0}\nSet PDFIUM_LIB_PATH to the directory containing libpdfium.")]
    PdfiumBindingFailed(String),

    /// Storage read/write failure.
    #[error("Storage I/O failed for '{path}': {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Concurrency violations ────────────────────────────────────────────
    /// The job's document is pinned; destructive edits are refused.
    #[error("Job {job_id} is pinned; destructive edits are refused until it is unpinned")]
    DocumentPinned { job_id: Uuid },

    /// The write would overwrite a retained artifact in place.
    #[error("Artifact '{path}' is retained and cannot be modified in place")]
    RetainedArtifact { path: String },

    // ── Configuration / internal ──────────────────────────────────────────
    /// Configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialising a job, twin or audit record failed.
    #[error("Serialisation failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unexpected internal error (bug or panic in a blocking task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnonError {
    /// Classify this error into the pipeline's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnonError::ArtifactNotFound { .. }
            | AnonError::NotAPdf { .. }
            | AnonError::CorruptPdf { .. }
            | AnonError::FileTooLarge { .. }
            | AnonError::InvalidPages { .. }
            | AnonError::EmptyPageSelection
            | AnonError::DegeneratePage { .. }
            | AnonError::InvalidInstruction { .. }
            | AnonError::InvalidStoragePath { .. }
            | AnonError::JobNotFound { .. }
            | AnonError::RetryRejected { .. }
            | AnonError::InvalidTransition { .. } => ErrorKind::InputValidation,

            AnonError::ClassifierUnreachable { .. }
            | AnonError::ProviderNotConfigured { .. } => ErrorKind::FatalTransport,

            AnonError::AnalysisWatchdogExpired { .. } => ErrorKind::TransientAnalysis,

            AnonError::MutationFailed { .. }
            | AnonError::RasterisationFailed { .. }
            | AnonError::Storage { .. } => ErrorKind::MutationFailure,

            AnonError::DocumentPinned { .. } | AnonError::RetainedArtifact { .. } => {
                ErrorKind::ConcurrencyViolation
            }

            AnonError::PdfiumBindingFailed(_)
            | AnonError::InvalidConfig(_)
            | AnonError::Serialization(_)
            | AnonError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<lopdf::Error> for AnonError {
    fn from(e: lopdf::Error) -> Self {
        AnonError::MutationFailed {
            detail: e.to_string(),
        }
    }
}

/// A degraded analysis stage. Non-fatal: the stage yields an empty result.
#[derive(Debug, Clone, Error, Serialize)]
pub enum StageError {
    /// The per-call deadline elapsed before the classifier answered.
    #[error("{stage}: timed out after {elapsed_ms}ms")]
    Timeout { stage: String, elapsed_ms: u64 },

    /// The classifier answered with something that could not be parsed.
    #[error("{stage}: malformed response: {detail}")]
    Malformed { stage: String, detail: String },

    /// The classifier call failed but the transport is reachable.
    #[error("{stage}: classifier error: {detail}")]
    Failed { stage: String, detail: String },
}

impl StageError {
    /// Name of the analysis stage that degraded.
    pub fn stage(&self) -> &str {
        match self {
            StageError::Timeout { stage, .. }
            | StageError::Malformed { stage, .. }
            | StageError::Failed { stage, .. } => stage,
        }
    }
}
