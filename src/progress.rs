//! Observer trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] into [`crate::jobs::JobPipeline`] to
//! receive status changes, progress checkpoints and advisories as they are
//! persisted. Callers can forward them to a broadcast channel, a WebSocket or
//! a terminal progress bar; the pipeline knows nothing about the transport.
//!
//! Events fire after the job record has been saved, so an observer that
//! re-reads the store always sees at least the state it was told about.
//!
//! # Example
//!
//! ```rust
//! use offer_anonymizer::{PipelineObserver, JobStatus};
//! use std::sync::{Arc, atomic::{AtomicU8, Ordering}};
//! use uuid::Uuid;
//!
//! struct LastProgress(AtomicU8);
//!
//! impl PipelineObserver for LastProgress {
//!     fn on_progress(&self, _job_id: Uuid, progress: u8) {
//!         self.0.store(progress, Ordering::SeqCst);
//!     }
//! }
//!
//! let observer = Arc::new(LastProgress(AtomicU8::new(0)));
//! observer.on_progress(Uuid::nil(), 55);
//! assert_eq!(observer.0.load(Ordering::SeqCst), 55);
//! ```

use crate::job::JobStatus;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the pipeline as a job moves through its lifecycle.
///
/// Must be `Send + Sync`: the worker runs several jobs concurrently. All
/// methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// The job entered `status`.
    fn on_status(&self, job_id: Uuid, status: JobStatus) {
        let _ = (job_id, status);
    }

    /// A progress checkpoint (0–100) was saved.
    fn on_progress(&self, job_id: Uuid, progress: u8) {
        let _ = (job_id, progress);
    }

    /// A non-fatal note was attached to the job.
    fn on_advisory(&self, job_id: Uuid, message: &str) {
        let _ = (job_id, message);
    }

    /// The job failed; `error` is the message stored on the job.
    fn on_failed(&self, job_id: Uuid, error: &str) {
        let _ = (job_id, error);
    }
}

/// An observer that ignores everything. The pipeline default.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias for the type held by the pipeline.
pub type SharedObserver = Arc<dyn PipelineObserver>;
