//! Worker pool that drives queued jobs through [`JobPipeline::process`].

use crate::jobs::JobPipeline;
use crate::job::{Job, JobStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Polling interval when the queue is empty.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Jobs processed at the same time.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

const EVENT_CAPACITY: usize = 256;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Read the config from the environment, falling back to defaults.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `ANON_WORKER_ENABLED` | `true` |
    /// | `ANON_MAX_CONCURRENT_JOBS` | `2` |
    /// | `ANON_POLL_INTERVAL_MS` | `500` |
    pub fn from_env() -> Self {
        let enabled = std::env::var("ANON_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("ANON_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS)
            .max(1);

        let poll_interval_ms = std::env::var("ANON_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    WorkerStarted,
    JobStarted { job_id: Uuid },
    /// The job left processing in `review`.
    JobCompleted { job_id: Uuid, elapsed_ms: u64 },
    /// The job ended in `failed` (or could not be processed at all).
    JobFailed { job_id: Uuid, error: String },
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Ask the worker to stop after the current batch.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Worker already stopped");
        }
    }

    /// A fresh receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Claims queued jobs and processes up to `max_concurrent_jobs` at a time.
pub struct JobWorker {
    pipeline: Arc<JobPipeline>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(pipeline: Arc<JobPipeline>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pipeline,
            config,
            event_tx,
        }
    }

    /// Spawn the worker loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            "Job worker started (max {} concurrent, poll {}ms)",
            self.config.max_concurrent_jobs, self.config.poll_interval_ms
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..self.config.max_concurrent_jobs {
                match self.claim().await {
                    Some(job) => {
                        let pipeline = Arc::clone(&self.pipeline);
                        let events = self.event_tx.clone();
                        tasks.spawn(execute(pipeline, events, job));
                    }
                    None => break,
                }
            }

            if tasks.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!("Processing a batch of {} jobs", tasks.len());
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!("Job task panicked: {}", e);
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    async fn claim(&self) -> Option<Job> {
        match self.pipeline.store().claim_next_queued().await {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to claim job: {}", e);
                None
            }
        }
    }
}

async fn execute(pipeline: Arc<JobPipeline>, events: broadcast::Sender<WorkerEvent>, job: Job) {
    let start = Instant::now();
    let job_id = job.id;
    info!("Processing job {} ('{}')", job_id, job.filename);
    let _ = events.send(WorkerEvent::JobStarted { job_id });

    let event = match pipeline.process(job_id).await {
        Ok(job) if job.status == JobStatus::Review => WorkerEvent::JobCompleted {
            job_id,
            elapsed_ms: start.elapsed().as_millis() as u64,
        },
        Ok(job) => WorkerEvent::JobFailed {
            job_id,
            error: job
                .error_message
                .unwrap_or_else(|| format!("job ended in {}", job.status)),
        },
        Err(e) => WorkerEvent::JobFailed {
            job_id,
            error: e.to_string(),
        },
    };
    let _ = events.send(event);
}
