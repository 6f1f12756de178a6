//! Job persistence contract.
//!
//! Jobs are whole-entity records: load, mutate in memory, `save`. There is no
//! multi-record transaction; the last write per job id wins. The pipeline
//! calls `save` at every checkpoint so a crashed worker leaves the last
//! persisted status and progress behind for diagnosis.

use crate::error::AnonError;
use crate::job::{Job, JobStatus};
use crate::storage::Storage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Load/save contract for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<Job>, AnonError>;

    async fn save(&self, job: &Job) -> Result<(), AnonError>;

    async fn list(&self) -> Result<Vec<Job>, AnonError>;

    async fn delete(&self, id: Uuid) -> Result<(), AnonError>;

    /// Atomically pick the oldest queued job and mark it `processing`.
    async fn claim_next_queued(&self) -> Result<Option<Job>, AnonError>;
}

/// Load a job or fail with [`AnonError::JobNotFound`].
pub async fn require(store: &dyn JobStore, id: Uuid) -> Result<Job, AnonError> {
    store
        .load(id)
        .await?
        .ok_or(AnonError::JobNotFound { job_id: id })
}

fn claim(job: &mut Job) {
    job.set_status(JobStatus::Processing);
}

/// In-process store. Used by tests and single-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, id: Uuid) -> Result<Option<Job>, AnonError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn save(&self, job: &Job) -> Result<(), AnonError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, AnonError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn delete(&self, id: Uuid) -> Result<(), AnonError> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn claim_next_queued(&self) -> Result<Option<Job>, AnonError> {
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| j.created_at);
        Ok(next.map(|job| {
            claim(job);
            job.clone()
        }))
    }
}

/// Store that keeps each job as `jobs/{id}.json` in a [`Storage`] backend.
pub struct StorageJobStore {
    storage: Arc<dyn Storage>,
    /// Serialises `claim_next_queued` within this process.
    claim_lock: Mutex<()>,
    index: RwLock<Vec<Uuid>>,
}

impl StorageJobStore {
    const INDEX: &'static str = "jobs/index.json";

    /// Open the store, reading the job index if one exists.
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self, AnonError> {
        let index = if storage.exists(Self::INDEX).await? {
            serde_json::from_slice(&storage.load(Self::INDEX).await?)?
        } else {
            Vec::new()
        };
        Ok(Self {
            storage,
            claim_lock: Mutex::new(()),
            index: RwLock::new(index),
        })
    }

    fn path(id: Uuid) -> String {
        format!("jobs/{id}.json")
    }

    async fn write_index(&self, index: &[Uuid]) -> Result<(), AnonError> {
        self.storage
            .save(Self::INDEX, &serde_json::to_vec(index)?)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl JobStore for StorageJobStore {
    async fn load(&self, id: Uuid) -> Result<Option<Job>, AnonError> {
        let path = Self::path(id);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.storage.load(&path).await?)?))
    }

    async fn save(&self, job: &Job) -> Result<(), AnonError> {
        let bytes = serde_json::to_vec_pretty(job)?;
        self.storage.save(&Self::path(job.id), &bytes).await?;

        let mut index = self.index.write().await;
        if !index.contains(&job.id) {
            index.push(job.id);
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, AnonError> {
        let ids = self.index.read().await.clone();
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn delete(&self, id: Uuid) -> Result<(), AnonError> {
        let mut index = self.index.write().await;
        index.retain(|j| *j != id);
        self.write_index(&index).await?;
        self.storage.remove(&Self::path(id)).await
    }

    async fn claim_next_queued(&self) -> Result<Option<Job>, AnonError> {
        let _guard = self.claim_lock.lock().await;
        let next = self
            .list()
            .await?
            .into_iter()
            .find(|j| j.status == JobStatus::Queued);
        match next {
            Some(mut job) => {
                claim(&mut job);
                self.save(&job).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}
