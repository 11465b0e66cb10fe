//! Batch persistence.
//!
//! [`BatchStore`] is the seam to whatever database holds batch rows. Each
//! method is one discrete statement; callers read and then act with no
//! transaction in between, so concurrent status writes are last-write-wins.
//! A dossier code appears at most once per batch, which the store enforces
//! the way a unique constraint would.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{Batch, BatchJob, JobStatus};

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn insert_batch(&self, batch: Batch) -> Result<()>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    /// Batches owned by `owner`, newest first.
    async fn batches_for_owner(&self, owner: &str) -> Result<Vec<Batch>>;

    /// Returns false when the batch does not exist.
    async fn set_paused(&self, batch_id: Uuid, paused: bool) -> Result<bool>;

    /// Jobs of a batch in insertion order, optionally filtered by status.
    async fn jobs(&self, batch_id: Uuid, status: Option<JobStatus>) -> Result<Vec<BatchJob>>;

    /// One slice of [`BatchStore::jobs`] plus the unsliced count.
    async fn page_jobs(
        &self,
        batch_id: Uuid,
        status: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<BatchJob>, usize)>;

    async fn get_job(&self, batch_id: Uuid, job_id: Uuid) -> Result<Option<BatchJob>>;

    /// Insert jobs whose dossier code is not in the batch yet. Returns the
    /// number of rows actually inserted.
    async fn insert_jobs(&self, batch_id: Uuid, jobs: Vec<BatchJob>) -> Result<usize>;

    /// Overwrite a job row. Returns false when the job no longer exists.
    async fn update_job(&self, job: &BatchJob) -> Result<bool>;

    /// Set `cost` only if it is still empty. Returns whether it was written.
    async fn set_cost_if_missing(&self, batch_id: Uuid, job_id: Uuid, cost: f64) -> Result<bool>;

    /// Returns the number of rows removed.
    async fn delete_jobs(&self, batch_id: Uuid, dossier_codes: &[String]) -> Result<usize>;
}

#[derive(Debug)]
struct BatchEntry {
    batch: Batch,
    jobs: Vec<BatchJob>,
}

/// Process-local store backed by a shared map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchStore {
    inner: Arc<RwLock<HashMap<Uuid, BatchEntry>>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, BatchEntry>>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("batch store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, BatchEntry>>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("batch store lock poisoned"))
    }
}

fn status_matches(job: &BatchJob, status: Option<JobStatus>) -> bool {
    status.map_or(true, |s| job.status == s)
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn insert_batch(&self, batch: Batch) -> Result<()> {
        let mut store = self.write()?;
        tracing::debug!("BatchStore: inserted batch {}", batch.id);
        store.insert(
            batch.id,
            BatchEntry {
                batch,
                jobs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        Ok(self.read()?.get(&batch_id).map(|e| e.batch.clone()))
    }

    async fn batches_for_owner(&self, owner: &str) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self
            .read()?
            .values()
            .filter(|e| e.batch.owner == owner)
            .map(|e| e.batch.clone())
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn set_paused(&self, batch_id: Uuid, paused: bool) -> Result<bool> {
        let mut store = self.write()?;
        match store.get_mut(&batch_id) {
            Some(entry) => {
                entry.batch.paused = paused;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn jobs(&self, batch_id: Uuid, status: Option<JobStatus>) -> Result<Vec<BatchJob>> {
        let store = self.read()?;
        Ok(store
            .get(&batch_id)
            .map(|e| {
                e.jobs
                    .iter()
                    .filter(|j| status_matches(j, status))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn page_jobs(
        &self,
        batch_id: Uuid,
        status: Option<JobStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<BatchJob>, usize)> {
        let store = self.read()?;
        let Some(entry) = store.get(&batch_id) else {
            return Ok((Vec::new(), 0));
        };

        let total = entry.jobs.iter().filter(|j| status_matches(j, status)).count();
        let page = entry
            .jobs
            .iter()
            .filter(|j| status_matches(j, status))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok((page, total))
    }

    async fn get_job(&self, batch_id: Uuid, job_id: Uuid) -> Result<Option<BatchJob>> {
        let store = self.read()?;
        Ok(store
            .get(&batch_id)
            .and_then(|e| e.jobs.iter().find(|j| j.id == job_id))
            .cloned())
    }

    async fn insert_jobs(&self, batch_id: Uuid, jobs: Vec<BatchJob>) -> Result<usize> {
        let mut store = self.write()?;
        let entry = store
            .get_mut(&batch_id)
            .ok_or_else(|| anyhow!("cannot insert jobs into unknown batch {}", batch_id))?;

        let mut seen: HashSet<String> = entry.jobs.iter().map(|j| j.dossier_code.clone()).collect();
        let before = entry.jobs.len();
        entry
            .jobs
            .extend(jobs.into_iter().filter(|j| seen.insert(j.dossier_code.clone())));
        let count = entry.jobs.len() - before;
        tracing::debug!("BatchStore: inserted {} jobs into {}", count, batch_id);
        Ok(count)
    }

    async fn update_job(&self, job: &BatchJob) -> Result<bool> {
        let mut store = self.write()?;
        let slot = store
            .get_mut(&job.batch_id)
            .and_then(|e| e.jobs.iter_mut().find(|j| j.id == job.id));

        match slot {
            Some(existing) => {
                *existing = job.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_cost_if_missing(&self, batch_id: Uuid, job_id: Uuid, cost: f64) -> Result<bool> {
        let mut store = self.write()?;
        let slot = store
            .get_mut(&batch_id)
            .and_then(|e| e.jobs.iter_mut().find(|j| j.id == job_id));

        match slot {
            Some(job) if job.cost.is_none() => {
                job.cost = Some(cost);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_jobs(&self, batch_id: Uuid, dossier_codes: &[String]) -> Result<usize> {
        let mut store = self.write()?;
        let Some(entry) = store.get_mut(&batch_id) else {
            return Ok(0);
        };

        let before = entry.jobs.len();
        entry.jobs.retain(|j| !dossier_codes.contains(&j.dossier_code));
        Ok(before - entry.jobs.len())
    }
}
