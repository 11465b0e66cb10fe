//! Owner-scoped batch operations and the hooks used by the job executor.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    normalize_dossier_codes, Batch, BatchError, BatchJob, BatchStore, BatchSummary, JobAction,
    JobPage, JobStatus, Totals,
};
use crate::pricing::{PriceTable, TokenUsage};

const ERRORS_CSV_HEADER: [&str; 4] = ["dossier_code", "attempts", "error", "updated_at"];

#[derive(Clone)]
pub struct BatchService {
    store: Arc<dyn BatchStore>,
    prices: Arc<PriceTable>,
    page_size: usize,
}

impl BatchService {
    pub fn new(store: Arc<dyn BatchStore>, prices: PriceTable, page_size: usize) -> Self {
        Self {
            store,
            prices: Arc::new(prices),
            page_size: page_size.max(1),
        }
    }

    /// Load a batch and make sure `caller` owns it.
    async fn owned_batch(&self, caller: &str, batch_id: Uuid) -> Result<Batch, BatchError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(BatchError::BatchNotFound(batch_id))?;

        if batch.owner != caller {
            warn!("User '{}' denied access to batch {}", caller, batch_id);
            return Err(BatchError::Forbidden(batch_id));
        }
        Ok(batch)
    }

    async fn owned_job(
        &self,
        caller: &str,
        batch_id: Uuid,
        job_id: Uuid,
    ) -> Result<BatchJob, BatchError> {
        self.owned_batch(caller, batch_id).await?;
        self.store
            .get_job(batch_id, job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))
    }

    async fn summarize(&self, batch: Batch) -> Result<BatchSummary, BatchError> {
        let jobs = self.store.jobs(batch.id, None).await?;
        Ok(BatchSummary {
            id: batch.id,
            name: batch.name,
            paused: batch.paused,
            created_at: batch.created_at,
            totals: Totals::tally(&jobs, &self.prices),
        })
    }

    /// Write a job back after a transition, treating a vanished row as not found.
    async fn save(&self, job: &BatchJob) -> Result<(), BatchError> {
        if self.store.update_job(job).await? {
            Ok(())
        } else {
            Err(BatchError::JobNotFound(job.id))
        }
    }

    // ========================================================================
    // Owner-scoped operations
    // ========================================================================

    /// Create a batch for `caller` with an initial list of case numbers.
    ///
    /// The batch starts running when it received at least one job and stays
    /// paused otherwise.
    pub async fn create_batch<S: AsRef<str>>(
        &self,
        caller: &str,
        name: &str,
        dossier_codes: &[S],
    ) -> Result<BatchSummary, BatchError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BatchError::Validation("batch name is required".to_string()));
        }
        let codes = normalize_dossier_codes(dossier_codes)?;

        let batch = Batch::new(name, caller);
        let batch_id = batch.id;
        self.store.insert_batch(batch).await?;

        let jobs: Vec<BatchJob> = codes.iter().map(|c| BatchJob::new(batch_id, c)).collect();
        let inserted = self.store.insert_jobs(batch_id, jobs).await?;
        if inserted > 0 {
            self.store.set_paused(batch_id, false).await?;
        }

        info!(
            "Created batch {} '{}' for '{}' with {} jobs",
            batch_id, name, caller, inserted
        );
        self.get_summary(caller, batch_id).await
    }

    pub async fn list_batches(&self, caller: &str) -> Result<Vec<BatchSummary>, BatchError> {
        let batches = self.store.batches_for_owner(caller).await?;
        let mut summaries = Vec::with_capacity(batches.len());
        for batch in batches {
            summaries.push(self.summarize(batch).await?);
        }
        Ok(summaries)
    }

    pub async fn get_summary(&self, caller: &str, batch_id: Uuid) -> Result<BatchSummary, BatchError> {
        let batch = self.owned_batch(caller, batch_id).await?;
        self.summarize(batch).await
    }

    /// Pause or resume a batch.
    ///
    /// Resuming a batch with nothing pending leaves it paused.
    pub async fn set_paused(
        &self,
        caller: &str,
        batch_id: Uuid,
        paused: bool,
    ) -> Result<BatchSummary, BatchError> {
        self.owned_batch(caller, batch_id).await?;

        let paused = if paused {
            true
        } else {
            let pending = self.store.jobs(batch_id, Some(JobStatus::Pending)).await?;
            if pending.is_empty() {
                info!("Batch {} has no pending jobs, keeping it paused", batch_id);
            }
            pending.is_empty()
        };

        if !self.store.set_paused(batch_id, paused).await? {
            return Err(BatchError::BatchNotFound(batch_id));
        }
        info!("Batch {} paused={}", batch_id, paused);
        self.get_summary(caller, batch_id).await
    }

    /// One page of jobs, with costs backfilled for READY jobs that lack one.
    pub async fn list_jobs(
        &self,
        caller: &str,
        batch_id: Uuid,
        status: Option<JobStatus>,
        page: usize,
    ) -> Result<JobPage, BatchError> {
        if page == 0 {
            return Err(BatchError::Validation("page starts at 1".to_string()));
        }
        self.owned_batch(caller, batch_id).await?;

        let offset = (page - 1) * self.page_size;
        let (mut jobs, total) = self
            .store
            .page_jobs(batch_id, status, offset, self.page_size)
            .await?;

        for job in jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Ready && j.cost.is_none())
        {
            let cost = self.prices.cost(job.model.as_deref(), job.usage.as_ref());
            if self.store.set_cost_if_missing(batch_id, job.id, cost).await? {
                debug!("Backfilled cost {:.6} for job {}", cost, job.id);
                job.cost = Some(cost);
            } else if let Some(stored) = self.store.get_job(batch_id, job.id).await? {
                job.cost = stored.cost;
            }
        }

        Ok(JobPage {
            page,
            page_size: self.page_size,
            total,
            jobs,
        })
    }

    /// Add case numbers to a batch.
    ///
    /// Numbers already in the batch are skipped, except stopped ones, which
    /// go back to pending. Returns how many jobs were inserted or re-queued.
    pub async fn add_jobs<S: AsRef<str>>(
        &self,
        caller: &str,
        batch_id: Uuid,
        dossier_codes: &[S],
    ) -> Result<usize, BatchError> {
        self.owned_batch(caller, batch_id).await?;
        let codes = normalize_dossier_codes(dossier_codes)?;

        let existing: HashMap<String, BatchJob> = self
            .store
            .jobs(batch_id, None)
            .await?
            .into_iter()
            .map(|j| (j.dossier_code.clone(), j))
            .collect();

        let mut new_jobs = Vec::new();
        let mut requeued = 0;
        for code in codes {
            match existing.get(&code) {
                Some(job) if job.status == JobStatus::Stopped => {
                    let mut job = job.clone();
                    job.transition(JobAction::Readd)?;
                    job.error = None;
                    if self.store.update_job(&job).await? {
                        requeued += 1;
                    }
                }
                Some(_) => debug!("Skipping duplicate case {} in batch {}", code, batch_id),
                None => new_jobs.push(BatchJob::new(batch_id, code)),
            }
        }

        let inserted = self.store.insert_jobs(batch_id, new_jobs).await?;
        info!(
            "Batch {}: {} jobs added, {} re-queued",
            batch_id, inserted, requeued
        );
        Ok(inserted + requeued)
    }

    pub async fn delete_jobs<S: AsRef<str>>(
        &self,
        caller: &str,
        batch_id: Uuid,
        dossier_codes: &[S],
    ) -> Result<usize, BatchError> {
        self.owned_batch(caller, batch_id).await?;
        let codes = normalize_dossier_codes(dossier_codes)?;

        let removed = self.store.delete_jobs(batch_id, &codes).await?;
        info!("Batch {}: {} jobs deleted", batch_id, removed);
        Ok(removed)
    }

    /// Send a failed job back to the queue.
    pub async fn retry_job(
        &self,
        caller: &str,
        batch_id: Uuid,
        job_id: Uuid,
    ) -> Result<BatchJob, BatchError> {
        let mut job = self.owned_job(caller, batch_id, job_id).await?;
        job.transition(JobAction::Retry)?;
        job.error = None;
        self.save(&job).await?;

        info!("Batch {}: job {} re-queued", batch_id, job_id);
        Ok(job)
    }

    pub async fn retry_all_errors(&self, caller: &str, batch_id: Uuid) -> Result<usize, BatchError> {
        self.owned_batch(caller, batch_id).await?;

        let mut count = 0;
        for mut job in self.store.jobs(batch_id, Some(JobStatus::Error)).await? {
            job.transition(JobAction::Retry)?;
            job.error = None;
            if self.store.update_job(&job).await? {
                count += 1;
            }
        }

        info!("Batch {}: {} failed jobs re-queued", batch_id, count);
        Ok(count)
    }

    pub async fn stop_job(
        &self,
        caller: &str,
        batch_id: Uuid,
        job_id: Uuid,
    ) -> Result<BatchJob, BatchError> {
        let mut job = self.owned_job(caller, batch_id, job_id).await?;
        job.transition(JobAction::Stop)?;
        self.save(&job).await?;

        info!("Batch {}: job {} stopped", batch_id, job_id);
        Ok(job)
    }

    /// All failed jobs of a batch as CSV.
    pub async fn errors_csv(&self, caller: &str, batch_id: Uuid) -> Result<String, BatchError> {
        self.owned_batch(caller, batch_id).await?;
        let jobs = self.store.jobs(batch_id, Some(JobStatus::Error)).await?;

        #[derive(Serialize)]
        struct ErrorRow<'a> {
            dossier_code: &'a str,
            attempts: u32,
            error: &'a str,
            updated_at: String,
        }

        let export = |e: csv::Error| BatchError::Export(e.to_string());
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(ERRORS_CSV_HEADER).map_err(export)?;

        for job in &jobs {
            writer
                .serialize(ErrorRow {
                    dossier_code: &job.dossier_code,
                    attempts: job.attempts,
                    error: job.error.as_deref().unwrap_or_default(),
                    updated_at: job.updated_at.to_rfc3339(),
                })
                .map_err(export)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| BatchError::Export(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| BatchError::Export(e.to_string()))
    }

    // ========================================================================
    // Executor hooks
    // ========================================================================

    /// Next job to run, or `None` when the batch is paused or drained.
    pub async fn next_pending(&self, batch_id: Uuid) -> Result<Option<BatchJob>, BatchError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(BatchError::BatchNotFound(batch_id))?;
        if batch.paused {
            return Ok(None);
        }

        let (mut jobs, _) = self
            .store
            .page_jobs(batch_id, Some(JobStatus::Pending), 0, 1)
            .await?;
        Ok(jobs.pop())
    }

    pub async fn complete_job(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        model: Option<String>,
        usage: TokenUsage,
    ) -> Result<BatchJob, BatchError> {
        let mut job = self
            .store
            .get_job(batch_id, job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))?;

        job.transition(JobAction::Complete)?;
        job.attempts += 1;
        job.error = None;
        job.model = Some(model.unwrap_or_else(|| self.prices.default_model().to_string()));
        job.usage = Some(usage);
        job.cost = None;
        self.save(&job).await?;

        debug!("Batch {}: job {} ready", batch_id, job_id);
        Ok(job)
    }

    pub async fn fail_job(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        message: &str,
    ) -> Result<BatchJob, BatchError> {
        let mut job = self
            .store
            .get_job(batch_id, job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))?;

        job.transition(JobAction::Fail)?;
        job.attempts += 1;
        job.error = Some(message.to_string());
        self.save(&job).await?;

        warn!("Batch {}: job {} failed: {}", batch_id, job_id, message);
        Ok(job)
    }
}
