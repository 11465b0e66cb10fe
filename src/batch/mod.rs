//! Batches of per-case generation jobs and their run state.
//!
//! A [`Batch`] groups [`BatchJob`]s for a single owner. Job status moves
//! through a small state machine ([`JobStatus::apply`]); the component that
//! actually runs jobs lives outside this crate and drives the
//! `complete`/`fail` transitions through [`BatchService`].

pub mod service;
pub mod store;

pub use service::BatchService;
pub use store::{BatchStore, InMemoryBatchStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::pricing::{PriceTable, TokenUsage};

/// Number of digits in a CNJ unified case number.
const DOSSIER_CODE_DIGITS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("batch {0} belongs to another user")]
    Forbidden(Uuid),
    #[error("{0}")]
    Validation(String),
    #[error("cannot {action} a job in status {from}")]
    InvalidTransition { from: JobStatus, action: JobAction },
    #[error("failed to export errors: {0}")]
    Export(String),
    #[error("storage failure: {0}")]
    Store(#[from] anyhow::Error),
}

// ============================================================================
// Job state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Ready,
    Error,
    Stopped,
}

/// Everything that can happen to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Executor produced a result.
    Complete,
    /// Executor gave up on the job.
    Fail,
    Retry,
    Stop,
    /// Case number submitted again through `add_jobs`.
    Readd,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Ready,
        JobStatus::Error,
        JobStatus::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Ready => "READY",
            JobStatus::Error => "ERROR",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// Status after `action`, or `InvalidTransition`.
    ///
    /// Both levels of the match are exhaustive with no wildcard arm, so a new
    /// status or action does not compile until every pair is decided.
    pub fn apply(self, action: JobAction) -> Result<JobStatus, BatchError> {
        use JobStatus::*;

        let next = match action {
            JobAction::Complete => match self {
                Pending => Some(Ready),
                Ready | Error | Stopped => None,
            },
            JobAction::Fail => match self {
                Pending => Some(Error),
                Ready | Error | Stopped => None,
            },
            JobAction::Retry => match self {
                Error => Some(Pending),
                Pending | Ready | Stopped => None,
            },
            JobAction::Stop => match self {
                Pending | Ready | Error => Some(Stopped),
                Stopped => None,
            },
            JobAction::Readd => match self {
                Stopped => Some(Pending),
                Pending | Ready | Error => None,
            },
        };

        next.ok_or(BatchError::InvalidTransition { from: self, action })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BatchError::Validation(format!("unknown job status: {}", s)))
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            JobAction::Complete => "complete",
            JobAction::Fail => "fail",
            JobAction::Retry => "retry",
            JobAction::Stop => "stop",
            JobAction::Readd => "re-add",
        };
        f.write_str(verb)
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            paused: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub dossier_code: String,
    pub status: JobStatus,
    /// Message from the last failed execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// USD, filled in lazily the first time a READY job is listed.
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(batch_id: Uuid, dossier_code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            dossier_code: dossier_code.into(),
            status: JobStatus::Pending,
            error: None,
            attempts: 0,
            model: None,
            usage: None,
            cost: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, action: JobAction) -> Result<(), BatchError> {
        self.status = self.status.apply(action)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Job counts per status, derived from job rows on every read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub error: usize,
    pub stopped: usize,
    /// Sum of READY job costs in USD.
    pub cost: f64,
}

impl Totals {
    pub fn tally(jobs: &[BatchJob], prices: &PriceTable) -> Self {
        let mut totals = Totals {
            total: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match job.status {
                JobStatus::Pending => totals.pending += 1,
                JobStatus::Error => totals.error += 1,
                JobStatus::Stopped => totals.stopped += 1,
                JobStatus::Ready => {
                    totals.ready += 1;
                    totals.cost += job.cost.unwrap_or_else(|| {
                        prices.cost(job.model.as_deref(), job.usage.as_ref())
                    });
                }
            }
        }

        totals
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: Uuid,
    pub name: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub totals: Totals,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub page: usize,
    pub page_size: usize,
    /// Jobs matching the filter across all pages.
    pub total: usize,
    pub jobs: Vec<BatchJob>,
}

// ============================================================================
// Case numbers
// ============================================================================

/// Reduce a case number to its 20 digits, or `None` if it is not one.
pub fn normalize_dossier_code(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let only_number_chars = raw
        .trim()
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | ' '));

    (only_number_chars && digits.len() == DOSSIER_CODE_DIGITS).then_some(digits)
}

/// Normalize a submitted list, dropping repeats and keeping first-seen order.
/// Any invalid entry rejects the whole list.
pub fn normalize_dossier_codes<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, BatchError> {
    let mut seen = std::collections::HashSet::new();
    let mut codes = Vec::with_capacity(raw.len());
    let mut invalid = Vec::new();

    for entry in raw {
        let entry = entry.as_ref();
        if entry.trim().is_empty() {
            continue;
        }
        match normalize_dossier_code(entry) {
            Some(code) => {
                if seen.insert(code.clone()) {
                    codes.push(code);
                }
            }
            None => invalid.push(entry.trim().to_string()),
        }
    }

    if !invalid.is_empty() {
        return Err(BatchError::Validation(format!(
            "invalid case numbers: {}",
            invalid.join(", ")
        )));
    }

    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle_transitions() {
        assert_eq!(JobStatus::Pending.apply(JobAction::Complete).unwrap(), JobStatus::Ready);
        assert_eq!(JobStatus::Pending.apply(JobAction::Fail).unwrap(), JobStatus::Error);
        assert_eq!(JobStatus::Error.apply(JobAction::Retry).unwrap(), JobStatus::Pending);
        assert_eq!(JobStatus::Stopped.apply(JobAction::Readd).unwrap(), JobStatus::Pending);

        for from in [JobStatus::Pending, JobStatus::Ready, JobStatus::Error] {
            assert_eq!(from.apply(JobAction::Stop).unwrap(), JobStatus::Stopped);
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let illegal = [
            (JobStatus::Ready, JobAction::Retry),
            (JobStatus::Pending, JobAction::Retry),
            (JobStatus::Stopped, JobAction::Retry),
            (JobStatus::Stopped, JobAction::Stop),
            (JobStatus::Ready, JobAction::Complete),
            (JobStatus::Error, JobAction::Fail),
            (JobStatus::Pending, JobAction::Readd),
        ];

        for (from, action) in illegal {
            match from.apply(action) {
                Err(BatchError::InvalidTransition { from: f, action: a }) => {
                    assert_eq!(f, from);
                    assert_eq!(a, action);
                }
                other => panic!("{:?} + {:?} should be rejected, got {:?}", from, action, other),
            }
        }
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("error".parse::<JobStatus>().unwrap(), JobStatus::Error);
        assert_eq!(" READY ".parse::<JobStatus>().unwrap(), JobStatus::Ready);
        assert!("running".parse::<JobStatus>().is_err());
        assert_eq!(serde_json::to_string(&JobStatus::Stopped).unwrap(), "\"STOPPED\"");
    }

    #[test]
    fn test_normalize_dossier_code() {
        assert_eq!(
            normalize_dossier_code("5001234-56.2023.4.02.5101").as_deref(),
            Some("50012345620234025101")
        );
        assert_eq!(
            normalize_dossier_code(" 50012345620234025101 ").as_deref(),
            Some("50012345620234025101")
        );
        assert!(normalize_dossier_code("123").is_none());
        assert!(normalize_dossier_code("5001234-56.2023.4.02.510X").is_none());
    }

    #[test]
    fn test_normalize_list_dedups_and_rejects() {
        let codes = normalize_dossier_codes(&[
            "5001234-56.2023.4.02.5101",
            "50012345620234025101",
            "",
            "0000001-02.2024.4.02.0000",
        ])
        .unwrap();
        assert_eq!(codes, vec!["50012345620234025101", "00000010220244020000"]);

        let err = normalize_dossier_codes(&["50012345620234025101", "abc"]).unwrap_err();
        assert!(matches!(err, BatchError::Validation(msg) if msg.contains("abc")));
    }

    #[test]
    fn test_totals_tally() {
        let prices = PriceTable::builtin("gpt-4o");
        let batch_id = Uuid::new_v4();
        let mut ready = BatchJob::new(batch_id, "1");
        ready.status = JobStatus::Ready;
        ready.cost = Some(0.5);
        let mut failed = BatchJob::new(batch_id, "2");
        failed.status = JobStatus::Error;
        let pending = BatchJob::new(batch_id, "3");

        let totals = Totals::tally(&[ready, failed, pending], &prices);
        assert_eq!(totals.total, 3);
        assert_eq!(totals.ready, 1);
        assert_eq!(totals.error, 1);
        assert_eq!(totals.pending, 1);
        assert_eq!(totals.stopped, 0);
        assert!((totals.cost - 0.5).abs() < 1e-9);
    }
}
