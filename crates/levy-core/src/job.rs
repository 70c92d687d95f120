use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::WorkItem;

/// Status of an extraction job.
///
/// ```text
/// PENDING -> QUEUED -> RUNNING <-> RETRYING
///    |         |          |           |
///    +---------+----------+-----------+--> CANCELLED
///                         |
///                         +--> COMPLETED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    /// Running, with at least one item currently backing off.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// RUNNING or its RETRYING sub-state.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Retrying)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued) | (Queued, Running) => true,
            (Running, Retrying) | (Retrying, Running) => true,
            (Running | Retrying, Completed | Failed) => true,
            (Pending | Queued | Running | Retrying, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Per-job progress counters. `processed == successful + failed <= total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
}

impl JobCounters {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Record one resolved item. Returns false (and changes nothing) once
    /// every item has been counted.
    pub fn record(&mut self, success: bool) -> bool {
        if self.processed >= self.total {
            return false;
        }
        self.processed += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        true
    }

    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed as f64 / self.total as f64 * 100.0
    }
}

/// A batch extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Work item ids in submission order.
    pub item_ids: Vec<String>,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub max_workers: usize,
    /// Number of items currently waiting out a retry backoff.
    pub retrying: u32,
    pub callback_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: &CreateJobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_ids: request.items.iter().map(|i| i.id.clone()).collect(),
            status: JobStatus::Pending,
            counters: JobCounters::new(request.items.len()),
            max_workers: request.max_workers,
            retrying: 0,
            callback_url: request.callback_url.clone(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping start/completion times.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.retrying = 0;
        }
        self.status = next;
        Ok(())
    }

    pub fn progress(&self) -> f64 {
        self.counters.progress()
    }
}

/// Request to create a new extraction job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub items: Vec<WorkItem>,
    pub max_workers: usize,
    pub callback_url: Option<String>,
}

impl CreateJobRequest {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            max_workers: 4,
            callback_url: None,
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.items.is_empty() {
            return Err(AppError::ValidationError(
                "Job must contain at least one work item".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(AppError::ValidationError(
                "max_workers must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err(AppError::ValidationError("Work item id is empty".into()));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(AppError::ValidationError(format!(
                    "Duplicate work item id: {}",
                    item.id
                )));
            }
        }
        Ok(())
    }
}

/// Filter for listing jobs. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.created_after.is_none_or(|t| job.created_at >= t)
    }
}

/// Offset pagination for job listings.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}
