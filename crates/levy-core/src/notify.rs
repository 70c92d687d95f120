use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};
use crate::traits::Notifier;

/// Payload delivered to a job's callback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobNotification {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            completed_at: job.completed_at,
            total: job.counters.total,
            successful: job.counters.successful,
            failed: job.counters.failed,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Upper bound on one delivery attempt.
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The job has no callback target.
    Skipped,
    Failed,
}

/// Sends job completion notifications. Delivery problems are logged and
/// never touch the job.
#[derive(Clone)]
pub struct NotificationDispatcher<N: Notifier> {
    notifier: N,
    config: NotifyConfig,
}

impl<N: Notifier> NotificationDispatcher<N> {
    pub fn new(notifier: N, config: NotifyConfig) -> Self {
        Self { notifier, config }
    }

    pub async fn notify(&self, job: &Job) -> Delivery {
        let Some(target) = job.callback_url.as_deref() else {
            return Delivery::Skipped;
        };
        let payload = JobNotification::from(job);

        let result = match tokio::time::timeout(
            self.config.timeout,
            self.notifier.notify(target, &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.config.timeout)),
        };

        match result {
            Ok(()) => {
                tracing::info!(job_id = %job.id, %target, status = %job.status, "Job notification delivered");
                Delivery::Delivered
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, %target, error = %e, "Job notification failed");
                Delivery::Failed
            }
        }
    }
}
