//! Job manager and bounded executor.
//!
//! Owns every job's state. A job's items run through the work dispatcher
//! with at most `max_workers` in flight; each outcome updates the job's
//! counters under its lock. When all items resolve, outcomes and the final
//! job record are written to the backing store in one upsert and the
//! notification dispatcher fires. A job that ends any other way still gets
//! its terminal record written before it notifies.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::WorkDispatcher;
use crate::error::{AppError, ErrorKind};
use crate::job::{CreateJobRequest, Job, JobFilter, JobStatus, Page};
use crate::models::{ExtractionOutcome, StrategyFamily, WorkItem};
use crate::notify::{Delivery, NotificationDispatcher};
use crate::pool::Pool;
use crate::resilience::RetryObserver;
use crate::traits::{BlockingStrategy, ConnectionManager, ExtractionStrategy, Notifier, RecordStore};
use crate::util::{self, job_key, outcome_key};

/// Configuration for the job manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-job concurrency ceiling accepted at submission.
    pub max_workers_limit: usize,
    /// Item errors kept per job.
    pub error_history: usize,
    /// How long finished jobs stay queryable before `prune_expired` drops them.
    pub retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers_limit: 64,
            error_history: 10,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ManagerConfig {
    pub fn with_error_history(mut self, n: usize) -> Self {
        self.error_history = n;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// One item failure, as kept in a job's recent error history.
#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub item_id: String,
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Error breakdown for one job.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total_errors: u64,
    /// Failed items per error kind.
    pub by_kind: BTreeMap<&'static str, u64>,
    /// Failed items as a percentage of processed items.
    pub failure_rate: f64,
    pub last_minute: usize,
    pub last_five_minutes: usize,
    pub last_hour: usize,
    pub recent: Vec<RecentError>,
}

/// Events emitted by the job manager for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Submitted {
        job_id: Uuid,
        items: usize,
    },
    Started {
        job_id: Uuid,
        max_workers: usize,
    },
    ItemFinished {
        job_id: Uuid,
        outcome: &'a ExtractionOutcome,
        progress: f64,
    },
    CancelRequested {
        job_id: Uuid,
    },
    Persisted {
        job_id: Uuid,
        rows: u64,
    },
    Finished {
        job: &'a Job,
    },
}

/// Trait for receiving job lifecycle events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Submitted { job_id, items } => {
                tracing::info!(%job_id, items, "Job submitted");
            }
            JobEvent::Started {
                job_id,
                max_workers,
            } => {
                tracing::info!(%job_id, max_workers, "Job started");
            }
            JobEvent::ItemFinished {
                job_id,
                outcome,
                progress,
            } => {
                tracing::debug!(
                    %job_id,
                    item_id = %outcome.item_id,
                    success = outcome.success,
                    progress = format_args!("{progress:.1}"),
                    "Item finished"
                );
            }
            JobEvent::CancelRequested { job_id } => {
                tracing::info!(%job_id, "Job cancellation requested");
            }
            JobEvent::Persisted { job_id, rows } => {
                tracing::debug!(%job_id, rows, "Job results persisted");
            }
            JobEvent::Finished { job } => match job.status {
                JobStatus::Failed => tracing::warn!(
                    job_id = %job.id,
                    error = job.error.as_deref().unwrap_or_default(),
                    "Job failed"
                ),
                status => tracing::info!(
                    job_id = %job.id,
                    %status,
                    successful = job.counters.successful,
                    failed = job.counters.failed,
                    "Job finished"
                ),
            },
        }
    }
}

struct JobRecord {
    job: Job,
    /// One slot per item, in submission order.
    outcomes: Vec<Option<ExtractionOutcome>>,
    errors: VecDeque<RecentError>,
    error_counts: HashMap<ErrorKind, u64>,
    failed_at: Vec<DateTime<Utc>>,
    /// Status of the job record last written to the store.
    persisted: Option<JobStatus>,
    notified: bool,
}

struct JobEntry {
    record: Mutex<JobRecord>,
    items: Arc<[WorkItem]>,
    cancel: CancellationToken,
}

impl JobEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, JobRecord> {
        util::lock(&self.record, "job record")
    }

    fn snapshot(&self) -> Job {
        self.lock().job.clone()
    }
}

/// Moves a running job in and out of RETRYING as its items back off.
struct JobRetryObserver {
    entry: Arc<JobEntry>,
    item_id: String,
}

impl RetryObserver for JobRetryObserver {
    fn backoff_started(&self, key: &str, attempt: u32, delay: Duration, error: &AppError) {
        let mut record = self.entry.lock();
        let job = &mut record.job;
        if job.status.is_terminal() {
            return;
        }
        job.retrying += 1;
        if job.status == JobStatus::Running {
            let _ = job.transition(JobStatus::Retrying);
        }
        tracing::debug!(
            job_id = %job.id,
            item_id = %self.item_id,
            domain = %key,
            attempt,
            delay_ms = %delay.as_millis(),
            error = %error,
            "Item retrying"
        );
    }

    fn backoff_finished(&self, _key: &str) {
        let mut record = self.entry.lock();
        let job = &mut record.job;
        if job.status.is_terminal() {
            return;
        }
        job.retrying = job.retrying.saturating_sub(1);
        if job.retrying == 0 && job.status == JobStatus::Retrying {
            let _ = job.transition(JobStatus::Running);
        }
    }
}

struct Inner<M, D, B, N, R>
where
    M: ConnectionManager,
    D: ExtractionStrategy,
    B: BlockingStrategy,
    N: Notifier,
{
    pool: Pool<M>,
    dispatcher: WorkDispatcher<D, B>,
    notifications: NotificationDispatcher<N>,
    reporter: R,
    config: ManagerConfig,
    jobs: RwLock<HashMap<Uuid, Arc<JobEntry>>>,
}

/// Creates, runs, tracks and cancels extraction jobs.
pub struct JobManager<M, D, B, N, R = TracingJobReporter>
where
    M: ConnectionManager,
    D: ExtractionStrategy,
    B: BlockingStrategy,
    N: Notifier,
{
    inner: Arc<Inner<M, D, B, N, R>>,
}

impl<M, D, B, N, R> Clone for JobManager<M, D, B, N, R>
where
    M: ConnectionManager,
    D: ExtractionStrategy,
    B: BlockingStrategy,
    N: Notifier,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, D, B, N> JobManager<M, D, B, N, TracingJobReporter>
where
    M: ConnectionManager,
    M::Connection: RecordStore,
    D: ExtractionStrategy + 'static,
    B: BlockingStrategy,
    N: Notifier + 'static,
{
    pub fn new(
        pool: Pool<M>,
        dispatcher: WorkDispatcher<D, B>,
        notifications: NotificationDispatcher<N>,
        config: ManagerConfig,
    ) -> Self {
        Self::with_reporter(pool, dispatcher, notifications, config, TracingJobReporter)
    }
}

impl<M, D, B, N, R> JobManager<M, D, B, N, R>
where
    M: ConnectionManager,
    M::Connection: RecordStore,
    D: ExtractionStrategy + 'static,
    B: BlockingStrategy,
    N: Notifier + 'static,
    R: JobReporter + 'static,
{
    pub fn with_reporter(
        pool: Pool<M>,
        dispatcher: WorkDispatcher<D, B>,
        notifications: NotificationDispatcher<N>,
        config: ManagerConfig,
        reporter: R,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                dispatcher,
                notifications,
                reporter,
                config,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.inner.pool
    }

    pub fn dispatcher(&self) -> &WorkDispatcher<D, B> {
        &self.inner.dispatcher
    }

    fn entry(&self, job_id: Uuid) -> Result<Arc<JobEntry>, AppError> {
        util::read(&self.inner.jobs, "job registry")
            .get(&job_id)
            .cloned()
            .ok_or(AppError::JobNotFound(job_id))
    }

    /// Validate and register a new PENDING job. Nothing is created when
    /// validation or the initial job write fails.
    pub async fn submit(&self, request: CreateJobRequest) -> Result<Uuid, AppError> {
        request.validate()?;
        if request.max_workers > self.inner.config.max_workers_limit {
            return Err(AppError::ValidationError(format!(
                "max_workers {} exceeds limit {}",
                request.max_workers, self.inner.config.max_workers_limit
            )));
        }

        let job = Job::new(&request);
        let record = serde_json::to_value(&job)?;
        {
            let mut conn = self.inner.pool.acquire_default().await?;
            conn.put(&job_key(&job.id), &record).await?;
        }

        let job_id = job.id;
        let total = request.items.len();
        let entry = Arc::new(JobEntry {
            record: Mutex::new(JobRecord {
                job,
                outcomes: vec![None; total],
                errors: VecDeque::with_capacity(self.inner.config.error_history),
                error_counts: HashMap::new(),
                failed_at: Vec::new(),
                persisted: Some(JobStatus::Pending),
                notified: false,
            }),
            items: request.items.into(),
            cancel: CancellationToken::new(),
        });
        util::write(&self.inner.jobs, "job registry").insert(job_id, entry);

        self.inner.reporter.report(JobEvent::Submitted {
            job_id,
            items: total,
        });
        Ok(job_id)
    }

    /// PENDING -> QUEUED.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), AppError> {
        self.entry(job_id)?.lock().job.transition(JobStatus::Queued)
    }

    /// Run every item of a job to completion and return the final job.
    ///
    /// Only a PENDING or QUEUED job can be started; a job cancelled before
    /// it started is finalized and returned as is. Item failures never abort
    /// the batch. The job ends FAILED only when its results cannot be
    /// persisted.
    pub async fn run(&self, job_id: Uuid) -> Result<Job, AppError> {
        let entry = self.entry(job_id)?;

        let max_workers = {
            let mut record = entry.lock();
            let job = &mut record.job;
            match job.status {
                JobStatus::Cancelled => None,
                JobStatus::Pending | JobStatus::Queued => {
                    if job.status == JobStatus::Pending {
                        job.transition(JobStatus::Queued)?;
                    }
                    job.transition(JobStatus::Running)?;
                    Some(job.max_workers)
                }
                from => {
                    return Err(AppError::InvalidTransition {
                        job_id,
                        from,
                        to: JobStatus::Running,
                    });
                }
            }
        };
        let Some(max_workers) = max_workers else {
            return Ok(self.finish(&entry).await);
        };
        self.inner.reporter.report(JobEvent::Started {
            job_id,
            max_workers,
        });

        let completed = self.execute(&entry, max_workers).await;

        if completed {
            self.persist(&entry).await;
        }
        Ok(self.finish(&entry).await)
    }

    /// Schedule items under the worker semaphore. Returns false if the job
    /// was cancelled before every item resolved.
    async fn execute(&self, entry: &Arc<JobEntry>, max_workers: usize) -> bool {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut tasks = JoinSet::new();
        let mut scheduled = HashMap::new();
        let mut pending = entry.items.iter().enumerate().peekable();

        loop {
            if pending.peek().is_none() && tasks.is_empty() {
                return true;
            }

            tokio::select! {
                biased;

                () = entry.cancel.cancelled() => {
                    tracing::info!(
                        job_id = %entry.snapshot().id,
                        in_flight = tasks.len(),
                        "Stopping job scheduling"
                    );
                    tasks.detach_all();
                    return false;
                }

                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    match joined {
                        Ok((id, outcome)) => {
                            if let Some(index) = scheduled.remove(&id) {
                                self.record_outcome(entry, index, outcome);
                            }
                        }
                        Err(e) => {
                            if let Some(index) = scheduled.remove(&e.id()) {
                                let item: &WorkItem = &entry.items[index];
                                let err = AppError::Generic(format!("item task aborted: {e}"));
                                let family = self.inner.dispatcher.table().route(&item.jurisdiction);
                                let outcome = ExtractionOutcome::failed(&item.id, &err, family, Duration::ZERO, 0);
                                self.record_outcome(entry, index, outcome);
                            }
                        }
                    }
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if pending.peek().is_some() => {
                    let Ok(permit) = permit else { return false };
                    let Some((index, item)) = pending.next() else { continue };
                    let item = item.clone();
                    let dispatcher = self.inner.dispatcher.clone();
                    let observer = JobRetryObserver {
                        entry: Arc::clone(entry),
                        item_id: item.id.clone(),
                    };
                    let handle = tasks.spawn(async move {
                        let _permit = permit;
                        dispatcher.dispatch_observed(&item, &observer).await
                    });
                    scheduled.insert(handle.id(), index);
                }
            }
        }
    }

    fn record_outcome(&self, entry: &JobEntry, index: usize, outcome: ExtractionOutcome) {
        let history = self.inner.config.error_history;
        let (job_id, progress) = {
            let mut record = entry.lock();
            if record.job.status.is_terminal() {
                tracing::debug!(
                    job_id = %record.job.id,
                    item_id = %outcome.item_id,
                    "Discarding outcome for finished job"
                );
                return;
            }
            let Some(slot) = record.outcomes.get_mut(index) else {
                return;
            };
            if slot.is_some() {
                return;
            }
            if !outcome.success {
                if let Some(kind) = outcome.error_kind {
                    *record.error_counts.entry(kind).or_default() += 1;
                }
                record.failed_at.push(outcome.finished_at);
                if history > 0 {
                    if record.errors.len() >= history {
                        record.errors.pop_front();
                    }
                    record.errors.push_back(RecentError {
                        item_id: outcome.item_id.clone(),
                        kind: outcome.error_kind,
                        message: outcome.error.clone().unwrap_or_default(),
                        at: outcome.finished_at,
                    });
                }
            }
            record.job.counters.record(outcome.success);
            record.outcomes[index] = Some(outcome.clone());
            (record.job.id, record.job.progress())
        };

        self.inner.reporter.report(JobEvent::ItemFinished {
            job_id,
            outcome: &outcome,
            progress,
        });
    }

    /// Write outcomes and the final job record in one upsert, then move the
    /// job to COMPLETED or FAILED. If the job was cancelled while the write
    /// was in flight it stays CANCELLED and `finish` overwrites the record.
    async fn persist(&self, entry: &JobEntry) {
        let (job_id, rows) = {
            let record = entry.lock();
            if record.job.status.is_terminal() {
                return;
            }
            let mut final_job = record.job.clone();
            final_job.status = JobStatus::Completed;
            final_job.retrying = 0;
            final_job.completed_at = Some(Utc::now());

            let mut rows = Vec::with_capacity(record.outcomes.len() + 1);
            for outcome in record.outcomes.iter().flatten() {
                match serde_json::to_value(outcome) {
                    Ok(value) => rows.push((outcome_key(&final_job.id, &outcome.item_id), value)),
                    Err(e) => {
                        tracing::warn!(item_id = %outcome.item_id, error = %e, "Outcome not serializable");
                    }
                }
            }
            let rows = serde_json::to_value(&final_job).map(|value| {
                rows.push((job_key(&final_job.id), value));
                rows
            });
            (final_job.id, rows)
        };

        let written = match rows {
            Ok(rows) => self.write_rows(&rows).await,
            Err(e) => Err(AppError::from(e)),
        };

        let mut record = entry.lock();
        if record.job.status.is_terminal() {
            return;
        }
        let result = match written {
            Ok(n) => {
                record.persisted = Some(JobStatus::Completed);
                self.inner.reporter.report(JobEvent::Persisted { job_id, rows: n });
                record.job.transition(JobStatus::Completed)
            }
            Err(e) => {
                record.job.error = Some(format!("Failed to persist results: {e}"));
                record.job.transition(JobStatus::Failed)
            }
        };
        if let Err(e) = result {
            tracing::error!(%job_id, error = %e, "Could not finalize job");
        }
    }

    async fn write_rows(&self, rows: &[(String, serde_json::Value)]) -> Result<u64, AppError> {
        let mut conn = self.inner.pool.acquire_default().await?;
        match conn.upsert(rows).await {
            Ok(n) => Ok(n),
            Err(e) => {
                conn.mark_unhealthy();
                Err(e)
            }
        }
    }

    /// Persist, report and notify once the job is terminal. Only the first
    /// caller for a terminal job does any of this. Returns the final job.
    async fn finish(&self, entry: &JobEntry) -> Job {
        let (job, first, stale) = {
            let mut record = entry.lock();
            let first = record.job.status.is_terminal() && !record.notified;
            if first {
                record.notified = true;
            }
            let stale = record.persisted != Some(record.job.status);
            (record.job.clone(), first, stale)
        };
        if first {
            if stale {
                self.write_final(entry, &job).await;
            }
            self.inner.reporter.report(JobEvent::Finished { job: &job });
            if self.inner.notifications.notify(&job).await == Delivery::Failed {
                tracing::debug!(job_id = %job.id, "Notification not delivered; job unchanged");
            }
        }
        job
    }

    /// Write the terminal job record outside the batch upsert. A failure
    /// here is logged; the job's status is already final.
    async fn write_final(&self, entry: &JobEntry, job: &Job) {
        let written = match serde_json::to_value(job) {
            Ok(value) => self.write_rows(&[(job_key(&job.id), value)]).await,
            Err(e) => Err(AppError::from(e)),
        };
        match written {
            Ok(rows) => {
                entry.lock().persisted = Some(job.status);
                self.inner.reporter.report(JobEvent::Persisted { job_id: job.id, rows });
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, status = %job.status, error = %e, "Final job record not persisted");
            }
        }
    }

    /// Cancel a job that has not finished. Running items may complete but
    /// their outcomes are dropped; the running task finalizes the job. A job
    /// that never started is finalized here.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, AppError> {
        let entry = self.entry(job_id)?;
        let (job, started) = {
            let mut record = entry.lock();
            let started = matches!(record.job.status, JobStatus::Running | JobStatus::Retrying);
            record.job.transition(JobStatus::Cancelled)?;
            (record.job.clone(), started)
        };
        entry.cancel.cancel();
        self.inner.reporter.report(JobEvent::CancelRequested { job_id });
        if !started {
            return Ok(self.finish(&entry).await);
        }
        Ok(job)
    }

    /// Enqueue and run a job on a background task.
    pub fn spawn(&self, job_id: Uuid) -> Result<JoinHandle<Result<Job, AppError>>, AppError> {
        self.enqueue(job_id)?;
        let manager = self.clone();
        Ok(tokio::spawn(async move { manager.run(job_id).await }))
    }

    /// Submit and start a job in one call.
    pub async fn submit_and_spawn(&self, request: CreateJobRequest) -> Result<Uuid, AppError> {
        let job_id = self.submit(request).await?;
        self.spawn(job_id)?;
        Ok(job_id)
    }

    pub fn status(&self, job_id: Uuid) -> Result<Job, AppError> {
        Ok(self.entry(job_id)?.snapshot())
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        let entries: Vec<Arc<JobEntry>> = util::read(&self.inner.jobs, "job registry")
            .values()
            .cloned()
            .collect();
        let mut jobs: Vec<Job> = entries
            .iter()
            .map(|e| e.snapshot())
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        jobs.into_iter().skip(page.offset).take(page.limit).collect()
    }

    /// Outcomes recorded so far, in submission order.
    pub fn outcomes(&self, job_id: Uuid) -> Result<Vec<ExtractionOutcome>, AppError> {
        let entry = self.entry(job_id)?;
        let record = entry.lock();
        Ok(record.outcomes.iter().flatten().cloned().collect())
    }

    /// The job's most recent item errors, oldest first.
    pub fn recent_errors(&self, job_id: Uuid) -> Result<Vec<RecentError>, AppError> {
        let entry = self.entry(job_id)?;
        let record = entry.lock();
        Ok(record.errors.iter().cloned().collect())
    }

    /// Per-kind failure counts, failure rate and recent errors for a job.
    pub fn error_summary(&self, job_id: Uuid) -> Result<ErrorSummary, AppError> {
        let entry = self.entry(job_id)?;
        let record = entry.lock();
        let now = Utc::now();
        let since = |window: chrono::Duration| {
            record.failed_at.iter().filter(|at| now - **at <= window).count()
        };
        let processed = record.job.counters.processed;
        Ok(ErrorSummary {
            total_errors: record.error_counts.values().sum(),
            by_kind: record
                .error_counts
                .iter()
                .map(|(kind, count)| (kind.as_str(), *count))
                .collect(),
            failure_rate: if processed == 0 {
                0.0
            } else {
                record.job.counters.failed as f64 / processed as f64 * 100.0
            },
            last_minute: since(chrono::Duration::minutes(1)),
            last_five_minutes: since(chrono::Duration::minutes(5)),
            last_hour: since(chrono::Duration::hours(1)),
            recent: record.errors.iter().cloned().collect(),
        })
    }

    /// Drop finished jobs completed more than `retention` ago. Returns how
    /// many were removed.
    pub fn prune(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };
        let mut jobs = util::write(&self.inner.jobs, "job registry");
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let record = entry.lock();
            !(record.job.status.is_terminal()
                && record.job.completed_at.is_some_and(|t| t < cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::info!(removed, "Pruned finished jobs");
        }
        removed
    }

    pub fn prune_expired(&self) -> usize {
        self.prune(self.inner.config.retention)
    }

    /// Strategy family an item would be routed to.
    pub fn route(&self, jurisdiction: &str) -> StrategyFamily {
        self.inner.dispatcher.table().route(jurisdiction)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::blocking::BlockingPool;
    use crate::dispatcher::RoutingTable;
    use crate::memory::MemoryConnectionManager;
    use crate::notify::NotifyConfig;
    use crate::pool::PoolConfig;
    use crate::resilience::{
        RateLimitConfig, ResilienceConfig, ResilienceController, RetryConfig,
    };
    use crate::testutil::{MockBlockingStrategy, MockNotifier, MockReporter, MockStrategy};

    type TestManager =
        JobManager<MemoryConnectionManager, MockStrategy, MockBlockingStrategy, MockNotifier, MockReporter>;

    struct Harness {
        manager: TestManager,
        store: MemoryConnectionManager,
        direct: MockStrategy,
        notifier: MockNotifier,
        reporter: MockReporter,
    }

    async fn harness(direct: MockStrategy) -> Harness {
        harness_with(direct, RetryConfig::default().with_delays(Duration::from_millis(1), Duration::from_millis(5))).await
    }

    async fn harness_with(direct: MockStrategy, retry: RetryConfig) -> Harness {
        let store = MemoryConnectionManager::new();
        let pool = Pool::open(
            store.clone(),
            PoolConfig::default()
                .with_sizes(1, 2, 1)
                .with_acquire_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        let controller = ResilienceController::new(
            ResilienceConfig::default()
                .with_rate_limit(RateLimitConfig::new(10_000.0))
                .with_retry(retry),
        )
        .unwrap();
        let dispatcher = WorkDispatcher::new(
            RoutingTable::portfolio(),
            direct.clone(),
            MockBlockingStrategy::new(),
            controller,
            BlockingPool::new(2).unwrap(),
        );
        let notifier = MockNotifier::new();
        let reporter = MockReporter::new();
        let manager = JobManager::with_reporter(
            pool,
            dispatcher,
            NotificationDispatcher::new(notifier.clone(), NotifyConfig::default()),
            ManagerConfig::default(),
            reporter.clone(),
        );
        Harness {
            manager,
            store,
            direct,
            notifier,
            reporter,
        }
    }

    /// Items on distinct hosts so breakers and limiters stay independent.
    fn items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| {
                WorkItem::new(
                    format!("p-{i}"),
                    "Montgomery County",
                    format!("https://site{i}.example/bill"),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_submission_rejected_without_state() {
        let h = harness(MockStrategy::new()).await;

        let err = h.manager.submit(CreateJobRequest::new(vec![])).await.unwrap_err();

        assert!(matches!(err, AppError::ValidationError(_)));
        assert!(h.manager.list(&JobFilter::default(), Page::default()).is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_submit_persists_pending_job() {
        let h = harness(MockStrategy::new()).await;

        let job_id = h.manager.submit(CreateJobRequest::new(items(2))).await.unwrap();

        let job = h.manager.status(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.counters.total, 2);
        assert!(h.store.snapshot().contains_key(&job_key(&job_id)));
    }

    /// Items sharing one host, so they share a breaker and a rate limiter.
    fn same_host_items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| {
                WorkItem::new(
                    format!("p-{i}"),
                    "Montgomery County",
                    format!("https://actweb.acttax.com/bill/{i}"),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ten_items_with_two_failures() {
        let direct = MockStrategy::new()
            .fail_item("p-3", || AppError::NetworkError("connection reset".into()))
            .fail_item("p-7", || AppError::NetworkError("connection reset".into()));
        let h = harness(direct).await;

        let job_id = h
            .manager
            .submit(
                CreateJobRequest::new(same_host_items(10))
                    .with_max_workers(3)
                    .with_callback_url("https://hooks.example/levy"),
            )
            .await
            .unwrap();
        let job = h.manager.run(job_id).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.processed, 10);
        assert_eq!(job.counters.successful, 8);
        assert_eq!(job.counters.failed, 2);
        assert_eq!(job.progress(), 100.0);
        assert!(job.completed_at.is_some());

        let outcomes = h.manager.outcomes(job_id).unwrap();
        assert_eq!(outcomes.len(), 10);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
        assert_eq!(
            failed.iter().map(|o| o.item_id.as_str()).collect::<Vec<_>>(),
            vec!["p-3", "p-7"]
        );
        let max_attempts = RetryConfig::default().max_attempts;
        for outcome in &failed {
            assert_eq!(outcome.error_kind, Some(ErrorKind::Network));
            assert_eq!(outcome.attempts, max_attempts);
        }
        assert_eq!(h.direct.calls().len(), 8 + 2 * max_attempts as usize);

        let errors = h.manager.recent_errors(job_id).unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == Some(ErrorKind::Network)));

        let stored = h.store.snapshot();
        assert_eq!(stored.len(), 11);
        assert_eq!(stored[&job_key(&job_id)]["status"], "completed");

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.successful, 8);
        assert_eq!(sent[0].1.failed, 2);
    }

    #[tokio::test]
    async fn test_worker_limit_is_respected() {
        let direct = MockStrategy::new().with_delay(Duration::from_millis(20));
        let h = harness(direct).await;

        let job_id = h
            .manager
            .submit(CreateJobRequest::new(items(8)).with_max_workers(2))
            .await
            .unwrap();
        h.manager.run(job_id).await.unwrap();

        assert!(h.direct.peak_concurrency() <= 2);
        assert_eq!(h.direct.calls().len(), 8);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let direct = MockStrategy::new().with_delay(Duration::from_millis(50));
        let h = harness(direct).await;

        let job_id = h
            .manager
            .submit(
                CreateJobRequest::new(items(20))
                    .with_max_workers(2)
                    .with_callback_url("https://hooks.example/levy"),
            )
            .await
            .unwrap();
        let handle = h.manager.spawn(job_id).unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        let cancelled = h.manager.cancel(job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let started = Instant::now();
        let job = handle.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.counters.processed < 20);

        let processed_at_cancel = job.counters.processed;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.manager.status(job_id).unwrap().counters.processed, processed_at_cancel);
        assert!(h.direct.calls().len() < 20);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.status, JobStatus::Cancelled);
        assert!(h.manager.cancel(job_id).await.is_err());

        let stored = h.store.snapshot();
        assert_eq!(stored[&job_key(&job_id)]["status"], "cancelled");
        assert!(stored[&job_key(&job_id)]["completed_at"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_before_start_finalizes_job() {
        let h = harness(MockStrategy::new()).await;
        let job_id = h
            .manager
            .submit(CreateJobRequest::new(items(3)).with_callback_url("https://hooks.example/levy"))
            .await
            .unwrap();

        let job = h.manager.cancel(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(h.store.snapshot()[&job_key(&job_id)]["status"], "cancelled");
        assert_eq!(h.notifier.sent().len(), 1);

        let again = h.manager.run(job_id).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
        assert!(h.direct.calls().is_empty());
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_job() {
        let h = harness(MockStrategy::new()).await;
        let job_id = h.manager.submit(CreateJobRequest::new(items(3))).await.unwrap();

        h.store.set_fail_writes(true);
        let job = h.manager.run(job_id).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("persist"));
        assert_eq!(job.counters.successful, 3);
    }

    #[tokio::test]
    async fn test_retrying_state_is_exposed() {
        let direct = MockStrategy::new()
            .fail_item_times("p-1", 2, || AppError::NetworkError("reset".into()));
        let h = harness_with(
            direct,
            RetryConfig::default().with_delays(Duration::from_millis(60), Duration::from_millis(60)),
        )
        .await;

        let job_id = h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        let handle = h.manager.spawn(job_id).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let during = h.manager.status(job_id).unwrap();
        assert_eq!(during.status, JobStatus::Retrying);
        assert_eq!(during.retrying, 1);

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.successful, 1);
        assert_eq!(h.manager.outcomes(job_id).unwrap()[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_second_run_while_retrying_is_rejected() {
        let direct = MockStrategy::new()
            .fail_item_times("p-1", 2, || AppError::NetworkError("reset".into()));
        let h = harness_with(
            direct,
            RetryConfig::default().with_delays(Duration::from_millis(60), Duration::from_millis(60)),
        )
        .await;

        let job_id = h.manager.submit(CreateJobRequest::new(items(2))).await.unwrap();
        let handle = h.manager.spawn(job_id).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.manager.status(job_id).unwrap().status, JobStatus::Retrying);

        let err = h.manager.run(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: JobStatus::Retrying,
                to: JobStatus::Running,
                ..
            }
        ));

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let calls = h.direct.calls();
        assert_eq!(calls.iter().filter(|id| id.as_str() == "p-2").count(), 1);
        assert_eq!(calls.iter().filter(|id| id.as_str() == "p-1").count(), 3);
    }

    #[tokio::test]
    async fn test_error_summary_counts_kinds() {
        let direct = MockStrategy::new()
            .fail_item("p-1", || AppError::AuthenticationError("denied".into()))
            .fail_item("p-2", || AppError::AuthenticationError("denied".into()))
            .fail_item("p-3", || AppError::UnsupportedJurisdiction("Nowhere".into()));
        let h = harness(direct).await;

        let job_id = h.manager.submit(CreateJobRequest::new(items(6))).await.unwrap();
        let empty = h.manager.error_summary(job_id).unwrap();
        assert_eq!(empty.total_errors, 0);
        assert_eq!(empty.failure_rate, 0.0);

        h.manager.run(job_id).await.unwrap();
        let summary = h.manager.error_summary(job_id).unwrap();
        assert_eq!(summary.total_errors, 3);
        assert_eq!(summary.by_kind["authentication"], 2);
        assert_eq!(summary.by_kind[ErrorKind::Unsupported.as_str()], 1);
        assert_eq!(summary.failure_rate, 50.0);
        assert_eq!(summary.last_minute, 3);
        assert_eq!(summary.last_hour, 3);
        assert_eq!(summary.recent.len(), 3);
    }

    #[tokio::test]
    async fn test_recent_errors_keep_last_ten() {
        let mut direct = MockStrategy::new();
        for i in 1..=15 {
            direct = direct.fail_item(&format!("p-{i}"), || AppError::AuthenticationError("denied".into()));
        }
        let h = harness(direct).await;

        let job_id = h.manager.submit(CreateJobRequest::new(items(15)).with_max_workers(1)).await.unwrap();
        h.manager.run(job_id).await.unwrap();

        let errors = h.manager.recent_errors(job_id).unwrap();
        assert_eq!(errors.len(), 10);
        assert_eq!(errors[0].item_id, "p-6");
        assert_eq!(errors[9].item_id, "p-15");
    }

    #[tokio::test]
    async fn test_unknown_job_and_illegal_transitions() {
        let h = harness(MockStrategy::new()).await;
        assert!(matches!(h.manager.status(Uuid::new_v4()), Err(AppError::JobNotFound(_))));

        let job_id = h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        h.manager.run(job_id).await.unwrap();

        let err = h.manager.run(job_id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let h = harness(MockStrategy::new()).await;
        let first = h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        for _ in 0..3 {
            h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        }
        h.manager.run(first).await.unwrap();

        let all = h.manager.list(&JobFilter::default(), Page::default());
        assert_eq!(all.len(), 4);

        let done = h
            .manager
            .list(&JobFilter::default().with_status(JobStatus::Completed), Page::default());
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, first);

        let page = h.manager.list(&JobFilter::default(), Page { offset: 1, limit: 2 });
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_removes_finished_jobs() {
        let h = harness(MockStrategy::new()).await;
        let done = h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        let waiting = h.manager.submit(CreateJobRequest::new(items(1))).await.unwrap();
        h.manager.run(done).await.unwrap();

        assert_eq!(h.manager.prune(Duration::from_secs(3600)), 0);
        assert_eq!(h.manager.prune(Duration::ZERO), 1);
        assert!(h.manager.status(done).is_err());
        assert!(h.manager.status(waiting).is_ok());
    }

    #[tokio::test]
    async fn test_reporter_sees_lifecycle() {
        let h = harness(MockStrategy::new()).await;
        let job_id = h.manager.submit(CreateJobRequest::new(items(2))).await.unwrap();
        h.manager.run(job_id).await.unwrap();

        assert_eq!(
            h.reporter.events(),
            vec!["submitted", "started", "item_finished", "item_finished", "persisted", "finished"]
        );
    }

    #[tokio::test]
    async fn test_submit_and_spawn_runs_in_background() {
        let h = harness(MockStrategy::new()).await;
        let job_id = h.manager.submit_and_spawn(CreateJobRequest::new(items(3))).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !h.manager.status(job_id).unwrap().status.is_terminal() {
            assert!(Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.manager.status(job_id).unwrap().status, JobStatus::Completed);
    }
}
