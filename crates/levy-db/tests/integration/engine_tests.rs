use std::time::Duration;

use levy_core::blocking::BlockingPool;
use levy_core::dispatcher::{RoutingTable, WorkDispatcher};
use levy_core::error::AppError;
use levy_core::job::{CreateJobRequest, JobStatus};
use levy_core::manager::{JobManager, ManagerConfig};
use levy_core::models::{ExtractedFields, WorkItem};
use levy_core::notify::{NotificationDispatcher, NotifyConfig};
use levy_core::pool::PoolConfig;
use levy_core::resilience::{RateLimitConfig, ResilienceConfig, ResilienceController};
use levy_core::traits::{BlockingStrategy, ExtractionStrategy, NullNotifier};

use crate::common::setup_test_db;

/// Fails items whose id ends in "-bad", otherwise reports a fixed amount.
#[derive(Clone)]
struct FixedBill;

impl ExtractionStrategy for FixedBill {
    async fn extract(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        if item.id.ends_with("-bad") {
            return Err(AppError::AuthenticationError("login required".into()));
        }
        Ok(ExtractedFields {
            amount_due: Some(1250.0),
            ..Default::default()
        })
    }
}

impl BlockingStrategy for FixedBill {
    fn extract_blocking(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        Err(AppError::UnsupportedJurisdiction(item.jurisdiction.clone()))
    }
}

#[tokio::test]
async fn job_results_are_persisted_to_postgres() {
    let (db, _config, _container) = setup_test_db().await;
    let pool = db.record_pool(PoolConfig::default().with_sizes(1, 2, 0)).await.unwrap();

    let controller = ResilienceController::new(
        ResilienceConfig::default().with_rate_limit(RateLimitConfig::new(1000.0)),
    )
    .unwrap();
    let dispatcher = WorkDispatcher::new(
        RoutingTable::portfolio(),
        FixedBill,
        FixedBill,
        controller,
        BlockingPool::new(1).unwrap(),
    );
    let manager = JobManager::new(
        pool,
        dispatcher,
        NotificationDispatcher::new(NullNotifier, NotifyConfig::default()),
        ManagerConfig::default(),
    );

    let items = vec![
        WorkItem::new("p-1", "Galveston County", "https://galvestontax.org/1"),
        WorkItem::new("p-2-bad", "Chambers County", "https://chamberstax.net/2"),
        WorkItem::new("p-3", "Aldine ISD", "https://aldine.example/3"),
    ];
    let job_id = manager
        .submit(CreateJobRequest::new(items).with_max_workers(2))
        .await
        .unwrap();
    let job = tokio::time::timeout(Duration::from_secs(30), manager.run(job_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.successful, 2);
    assert_eq!(job.counters.failed, 1);

    let stored = db.job(job_id).await.unwrap().expect("job record");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.counters.processed, 3);

    let outcomes = db.outcomes(job_id).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().any(|o| o.item_id == "p-2-bad" && !o.success));
}
