pub mod blocking;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod manager;
pub mod memory;
pub mod models;
pub mod notify;
pub mod pool;
pub mod resilience;
pub mod strategy;
pub mod traits;
pub mod util;

#[cfg(test)]
pub mod testutil;

pub use blocking::BlockingPool;
pub use config::EngineConfig;
pub use dispatcher::{RoutingTable, WorkDispatcher};
pub use error::{AppError, ErrorKind};
pub use job::{CreateJobRequest, Job, JobFilter, JobStatus, Page};
pub use manager::{JobManager, JobReporter, ManagerConfig, TracingJobReporter};
pub use models::{ExtractedFields, ExtractionOutcome, StrategyFamily, WorkItem, compute_hash};
pub use notify::{JobNotification, NotificationDispatcher, NotifyConfig};
pub use pool::{Pool, PoolConfig, PoolGuard, PoolStats};
pub use resilience::{ResilienceConfig, ResilienceController};
pub use traits::{
    BlockingStrategy, BrowserDriver, ConnectionManager, DriverFactory, ExtractionStrategy,
    FieldParser, Fetcher, Notifier, PageScript, RecordStore,
};
