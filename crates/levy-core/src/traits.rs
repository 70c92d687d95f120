use std::future::Future;

use serde_json::Value;

use crate::error::AppError;
use crate::models::{ExtractedFields, WorkItem};
use crate::notify::JobNotification;

/// Fetches raw page content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Turns fetched page content into tax bill fields.
pub trait FieldParser: Send + Sync + Clone {
    fn parse(&self, content: &str, item: &WorkItem) -> Result<ExtractedFields, AppError>;
}

/// An extraction strategy that runs on the async scheduler.
pub trait ExtractionStrategy: Send + Sync + Clone {
    fn extract(
        &self,
        item: &WorkItem,
    ) -> impl Future<Output = Result<ExtractedFields, AppError>> + Send;
}

/// An extraction strategy whose work blocks the calling thread.
///
/// Only ever invoked from the blocking pool, never on a scheduler thread.
pub trait BlockingStrategy: Send + Sync + 'static {
    fn extract_blocking(&self, item: &WorkItem) -> Result<ExtractedFields, AppError>;
}

/// A synchronous browser session.
pub trait BrowserDriver: Send {
    fn navigate(&mut self, url: &str) -> Result<(), AppError>;

    /// Text content of the first element matching `selector`, if any.
    fn find_text(&mut self, selector: &str) -> Result<Option<String>, AppError>;

    /// Types into the first element matching `selector`.
    fn fill(&mut self, selector: &str, value: &str) -> Result<(), AppError>;

    fn click(&mut self, selector: &str) -> Result<(), AppError>;

    /// Full HTML of the current page.
    fn page_source(&mut self) -> Result<String, AppError>;

    fn quit(self) -> Result<(), AppError>
    where
        Self: Sized;
}

/// Launches browser sessions.
pub trait DriverFactory: Send + Sync + 'static {
    type Driver: BrowserDriver;

    fn launch(&self) -> Result<Self::Driver, AppError>;
}

/// Navigation and element queries for one family of jurisdiction sites.
pub trait PageScript: Send + Sync + 'static {
    fn run<D: BrowserDriver>(
        &self,
        driver: &mut D,
        item: &WorkItem,
    ) -> Result<ExtractedFields, AppError>;
}

/// Creates and validates backing-store connections for the resource pool.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, AppError>> + Send;

    /// Cheap health probe run before a pooled connection is handed out.
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Key/record operations the engine needs from the backing store.
pub trait RecordStore: Send {
    fn get(&mut self, key: &str) -> impl Future<Output = Result<Option<Value>, AppError>> + Send;

    fn put(&mut self, key: &str, record: &Value)
    -> impl Future<Output = Result<(), AppError>> + Send;

    /// Insert or replace every record in one round trip. Returns rows written.
    fn upsert(
        &mut self,
        records: &[(String, Value)],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Delivers job completion notifications.
pub trait Notifier: Send + Sync + Clone {
    fn notify(
        &self,
        target: &str,
        notification: &JobNotification,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A notifier for when no callbacks should ever leave the process.
#[derive(Debug, Clone)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    async fn notify(&self, _target: &str, _notification: &JobNotification) -> Result<(), AppError> {
        Ok(())
    }
}
