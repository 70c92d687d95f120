//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::error::AppError;
use crate::manager::{JobEvent, JobReporter};
use crate::models::{ExtractedFields, WorkItem};
use crate::notify::JobNotification;
use crate::traits::{
    BlockingStrategy, BrowserDriver, DriverFactory, ExtractionStrategy, FieldParser, Fetcher,
    Notifier,
};

fn bill(amount: f64) -> ExtractedFields {
    ExtractedFields {
        amount_due: Some(amount),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns a configurable response.
#[derive(Clone)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a default HTML string.
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
        }
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, AppError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("<html><body>default</body></html>".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Parser that reports a fixed amount due and records what it was given.
#[derive(Clone)]
pub struct MockParser {
    amount: f64,
    seen: Arc<Mutex<Vec<String>>>,
}

impl MockParser {
    pub fn amount(amount: f64) -> Self {
        Self {
            amount,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl FieldParser for MockParser {
    fn parse(&self, content: &str, _item: &WorkItem) -> Result<ExtractedFields, AppError> {
        self.seen.lock().unwrap().push(content.to_string());
        Ok(bill(self.amount))
    }
}

// ---------------------------------------------------------------------------
// MockDriverFactory / MockDriver
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DriverLog {
    navigations: Vec<String>,
    fills: Vec<(String, String)>,
    clicks: Vec<String>,
    quits: usize,
}

/// Launches scripted browser sessions that serve one fixed page.
#[derive(Clone)]
pub struct MockDriverFactory {
    html: String,
    texts: HashMap<String, String>,
    launch_error: Arc<Mutex<Option<AppError>>>,
    log: Arc<Mutex<DriverLog>>,
}

impl MockDriverFactory {
    pub fn new(html: &str) -> Self {
        Self {
            html: html.to_string(),
            texts: HashMap::new(),
            launch_error: Arc::new(Mutex::new(None)),
            log: Arc::new(Mutex::new(DriverLog::default())),
        }
    }

    /// A factory whose first launch fails with `error`.
    pub fn failing(error: AppError) -> Self {
        let factory = Self::new("");
        *factory.launch_error.lock().unwrap() = Some(error);
        factory
    }

    /// Make `find_text(selector)` return `text`.
    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn navigations(&self) -> Vec<String> {
        self.log.lock().unwrap().navigations.clone()
    }

    pub fn quits(&self) -> usize {
        self.log.lock().unwrap().quits
    }

    /// `(selector, value)` pairs typed into the page, in order.
    pub fn fills(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().fills.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.log.lock().unwrap().clicks.clone()
    }
}

impl DriverFactory for MockDriverFactory {
    type Driver = MockDriver;

    fn launch(&self) -> Result<MockDriver, AppError> {
        if let Some(error) = self.launch_error.lock().unwrap().take() {
            return Err(error);
        }
        Ok(MockDriver {
            html: self.html.clone(),
            texts: self.texts.clone(),
            log: Arc::clone(&self.log),
        })
    }
}

pub struct MockDriver {
    html: String,
    texts: HashMap<String, String>,
    log: Arc<Mutex<DriverLog>>,
}

impl BrowserDriver for MockDriver {
    fn navigate(&mut self, url: &str) -> Result<(), AppError> {
        self.log.lock().unwrap().navigations.push(url.to_string());
        Ok(())
    }

    fn find_text(&mut self, selector: &str) -> Result<Option<String>, AppError> {
        Ok(self.texts.get(selector).cloned())
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<(), AppError> {
        self.log
            .lock()
            .unwrap()
            .fills
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    fn click(&mut self, selector: &str) -> Result<(), AppError> {
        self.log.lock().unwrap().clicks.push(selector.to_string());
        Ok(())
    }

    fn page_source(&mut self) -> Result<String, AppError> {
        Ok(self.html.clone())
    }

    fn quit(self) -> Result<(), AppError> {
        self.log.lock().unwrap().quits += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockStrategy
// ---------------------------------------------------------------------------

struct Failure {
    /// Calls left to fail; `None` fails forever.
    remaining: Option<u32>,
    error: fn() -> AppError,
}

/// Async strategy that succeeds unless told to fail for an item.
#[derive(Clone)]
pub struct MockStrategy {
    failures: Arc<Mutex<HashMap<String, Failure>>>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockStrategy {
    pub fn new() -> Self {
        Self {
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call for `item_id` fails with `error()`.
    pub fn fail_item(self, item_id: &str, error: fn() -> AppError) -> Self {
        self.failures.lock().unwrap().insert(
            item_id.to_string(),
            Failure {
                remaining: None,
                error,
            },
        );
        self
    }

    /// The first `times` calls for `item_id` fail, later calls succeed.
    pub fn fail_item_times(self, item_id: &str, times: u32, error: fn() -> AppError) -> Self {
        self.failures.lock().unwrap().insert(
            item_id.to_string(),
            Failure {
                remaining: Some(times),
                error,
            },
        );
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of concurrent `extract` calls seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ExtractionStrategy for MockStrategy {
    async fn extract(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        self.calls.lock().unwrap().push(item.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&item.id) {
            Some(Failure {
                remaining: None,
                error,
            }) => Err(error()),
            Some(Failure {
                remaining: Some(n),
                error,
            }) if *n > 0 => {
                *n -= 1;
                Err(error())
            }
            _ => Ok(bill(100.0)),
        }
    }
}

// ---------------------------------------------------------------------------
// MockBlockingStrategy
// ---------------------------------------------------------------------------

/// Blocking strategy that records which thread ran each call.
#[derive(Clone)]
pub struct MockBlockingStrategy {
    creator: ThreadId,
    panic_on: Option<String>,
    calls: Arc<Mutex<Vec<(String, ThreadId)>>>,
}

impl MockBlockingStrategy {
    pub fn new() -> Self {
        Self {
            creator: thread::current().id(),
            panic_on: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn panic_on(mut self, item_id: &str) -> Self {
        self.panic_on = Some(item_id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True if no call ran on the thread that built this mock.
    pub fn ran_off_runtime(&self) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .all(|(_, thread)| *thread != self.creator)
    }
}

impl BlockingStrategy for MockBlockingStrategy {
    fn extract_blocking(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((item.id.clone(), thread::current().id()));
        if self.panic_on.as_deref() == Some(item.id.as_str()) {
            panic!("browser crashed on {}", item.id);
        }
        Ok(bill(250.0))
    }
}

// ---------------------------------------------------------------------------
// MockNotifier
// ---------------------------------------------------------------------------

/// Notifier that records every delivery.
#[derive(Clone)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<(String, JobNotification)>>>,
    fail: bool,
    delay: Duration,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<(String, JobNotification)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for MockNotifier {
    async fn notify(&self, target: &str, notification: &JobNotification) -> Result<(), AppError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AppError::NetworkError("callback refused".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), notification.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names in order.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let name = match event {
            JobEvent::Submitted { .. } => "submitted",
            JobEvent::Started { .. } => "started",
            JobEvent::ItemFinished { .. } => "item_finished",
            JobEvent::CancelRequested { .. } => "cancel_requested",
            JobEvent::Persisted { .. } => "persisted",
            JobEvent::Finished { .. } => "finished",
        };
        self.events.lock().unwrap().push(name);
    }
}
