//! Routes work items to a strategy family and runs them through the
//! resilience controller in the right execution context.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::blocking::BlockingPool;
use crate::error::AppError;
use crate::models::{ExtractionOutcome, StrategyFamily, WorkItem};
use crate::resilience::{NoopObserver, ResilienceController, RetryObserver, endpoint_key};
use crate::traits::{BlockingStrategy, ExtractionStrategy};

/// One routing rule: jurisdictions containing `pattern` use `family`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: String,
    pub family: StrategyFamily,
}

/// Ordered jurisdiction-substring routing, validated at construction.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

const DIRECT_FETCH_JURISDICTIONS: &[&str] = &[
    "montgomery",
    "fort bend",
    "chambers",
    "galveston",
    "aldine",
    "goose creek",
    "spring creek",
    "barbers hill",
];

const BROWSER_JURISDICTIONS: &[&str] = &[
    "maricopa", "harris", "dallas", "tarrant", "wayne", "johnston", "craven", "wilson",
];

impl RoutingTable {
    /// Build a table. Patterns are matched case-insensitively, first match
    /// wins. Rejects empty, duplicate and shadowed patterns.
    pub fn new<I, S>(routes: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (S, StrategyFamily)>,
        S: Into<String>,
    {
        let mut table: Vec<Route> = Vec::new();
        let mut seen = HashSet::new();

        for (pattern, family) in routes {
            let pattern = pattern.into().trim().to_lowercase();
            if pattern.is_empty() {
                return Err(AppError::ConfigError("routing pattern is empty".into()));
            }
            if !seen.insert(pattern.clone()) {
                return Err(AppError::ConfigError(format!(
                    "duplicate routing pattern '{pattern}'"
                )));
            }
            if let Some(earlier) = table.iter().find(|r| pattern.contains(&r.pattern)) {
                return Err(AppError::ConfigError(format!(
                    "routing pattern '{pattern}' is shadowed by earlier pattern '{}'",
                    earlier.pattern
                )));
            }
            table.push(Route { pattern, family });
        }

        Ok(Self { routes: table })
    }

    /// The portfolio's known jurisdictions.
    pub fn portfolio() -> Self {
        let routes = DIRECT_FETCH_JURISDICTIONS
            .iter()
            .map(|p| (*p, StrategyFamily::DirectFetch))
            .chain(
                BROWSER_JURISDICTIONS
                    .iter()
                    .map(|p| (*p, StrategyFamily::BrowserAutomation)),
            )
            .map(|(pattern, family)| Route {
                pattern: pattern.to_string(),
                family,
            })
            .collect();
        Self { routes }
    }

    pub fn route(&self, jurisdiction: &str) -> StrategyFamily {
        self.matching(jurisdiction)
            .map_or(StrategyFamily::Unsupported, |r| r.family)
    }

    /// The rule that decides `jurisdiction`, if any.
    pub fn matching(&self, jurisdiction: &str) -> Option<&Route> {
        let needle = jurisdiction.to_lowercase();
        self.routes.iter().find(|r| needle.contains(&r.pattern))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::portfolio()
    }
}

/// The strategy selected for a jurisdiction.
pub enum StrategyHandle<'a, D, B> {
    DirectFetch(&'a D),
    BrowserAutomation(&'a Arc<B>),
    Unsupported,
}

impl<D, B> StrategyHandle<'_, D, B> {
    pub fn family(&self) -> StrategyFamily {
        match self {
            StrategyHandle::DirectFetch(_) => StrategyFamily::DirectFetch,
            StrategyHandle::BrowserAutomation(_) => StrategyFamily::BrowserAutomation,
            StrategyHandle::Unsupported => StrategyFamily::Unsupported,
        }
    }
}

/// Selects a strategy per work item and runs it resiliently.
pub struct WorkDispatcher<D, B>
where
    D: ExtractionStrategy,
    B: BlockingStrategy,
{
    table: RoutingTable,
    direct: D,
    browser: Arc<B>,
    controller: ResilienceController,
    blocking: BlockingPool,
}

impl<D, B> Clone for WorkDispatcher<D, B>
where
    D: ExtractionStrategy,
    B: BlockingStrategy,
{
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            direct: self.direct.clone(),
            browser: Arc::clone(&self.browser),
            controller: self.controller.clone(),
            blocking: self.blocking.clone(),
        }
    }
}

impl<D, B> WorkDispatcher<D, B>
where
    D: ExtractionStrategy,
    B: BlockingStrategy,
{
    pub fn new(
        table: RoutingTable,
        direct: D,
        browser: B,
        controller: ResilienceController,
        blocking: BlockingPool,
    ) -> Self {
        Self {
            table,
            direct,
            browser: Arc::new(browser),
            controller,
            blocking,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn controller(&self) -> &ResilienceController {
        &self.controller
    }

    pub fn route(&self, jurisdiction: &str) -> StrategyHandle<'_, D, B> {
        match self.table.route(jurisdiction) {
            StrategyFamily::DirectFetch => StrategyHandle::DirectFetch(&self.direct),
            StrategyFamily::BrowserAutomation => StrategyHandle::BrowserAutomation(&self.browser),
            StrategyFamily::Unsupported => StrategyHandle::Unsupported,
        }
    }

    /// Breaker and limiter key for `item`.
    pub fn endpoint_key(&self, item: &WorkItem) -> String {
        endpoint_key(&item.url, &item.jurisdiction)
    }

    pub async fn dispatch(&self, item: &WorkItem) -> ExtractionOutcome {
        self.dispatch_observed(item, &NoopObserver).await
    }

    /// Extract one item. Every failure comes back as a failed outcome.
    pub async fn dispatch_observed<O>(&self, item: &WorkItem, observer: &O) -> ExtractionOutcome
    where
        O: RetryObserver + ?Sized,
    {
        let start = Instant::now();
        let handle = self.route(&item.jurisdiction);
        let family = handle.family();
        let key = self.endpoint_key(item);

        let execution = match handle {
            StrategyHandle::Unsupported => {
                let err = AppError::UnsupportedJurisdiction(item.jurisdiction.clone());
                tracing::warn!(item_id = %item.id, jurisdiction = %item.jurisdiction, "No strategy for jurisdiction");
                return ExtractionOutcome::failed(&item.id, &err, family, start.elapsed(), 0);
            }
            StrategyHandle::DirectFetch(strategy) => {
                self.controller
                    .execute(&key, observer, move || strategy.extract(item))
                    .await
            }
            StrategyHandle::BrowserAutomation(strategy) => {
                self.controller
                    .execute(&key, observer, || {
                        let strategy = Arc::clone(strategy);
                        let item = item.clone();
                        let blocking = self.blocking.clone();
                        async move { blocking.run(move || strategy.extract_blocking(&item)).await }
                    })
                    .await
            }
        };

        let elapsed = start.elapsed();
        match execution.result {
            Ok(fields) => {
                tracing::debug!(
                    item_id = %item.id,
                    domain = %key,
                    strategy = %family,
                    attempts = execution.attempts,
                    "Item extracted"
                );
                ExtractionOutcome::succeeded(
                    &item.id,
                    fields.merged_over(&item.known_fields),
                    family,
                    elapsed,
                    execution.attempts,
                )
            }
            Err(e) => {
                tracing::warn!(
                    item_id = %item.id,
                    domain = %key,
                    strategy = %family,
                    attempts = execution.attempts,
                    error = %e,
                    "Item extraction failed"
                );
                ExtractionOutcome::failed(&item.id, &e, family, elapsed, execution.attempts)
            }
        }
    }
}
