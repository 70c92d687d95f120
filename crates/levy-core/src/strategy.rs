//! Built-in extraction strategies.
//!
//! [`DirectFetchStrategy`] fetches a page and parses it on the async
//! scheduler. [`BrowserAutomationStrategy`] drives a blocking browser session
//! and must only run inside the blocking pool.

use crate::error::AppError;
use crate::models::{ExtractedFields, WorkItem};
use crate::traits::{
    BlockingStrategy, BrowserDriver, DriverFactory, ExtractionStrategy, FieldParser, Fetcher,
    PageScript,
};

/// Plain request plus parse.
#[derive(Clone)]
pub struct DirectFetchStrategy<F, P>
where
    F: Fetcher,
    P: FieldParser,
{
    fetcher: F,
    parser: P,
}

impl<F: Fetcher, P: FieldParser> DirectFetchStrategy<F, P> {
    pub fn new(fetcher: F, parser: P) -> Self {
        Self { fetcher, parser }
    }
}

impl<F: Fetcher, P: FieldParser> ExtractionStrategy for DirectFetchStrategy<F, P> {
    async fn extract(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        tracing::debug!(item_id = %item.id, url = %item.url, "Fetching tax bill page");
        let content = self.fetcher.fetch(&item.url).await?;
        self.parser.parse(&content, item)
    }
}

/// One browser session per call: launch, run the page script, quit.
pub struct BrowserAutomationStrategy<DF, S>
where
    DF: DriverFactory,
    S: PageScript,
{
    factory: DF,
    script: S,
}

impl<DF: DriverFactory, S: PageScript> BrowserAutomationStrategy<DF, S> {
    pub fn new(factory: DF, script: S) -> Self {
        Self { factory, script }
    }
}

impl<DF: DriverFactory, S: PageScript> BlockingStrategy for BrowserAutomationStrategy<DF, S> {
    fn extract_blocking(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        let mut driver = self.factory.launch()?;
        let result = self.script.run(&mut driver, item);
        if let Err(e) = driver.quit() {
            tracing::warn!(item_id = %item.id, error = %e, "Browser session did not shut down cleanly");
        }
        result
    }
}

/// Generic page script: open the bill URL and read the fields from the
/// rendered page with a parser.
#[derive(Clone)]
pub struct RenderedPageScript<P: FieldParser> {
    parser: P,
    /// Element that must be present before the page counts as loaded.
    ready_selector: Option<String>,
}

impl<P: FieldParser> RenderedPageScript<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            ready_selector: None,
        }
    }

    pub fn with_ready_selector(mut self, selector: impl Into<String>) -> Self {
        self.ready_selector = Some(selector.into());
        self
    }
}

impl<P: FieldParser + 'static> PageScript for RenderedPageScript<P> {
    fn run<D: BrowserDriver>(
        &self,
        driver: &mut D,
        item: &WorkItem,
    ) -> Result<ExtractedFields, AppError> {
        driver.navigate(&item.url)?;
        if let Some(selector) = &self.ready_selector
            && driver.find_text(selector)?.is_none()
        {
            return Err(AppError::ParseError(format!(
                "page never rendered '{selector}'"
            )));
        }
        let html = driver.page_source()?;
        self.parser.parse(&html, item)
    }
}

/// Form-driven page script for portals that look bills up by account
/// number: open the search page, type the item's account, submit, then
/// read the fields from the result page.
#[derive(Clone)]
pub struct AccountSearchScript<P: FieldParser> {
    parser: P,
    account_input: String,
    submit_button: String,
    /// Element present only once the search has found a bill.
    result_selector: Option<String>,
}

impl<P: FieldParser> AccountSearchScript<P> {
    pub fn new(parser: P, account_input: impl Into<String>, submit_button: impl Into<String>) -> Self {
        Self {
            parser,
            account_input: account_input.into(),
            submit_button: submit_button.into(),
            result_selector: None,
        }
    }

    pub fn with_result_selector(mut self, selector: impl Into<String>) -> Self {
        self.result_selector = Some(selector.into());
        self
    }
}

impl<P: FieldParser + 'static> PageScript for AccountSearchScript<P> {
    fn run<D: BrowserDriver>(
        &self,
        driver: &mut D,
        item: &WorkItem,
    ) -> Result<ExtractedFields, AppError> {
        let account = item.account.as_deref().filter(|a| !a.trim().is_empty()).ok_or_else(|| {
            AppError::ValidationError(format!("item {} has no account number to search", item.id))
        })?;

        driver.navigate(&item.url)?;
        driver.fill(&self.account_input, account.trim())?;
        driver.click(&self.submit_button)?;

        if let Some(selector) = &self.result_selector
            && driver.find_text(selector)?.is_none()
        {
            return Err(AppError::ParseError(format!(
                "no search result for account {account}"
            )));
        }
        let html = driver.page_source()?;
        self.parser.parse(&html, item)
    }
}
