use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use levy_core::error::AppError;
use levy_core::traits::{BrowserDriver, DriverFactory};
use tokio::runtime::Handle;

/// Headless Chromium sessions driven through the Chrome DevTools Protocol.
///
/// One Chromium process is shared by every session; each
/// [`DriverFactory::launch`] opens a new tab and [`BrowserDriver::quit`]
/// closes it. Drivers are synchronous: every call blocks the current thread
/// on the runtime that launched the browser, so they must only be used from
/// the blocking pool.
#[derive(Clone)]
pub struct ChromiumDriverFactory {
    browser: Arc<Browser>,
    handle: Handle,
    timeout: Duration,
}

impl ChromiumDriverFactory {
    /// Launches headless Chromium with a **30 s** per-command timeout.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`,
    /// or one of the well-known install locations.
    pub async fn launch_browser() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags, so prefer the real binary when one is found.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            handle: Handle::current(),
            timeout,
        })
    }
}

fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Run `fut` to completion on `handle`, bounded by `timeout`.
fn block_on<T, F>(handle: &Handle, timeout: Duration, what: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, chromiumoxide::error::CdpError>>,
{
    match handle.block_on(tokio::time::timeout(timeout, fut)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::NetworkError(format!("{what}: {e}"))),
        Err(_) => Err(AppError::Timeout(timeout)),
    }
}

impl DriverFactory for ChromiumDriverFactory {
    type Driver = ChromiumDriver;

    fn launch(&self) -> Result<ChromiumDriver, AppError> {
        let page = block_on(&self.handle, self.timeout, "open tab", self.browser.new_page("about:blank"))?;
        Ok(ChromiumDriver {
            page,
            handle: self.handle.clone(),
            timeout: self.timeout,
        })
    }
}

/// One browser tab.
pub struct ChromiumDriver {
    page: Page,
    handle: Handle,
    timeout: Duration,
}

impl BrowserDriver for ChromiumDriver {
    fn navigate(&mut self, url: &str) -> Result<(), AppError> {
        let page = &self.page;
        block_on(&self.handle, self.timeout, "navigate", async move {
            page.goto(url).await?.wait_for_navigation().await?;
            Ok(())
        })
    }

    fn find_text(&mut self, selector: &str) -> Result<Option<String>, AppError> {
        let page = &self.page;
        block_on(&self.handle, self.timeout, "find element", async move {
            match page.find_element(selector).await {
                Ok(element) => element.inner_text().await,
                Err(_) => Ok(None),
            }
        })
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<(), AppError> {
        let page = &self.page;
        block_on(&self.handle, self.timeout, "fill", async move {
            page.find_element(selector).await?.click().await?.type_str(value).await?;
            Ok(())
        })
    }

    fn click(&mut self, selector: &str) -> Result<(), AppError> {
        let page = &self.page;
        block_on(&self.handle, self.timeout, "click", async move {
            page.find_element(selector).await?.click().await?;
            Ok(())
        })
    }

    fn page_source(&mut self) -> Result<String, AppError> {
        block_on(&self.handle, self.timeout, "read page", self.page.content())
    }

    fn quit(self) -> Result<(), AppError> {
        block_on(&self.handle, self.timeout, "close tab", self.page.close())
    }
}
