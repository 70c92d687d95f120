/// Smoke-test for `ChromiumDriverFactory`.
///
/// Launches headless Chromium, opens <https://example.com> in a tab from a
/// blocking thread, and checks the rendered heading.
///
/// Run with:
///   cargo run -p levy-client --example browser_smoke --features browser
use levy_client::ChromiumDriverFactory;
use levy_core::traits::{BrowserDriver, DriverFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser...");
    let factory = ChromiumDriverFactory::launch_browser().await?;

    let heading = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
        let mut driver = factory.launch()?;
        driver.navigate("https://example.com")?;
        let heading = driver.find_text("h1")?;
        let html = driver.page_source()?;
        println!("Got {} bytes of rendered HTML", html.len());
        driver.quit()?;
        Ok(heading)
    })
    .await??;

    anyhow::ensure!(
        heading.as_deref() == Some("Example Domain"),
        "unexpected heading: {heading:?}"
    );
    println!("OK: heading is {heading:?}");
    Ok(())
}
