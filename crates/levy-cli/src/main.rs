use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use levy_client::{HttpStrategy, PatternParser, ReqwestFetcher, WebhookNotifier};
use levy_core::config::EngineConfig;
use levy_core::dispatcher::{RoutingTable, WorkDispatcher};
use levy_core::job::{CreateJobRequest, Job};
use levy_core::manager::JobManager;
use levy_core::memory::MemoryConnectionManager;
use levy_core::models::WorkItem;
use levy_core::notify::NotificationDispatcher;
use levy_core::pool::Pool;
use levy_core::resilience::ResilienceController;
use levy_core::strategy::DirectFetchStrategy;
use levy_core::traits::{ConnectionManager, RecordStore};
use levy_core::{BlockingPool, StrategyFamily};
use levy_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "levy", version, about = "Concurrent property tax bill extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every bill listed in a CSV file as one job
    Run {
        /// CSV with columns: id, jurisdiction, url[, account]
        #[arg(short, long)]
        input: PathBuf,

        /// Concurrent items for this job (defaults to LEVY_MAX_WORKERS or 4)
        #[arg(short, long)]
        max_workers: Option<usize>,

        /// URL notified with the job summary when it finishes
        #[arg(long, env = "LEVY_CALLBACK_URL")]
        callback_url: Option<String>,

        /// Keep results in memory instead of Postgres (no DATABASE_URL needed)
        #[arg(long, default_value_t = false)]
        in_memory: bool,

        /// Allow bill and callback URLs on private networks
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Show a persisted job and its outcomes
    Show {
        /// Job id printed by `levy run`
        job_id: Uuid,

        /// Include per-item outcomes
        #[arg(long, default_value_t = false)]
        outcomes: bool,
    },

    /// Print the strategy family a jurisdiction routes to
    Route {
        jurisdiction: String,
    },

    /// List the routing table
    Jurisdictions,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("levy=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            max_workers,
            callback_url,
            in_memory,
            allow_private_urls,
        } => {
            let mut config = EngineConfig::from_env().context("Invalid LEVY_* configuration")?;
            if let Some(n) = max_workers {
                config.max_workers = n;
            }
            let items = load_items(&input)?;
            let options = RunOptions {
                callback_url,
                allow_private_urls,
            };

            let summary = if in_memory {
                let pool = Pool::open(MemoryConnectionManager::new(), config.pool.clone()).await?;
                cmd_run(pool, &config, items, options).await?
            } else {
                let db = connect_db().await?;
                let pool = db.record_pool(config.pool.clone()).await?;
                cmd_run(pool, &config, items, options).await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Show { job_id, outcomes } => {
            let db = connect_db().await?;
            cmd_show(&db, job_id, outcomes).await?;
        }
        Commands::Route { jurisdiction } => {
            let table = RoutingTable::portfolio();
            match table.matching(&jurisdiction) {
                Some(route) => println!("{} (matched '{}')", route.family, route.pattern),
                None => println!("{}", StrategyFamily::Unsupported),
            }
        }
        Commands::Jurisdictions => {
            for route in RoutingTable::portfolio().routes() {
                println!("{:<16} {}", route.pattern, route.family);
            }
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

#[derive(Debug, Deserialize)]
struct ItemRow {
    id: String,
    jurisdiction: String,
    url: String,
    #[serde(default)]
    account: Option<String>,
}

/// Read work items from a CSV file with a header row.
fn load_items(path: &Path) -> Result<Vec<WorkItem>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut items = Vec::new();
    for (line, row) in reader.deserialize::<ItemRow>().enumerate() {
        let row = row.with_context(|| format!("Bad row {} in {}", line + 2, path.display()))?;
        let mut item = WorkItem::new(row.id, row.jurisdiction, row.url);
        if let Some(account) = row.account.filter(|a| !a.is_empty()) {
            item = item.with_account(account);
        }
        items.push(item);
    }
    Ok(items)
}

struct RunOptions {
    callback_url: Option<String>,
    allow_private_urls: bool,
}

#[derive(serde::Serialize)]
struct RunSummary {
    job: Job,
    outcomes: Vec<levy_core::ExtractionOutcome>,
    errors: levy_core::manager::ErrorSummary,
}

async fn cmd_run<M>(
    pool: Pool<M>,
    config: &EngineConfig,
    items: Vec<WorkItem>,
    options: RunOptions,
) -> Result<RunSummary>
where
    M: ConnectionManager,
    M::Connection: RecordStore,
{
    let mut fetcher = ReqwestFetcher::with_timeout(config.resilience.attempt_timeout)?;
    let mut notifier = WebhookNotifier::with_timeout(config.notify.timeout)?;
    if options.allow_private_urls {
        fetcher = fetcher.allow_private_urls();
        notifier = notifier.allow_private_urls();
    }
    let parser = PatternParser::new()?;
    let direct: HttpStrategy = DirectFetchStrategy::new(fetcher, parser.clone());

    let dispatcher = WorkDispatcher::new(
        RoutingTable::portfolio(),
        direct,
        browser_strategy(parser).await?,
        ResilienceController::new(config.resilience.clone())?,
        BlockingPool::new(config.blocking_threads)?,
    );
    let manager = JobManager::new(
        pool.clone(),
        dispatcher,
        NotificationDispatcher::new(notifier, config.notify.clone()),
        config.manager.clone(),
    );

    let mut request = CreateJobRequest::new(items).with_max_workers(config.max_workers);
    if let Some(url) = options.callback_url {
        request = request.with_callback_url(url);
    }
    let job_id = manager.submit(request).await?;
    eprintln!("Job {job_id} submitted");

    let mut handle = manager.spawn(job_id)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let job = loop {
        tokio::select! {
            joined = &mut handle => break joined.context("Job task failed")??,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling job {job_id}...");
                if let Err(e) = manager.cancel(job_id).await {
                    tracing::warn!(%job_id, error = %e, "Cancel ignored");
                }
            }
            _ = ticker.tick() => {
                let job = manager.status(job_id)?;
                eprintln!(
                    "[{}] {}/{} processed ({} ok, {} failed) {:.0}%",
                    job.status,
                    job.counters.processed,
                    job.counters.total,
                    job.counters.successful,
                    job.counters.failed,
                    job.progress()
                );
            }
        }
    };

    let summary = RunSummary {
        outcomes: manager.outcomes(job_id)?,
        errors: manager.error_summary(job_id)?,
        job,
    };
    tracing::info!(stats = ?pool.stats(), "Store pool");
    pool.close();
    Ok(summary)
}

async fn cmd_show(db: &Database, job_id: Uuid, with_outcomes: bool) -> Result<()> {
    let Some(job) = db.job(job_id).await? else {
        println!("No job found with id {job_id}");
        return Ok(());
    };

    println!(
        "Job {} [{}] created {}",
        job.id,
        job.status,
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  {}/{} processed: {} successful, {} failed",
        job.counters.processed, job.counters.total, job.counters.successful, job.counters.failed
    );
    if let Some(error) = &job.error {
        println!("  error: {error}");
    }

    if with_outcomes {
        for outcome in db.outcomes(job_id).await? {
            let detail = match (&outcome.fields.amount_due, &outcome.error) {
                (Some(amount), _) => format!("${amount:.2}"),
                (None, Some(error)) => error.clone(),
                (None, None) => "-".into(),
            };
            let mark = if outcome.success { "ok" } else { "FAILED" };
            println!("  [{mark}] {} via {}: {detail}", outcome.item_id, outcome.strategy);
        }
    }
    Ok(())
}

#[cfg(feature = "browser")]
type BrowserStrategy = levy_core::strategy::BrowserAutomationStrategy<
    levy_client::ChromiumDriverFactory,
    levy_core::strategy::RenderedPageScript<PatternParser>,
>;

#[cfg(feature = "browser")]
async fn browser_strategy(parser: PatternParser) -> Result<BrowserStrategy> {
    let factory = levy_client::ChromiumDriverFactory::launch_browser()
        .await
        .context("Failed to launch headless browser")?;
    Ok(levy_core::strategy::BrowserAutomationStrategy::new(
        factory,
        levy_core::strategy::RenderedPageScript::new(parser).with_ready_selector("body"),
    ))
}

/// Stand-in when the binary is built without browser support.
#[cfg(not(feature = "browser"))]
struct BrowserStrategy;

#[cfg(not(feature = "browser"))]
impl levy_core::traits::BlockingStrategy for BrowserStrategy {
    fn extract_blocking(
        &self,
        item: &WorkItem,
    ) -> Result<levy_core::ExtractedFields, levy_core::AppError> {
        Err(levy_core::AppError::UnsupportedJurisdiction(format!(
            "{} needs a browser; rebuild with --features browser",
            item.jurisdiction
        )))
    }
}

#[cfg(not(feature = "browser"))]
async fn browser_strategy(_parser: PatternParser) -> Result<BrowserStrategy> {
    Ok(BrowserStrategy)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn csv_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_items_reads_rows() {
        let file = csv_file(
            "id,jurisdiction,url,account\n\
             p-1, Harris County ,https://www.hctax.net/bill/1,0401\n\
             p-2,Montgomery County,https://mctotx.org/2,\n",
        );

        let items = load_items(file.path()).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].jurisdiction, "Harris County");
        assert_eq!(items[0].account.as_deref(), Some("0401"));
        assert_eq!(items[1].account, None);
    }

    #[test]
    fn test_load_items_without_account_column() {
        let file = csv_file("id,jurisdiction,url\np-1,Galveston,https://galvestontax.org\n");
        let items = load_items(file.path()).unwrap();
        assert_eq!(items[0].id, "p-1");
        assert_eq!(items[0].account, None);
    }

    #[test]
    fn test_load_items_reports_bad_rows() {
        let file = csv_file("id,jurisdiction\np-1,Galveston\n");
        let err = load_items(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Bad row 2"));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "levy",
            "run",
            "--input",
            "items.csv",
            "--max-workers",
            "8",
            "--in-memory",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                input,
                max_workers,
                in_memory,
                ..
            } => {
                assert_eq!(input, PathBuf::from("items.csv"));
                assert_eq!(max_workers, Some(8));
                assert!(in_memory);
            }
            _ => panic!("expected run"),
        }
    }
}
