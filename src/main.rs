//! crawl-ledger main entry point
//!
//! This is the command-line interface for the crawl-ledger crawl engine.

use anyhow::Context;
use clap::Parser;
use crawl_ledger::config::{config_fingerprint, load_config, Config};
use crawl_ledger::crawler::crawl;
use crawl_ledger::storage::RunStatus;
use crawl_ledger::LedgerError;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// crawl-ledger: a resumable, concurrent crawl-state engine
///
/// Crawls from the configured seeds, recording every URL's lifecycle in a
/// SQLite database. Interrupt at any time with Ctrl+C and run again to resume.
#[derive(Parser, Debug)]
#[command(name = "crawl-ledger")]
#[command(version)]
#[command(about = "A resumable, concurrent crawl-state engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with_all = ["stats", "normalize_db"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "normalize_db"])]
    stats: bool,

    /// Re-key stored URLs with the configured normalization, merging duplicates, and exit
    #[arg(long)]
    normalize_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    tracing::info!(
        "Configuration loaded successfully (fingerprint: {})",
        config_fingerprint(&config)?
    );

    if cli.dry_run {
        handle_dry_run(&config);
        Ok(())
    } else if cli.stats {
        handle_stats(&config)
    } else if cli.normalize_db {
        handle_normalize_db(&config)
    } else {
        handle_crawl(config).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// `RUST_LOG` overrides the verbosity flags when set.
fn setup_logging(verbose: u8, quiet: bool) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "crawl_ledger=info,warn",
            1 => "crawl_ledger=debug,info",
            2 => "crawl_ledger=trace,debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config) {
    println!("=== crawl-ledger Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Workers: {}", config.crawler.worker_count);
    println!("  Max attempts: {}", config.crawler.max_attempts);
    println!(
        "  Backoff: {}ms per attempt, capped at {}ms",
        config.crawler.base_backoff_ms, config.crawler.backoff_cap_ms
    );
    println!("  Fetch timeout: {}ms", config.crawler.per_fetch_timeout_ms);
    println!("  Retry blocked: {}", config.crawler.retry_blocked);

    println!("\nWriter:");
    println!("  Batch size: {}", config.writer.batch_size);
    println!("  Flush interval: {}ms", config.writer.flush_interval_ms);
    println!("  Channel capacity: {}", config.writer.channel_capacity);

    println!("\nScope:");
    println!(
        "  URL prefix: {}",
        config.scope.url_prefix.as_deref().unwrap_or("(any)")
    );
    println!(
        "  Allowed domain: {}",
        config.scope.allowed_domain.as_deref().unwrap_or("(any)")
    );
    println!("  Strip query: {}", config.scope.strip_query);
    println!(
        "  Content selector: {}",
        config.scope.content_selector.as_deref().unwrap_or("body")
    );

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);
    println!("  User agent: {}", config.fetcher.user_agent);

    println!("\nSeeds ({}):", config.seeds.urls.len());
    for seed in &config.seeds.urls {
        println!("  - {}", seed);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    use crawl_ledger::output::{load_statistics, print_statistics};
    use crawl_ledger::storage::SqliteStorage;
    use std::path::Path;

    println!("Database: {}\n", config.output.database_path);

    let storage = SqliteStorage::new(Path::new(&config.output.database_path))
        .context("Failed to open database")?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --normalize-db mode: merges URL rows that now share a key
fn handle_normalize_db(config: &Config) -> anyhow::Result<()> {
    use crawl_ledger::storage::SqliteStorage;
    use std::path::Path;

    let mut storage = SqliteStorage::new(Path::new(&config.output.database_path))
        .context("Failed to open database")?;
    let summary = storage
        .normalize_urls(config.scope.strip_query)
        .context("Failed to normalize stored URLs")?;

    println!("Database: {}", config.output.database_path);
    println!("  Rows before: {}", summary.rows_before);
    println!("  Rows after:  {}", summary.rows_after);
    println!("  Re-keyed:    {}", summary.rekeyed);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        "Seeds: {}, workers: {}, database: {}",
        config.seeds.urls.len(),
        config.crawler.worker_count,
        config.output.database_path
    );

    let shutdown = setup_shutdown_handler();

    match crawl(config, shutdown).await {
        Ok(report) => {
            match report.status {
                RunStatus::Completed => tracing::info!("Crawl completed successfully"),
                RunStatus::Interrupted => {
                    tracing::info!("Crawl interrupted; run again with the same config to resume")
                }
                _ => {}
            }
            Ok(())
        }
        Err(LedgerError::WriterFailed { lost }) => {
            anyhow::bail!("{} URL write(s) were lost; run again to reconcile", lost.len())
        }
        Err(e) => Err(e).context("Crawl failed"),
    }
}

/// First Ctrl+C drains gracefully. Second Ctrl+C exits immediately.
fn setup_shutdown_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, finishing in-flight work (press again to force quit)");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("Force quit requested, exiting immediately");
                std::process::exit(130);
            }
        }
    });

    shutdown
}
