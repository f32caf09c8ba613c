//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::info;

use coursewatch_browser::WebDriverFactory;
use coursewatch_core::{CycleOutcome, Monitor, WebhookSink, run_scheduled};
use coursewatch_shared::{
    AppConfig, MonitorConfig, config_file_path, init_config_at, load_config, load_config_from,
};
use coursewatch_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CourseWatch: get notified when a course publishes new content.
#[derive(Parser)]
#[command(
    name = "coursewatch",
    version,
    about = "Watch an online course's content listing and post alerts for new or upgraded items.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.coursewatch/coursewatch.toml).
    #[arg(long, global = true, env = "COURSEWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run on the configured schedule until interrupted.
    Run {
        /// Run one cycle immediately instead of waiting for the first trigger.
        #[arg(long)]
        run_now: bool,
    },

    /// Run exactly one cycle and exit.
    Once,

    /// Print the stored catalog.
    Catalog,

    /// Print recent cycles.
    History {
        /// Number of cycles to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Forget the saved browser session so the next cycle logs in again.
    Logout,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a starter config file.
    Init,
    /// Show the configuration file as loaded.
    Show,
    /// Validate the configuration and report every problem.
    Check,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "coursewatch=info",
        1 => "coursewatch=debug",
        _ => "coursewatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { run_now } => cmd_run(config_path, run_now).await,
        Command::Once => cmd_once(config_path).await,
        Command::Catalog => cmd_catalog(config_path).await,
        Command::History { limit } => cmd_history(config_path, limit).await,
        Command::Logout => cmd_logout(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path).await,
            ConfigAction::Show => cmd_config_show(config_path).await,
            ConfigAction::Check => cmd_config_check(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn resolve_config(path: Option<&Path>) -> Result<MonitorConfig> {
    let app = load_app_config(path)?;
    Ok(MonitorConfig::resolve(&app)?)
}

async fn build_monitor(config: MonitorConfig) -> Result<Arc<Monitor>> {
    let config = Arc::new(config);
    let storage = Arc::new(Storage::open(&config.db_path).await?);
    let factory = Arc::new(WebDriverFactory::new(&config.webdriver, config.timeouts)?);
    let sink = Arc::new(WebhookSink::new(config.webhook_url.clone(), config.timeouts.webhook)?);
    Ok(Arc::new(Monitor::new(config, factory, storage, sink)))
}

async fn open_readonly(path: Option<&Path>) -> Result<Storage> {
    let app = load_app_config(path)?;
    let db_path = app.storage.resolved_path()?;
    Ok(Storage::open_readonly(&db_path).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, run_now: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let schedule = config.schedule.clone();
    let run_on_start = config.run_on_start || run_now;

    info!(
        content_url = %config.content_url,
        schedule = %schedule,
        run_on_start,
        "starting monitor"
    );

    let monitor = build_monitor(config).await?;
    run_scheduled(monitor, schedule, run_on_start, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await;

    Ok(())
}

async fn cmd_once(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let monitor = build_monitor(config).await?;

    let outcome = tokio::select! {
        outcome = monitor.run_cycle() => outcome,
        _ = tokio::signal::ctrl_c() => {
            monitor.shutdown().await;
            return Err(eyre!("interrupted"));
        }
    };

    println!();
    match outcome {
        CycleOutcome::Completed(report) => {
            println!("  Cycle completed");
            println!("  Items:    {}", report.items);
            println!("  Changes:  {}", report.events);
            println!("  New:      {}", report.dispatch.new);
            println!("  Upgraded: {}", report.dispatch.upgraded);
        }
        CycleOutcome::Bootstrap { items } => {
            println!("  Catalog seeded with {items} items (no alerts on first run)");
        }
        CycleOutcome::Skipped => println!("  Another cycle is already running"),
        CycleOutcome::Failed { stage, error } => {
            return Err(eyre!("cycle failed during {stage}: {error}"));
        }
    }
    println!();

    Ok(())
}

async fn cmd_catalog(config_path: Option<&Path>) -> Result<()> {
    let storage = open_readonly(config_path).await?;
    let catalog = storage.load_catalog().await?;

    if catalog.is_empty() {
        println!("Catalog is empty. Run `coursewatch once` to seed it.");
        return Ok(());
    }

    println!("{:<12} {:<6} TITLE", "ID", "KIND");
    for (id, record) in catalog.iter() {
        println!("{id:<12} {:<6} {}", record.content_kind.as_str(), record.title);
    }
    println!();
    println!("{} items", catalog.len());
    Ok(())
}

async fn cmd_history(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let storage = open_readonly(config_path).await?;
    let cycles = storage.recent_cycles(limit).await?;

    if cycles.is_empty() {
        println!("No cycles recorded yet.");
        return Ok(());
    }

    for cycle in cycles {
        let elapsed = cycle.finished_at - cycle.started_at;
        let counts = match (cycle.items, cycle.events) {
            (Some(items), Some(events)) => format!("{items} items, {events} changes"),
            _ => String::new(),
        };
        println!(
            "{}  {:<9} {:>6}ms  {}{}",
            cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
            cycle.outcome,
            elapsed.num_milliseconds(),
            counts,
            cycle.error.map(|e| format!("  {e}")).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_logout(config_path: Option<&Path>) -> Result<()> {
    let app = load_app_config(config_path)?;
    let storage = Storage::open(&app.storage.resolved_path()?).await?;
    storage.clear_cookies().await?;
    println!("Saved session cleared.");
    Ok(())
}

async fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    let path = init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_check(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    println!("Configuration OK");
    println!("  Content:  {}", config.content_url);
    println!("  Schedule: {}", config.schedule);
    println!("  Database: {}", config.db_path.display());
    println!("  Browser:  {} via {}", config.webdriver.browser, config.webdriver.url);
    Ok(())
}
