use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use appstats::app::{self, App, MigrateAction};
use appstats::clock::{FixedClock, ReportingClock, SystemClock};
use appstats::config::Config;
use appstats::rollup::Granularity;

/// Application usage statistics service.
#[derive(Parser)]
#[command(name = "appstats", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file. Default: info.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Print a usage series as JSON and exit.
    Report {
        /// Window length in days, ending today. Default: report.window_days.
        #[arg(long)]
        days: Option<u32>,

        /// Bucket size: day, week or month.
        #[arg(long, default_value = "day")]
        granularity: Granularity,

        /// Treat this UTC date (YYYY-MM-DD) as today.
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateCommand,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateCommand {
    /// Apply all pending migrations.
    Up,
    /// Roll back the most recent migration.
    Down,
    /// Show the applied schema version.
    Status,
}

impl From<MigrateCommand> for MigrateAction {
    fn from(cmd: MigrateCommand) -> Self {
        match cmd {
            MigrateCommand::Up => Self::Up,
            MigrateCommand::Down => Self::Down,
            MigrateCommand::Status => Self::Status,
        }
    }
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("appstats {}", version::full());
        return Ok(());
    }

    // One-shot commands fall back to defaults; the service needs a file.
    let cfg = match (&cli.config, &cli.command) {
        (Some(path), _) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        (None, None) => bail!("--config is required (use --help for usage)"),
        (None, Some(_)) => Config::default(),
    };

    // Initialize tracing.
    let log_level = cfg.effective_log_level(cli.log_level.as_deref());
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        None | Some(Command::Version) => rt.block_on(run(cfg)),
        Some(Command::Report {
            days,
            granularity,
            as_of,
        }) => rt.block_on(print_report(cfg, days, granularity, as_of)),
        Some(Command::Migrate { action }) => rt.block_on(run_migrate(cfg, action.into())),
    }
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting appstats",
    );

    let mut app = App::new(cfg)?;
    app.start().await?;

    shutdown_signal().await;

    app.stop().await?;

    tracing::info!("appstats stopped");

    Ok(())
}

async fn print_report(
    cfg: Config,
    days: Option<u32>,
    granularity: Granularity,
    as_of: Option<NaiveDate>,
) -> Result<()> {
    let days = days.unwrap_or(cfg.report.window_days);
    let clock: Arc<dyn ReportingClock> = match as_of {
        Some(date) => Arc::new(FixedClock::at_date(date)),
        None => Arc::new(SystemClock),
    };

    let series = app::report(&cfg, clock, days, granularity).await?;
    let json = serde_json::to_string_pretty(&series).context("encoding series")?;
    println!("{json}");

    Ok(())
}

async fn run_migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let status = app::migrate(&cfg, action).await?;

    println!(
        "schema version {} of {} (dirty: {}, pending: {})",
        status.version,
        status.latest,
        status.dirty,
        status.pending()
    );

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "listening for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "registering SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
