use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use idbdownsampler::app::App;
use idbdownsampler::config::{self, Config};

/// Continuous downsampler for retention-tiered InfluxDB buckets.
#[derive(Parser)]
#[command(name = "idbdownsampler", about)]
struct Cli {
    /// Path to the configuration file (default: deployment location,
    /// overridable via IDBDS_CONF / IDBDS_TESTDB).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Release version string (set at build time).
const RELEASE: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("idbdownsampler {RELEASE}");
        return Ok(());
    }

    // IDBDS_DEBUG forces debug logging regardless of the flag.
    let level = if config::debug_enabled() {
        "debug"
    } else {
        &cli.log_level
    };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = RELEASE, "starting influxdb downsampler");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let app = App::new(cfg)?;

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    };

    let result = tokio::select! {
        res = app.run() => res,
        () = shutdown => Ok(()),
    };

    app.shutdown();

    tracing::info!("influxdb downsampler stopped");

    result
}
