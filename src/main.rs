use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use perfcollector::config::Config;
use perfcollector::encode::text::SnapshotJson;
use perfcollector::export::api::ApiServer;
use perfcollector::pipeline::Pipeline;
use perfcollector::store::spill::read_spill_file;

/// Windowed performance-trace collector.
#[derive(Parser)]
#[command(name = "perfcollector", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a spilled window file and print it as JSON.
    Inspect {
        /// Path to a `.pcws` spill file.
        file: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
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

    match &cli.command {
        Some(Command::Version) => {
            println!("perfcollector {}", version::full());
            return Ok(());
        }
        Some(Command::Inspect { file }) => return inspect(file),
        None => {}
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting perfcollector",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn inspect(path: &Path) -> Result<()> {
    let (sequence_id, snapshot) = read_spill_file(path)?;
    let json = SnapshotJson::from_snapshot(&snapshot, Some(sequence_id));
    println!(
        "{}",
        serde_json::to_string_pretty(&json).context("rendering window")?
    );
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let api_cfg = cfg.api.clone();
    let pipeline = Pipeline::start(cfg).await?;

    let api = if api_cfg.enabled {
        let server = ApiServer::new(
            &api_cfg.addr,
            pipeline.store().clone(),
            pipeline.metrics().clone(),
            pipeline.budgets().clone(),
        );
        server.start().await?;
        Some(server)
    } else {
        None
    };

    let _ = shutdown_rx.await;

    let counters = pipeline.stop().await?;
    if let Some(api) = api {
        api.stop();
    }

    tracing::info!(
        ingest_drops = counters.ingest_drops,
        upload_drops = counters.upload_drops,
        overflow_count = counters.overflow_count,
        "perfcollector stopped",
    );

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "registering SIGTERM handler"),
        }
    }

    let _ = ctrl_c.await;
    tracing::info!("received SIGINT, shutting down");
}
