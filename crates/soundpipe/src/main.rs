//! soundpipe - bounded-retry sample-generation pipeline
//!
//! Main entry point for the orchestrator binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use soundpipe::{RunController, RunVerdict};
use soundpipe_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "soundpipe",
    about = "Turns a sound-design plan into rendered artifacts and a manifest",
    version
)]
struct Cli {
    /// Path to the design plan (JSON).
    plan: PathBuf,

    /// Path to a key=value config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output root directory (overrides config).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Concurrent task runners (overrides config).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enable verbose logging output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Precedence: CLI flags > config file > defaults.
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(out_dir) = cli.out_dir {
        config.out_dir = out_dir;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    let verdict = runtime.block_on(async {
        let cancel = CancellationToken::new();

        // Signals cancel in-flight collaborator calls cooperatively;
        // the run still finalizes with whatever the tasks reached.
        let signal_cancel = cancel.clone();

        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, cancelling run"),
                _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
            }
            signal_cancel.cancel();
        });

        #[cfg(not(unix))]
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, cancelling run");
                signal_cancel.cancel();
            }
        });

        let controller = RunController::new(config);
        let outcome = controller
            .execute(&cli.plan, &cancel)
            .await
            .wrap_err("run failed before any task was scheduled")?;

        println!(
            "{}: {}/{} samples succeeded, output in {}",
            outcome.verdict.as_str(),
            outcome.manifest.counts.succeeded,
            outcome.manifest.counts.planned,
            outcome.out_dir.display()
        );
        if let Some(path) = &outcome.manifest_path {
            println!("manifest: {}", path.display());
        }

        Ok::<RunVerdict, eyre::Report>(outcome.verdict)
    })?;

    if verdict == RunVerdict::CompletedWithErrors {
        std::process::exit(1);
    }
    Ok(())
}
