mod collector;
mod config;
mod error;
mod metrics;
mod model;
mod pacing;
mod provisioner;
mod publisher;
mod report;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::collector::CollectPolicy;
use crate::config::{Config, LogFormat};
use crate::metrics::MetricsRegistry;
use crate::pacing::Pacer;
use crate::publisher::{PublishOptions, Publisher};
use crate::store::github::GitHubStore;
use crate::store::memory::MemoryStore;
use crate::store::ObjectStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "forgepublish",
    about = "Publish a local directory as a new GitHub repository"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "forgepublish.yaml")]
    config: PathBuf,

    /// Run against an in-memory store instead of GitHub.
    #[arg(long)]
    dry_run: bool,
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // stdout is reserved for the run summary.
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn build_publisher<S: ObjectStore>(
    store: S,
    config: &Config,
    pacer: Pacer,
    metrics: &MetricsRegistry,
    cancel: &CancellationToken,
) -> Publisher<S> {
    Publisher::new(
        store,
        PublishOptions::from_config(&config.publish),
        pacer,
        metrics.clone(),
        cancel.clone(),
    )
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, cancelling publish"),
        () = terminate => tracing::info!("received SIGTERM, cancelling publish"),
    }
    token.cancel();
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let dry_run = cli.dry_run || config.publish.dry_run;

    // ---- Tracing ----
    init_tracing(config.logging.format);
    tracing::info!(
        config_path = %cli.config.display(),
        repo = %config.repository.name,
        source = %config.source.path.display(),
        dry_run,
        "starting forgepublish"
    );

    let policy = CollectPolicy::from_config(&config.source).context("invalid exclude pattern")?;
    let metrics = MetricsRegistry::new();
    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(cancel.clone()));

    // ---- Publish ----
    let result = if dry_run {
        let store = MemoryStore::new("dry-run", config.source.max_file_size);
        let mut publisher =
            build_publisher(store, &config, Pacer::unpaced(), &metrics, &cancel);
        let result = publisher
            .publish(&config.source.path, &config.repository, &policy)
            .await;
        let calls = publisher.store().calls().await;
        tracing::info!(
            owner = publisher.store().owner(),
            calls = calls.len(),
            git_writes = calls.iter().filter(|c| c.is_git_write()).count(),
            "dry run finished; nothing was sent upstream"
        );
        result
    } else {
        let token = std::env::var(&config.upstream.token_env).with_context(|| {
            format!(
                "environment variable {} must hold a GitHub token",
                config.upstream.token_env
            )
        })?;
        let store = GitHubStore::connect(
            &config.upstream,
            &token,
            config.source.max_file_size,
            metrics.clone(),
        )
        .await
        .context("failed to authenticate against the GitHub API")?;
        tracing::info!(owner = %store.session().owner, "GitHub session established");

        let mut publisher =
            build_publisher(store, &config, Pacer::new(&config.pacing), &metrics, &cancel);
        publisher
            .publish(&config.source.path, &config.repository, &policy)
            .await
    };
    signal_task.abort();
    tracing::info!(
        state = %result.final_state,
        uploaded = result.files_uploaded,
        skipped = result.files_skipped,
        failed = result.files_failed,
        "publish finished"
    );

    // ---- Metrics ----
    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = metrics.write_textfile(path) {
            tracing::warn!(error = %format!("{e:#}"), "failed to write metrics textfile");
        }
    }

    // ---- Report ----
    print!("{}", report::Summary::new(&result, dry_run));
    Ok(report::exit_code(
        &result,
        config.publish.fail_on_partial_upload,
    ))
}
