use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use rkward::cli::{Cli, Commands};
use rkward::config::Config;
use rkward::election::ElectionManager;
use rkward::probe::{self, HealthProbe};
use rkward::runtime::DockerRuntime;
use rkward::supervisor::{Supervisor, spawn_transition_logger};
use rkward::targets::monitored_targets;

const LOG_PREFIX: &str = "rkward.log";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    match cli.command {
        Commands::Start { compose } => start(compose)
            .await
            .inspect_err(|e| error!("failed to run: {e:#}")),
    }
}

async fn start(compose: Option<PathBuf>) -> Result<()> {
    let mut cfg = Config::from_env()?;
    if let Some(path) = compose {
        cfg.compose_path = path;
    }
    info!(
        my_id = cfg.my_id,
        total_replicas = cfg.total_replicas,
        "starting coordinator replica"
    );

    // Cross-monitoring: peers probe this replica on the health port.
    let health_listener = probe::bind(&cfg.health_bind).await?;
    tokio::spawn(probe::serve(health_listener));

    let runtime = Arc::new(DockerRuntime::connect().await?);

    let election = ElectionManager::new(cfg.election.clone());
    let _election_tasks = election.start().await?;
    spawn_transition_logger(&election);

    let targets = monitored_targets(&cfg);
    info!(
        count = targets.len(),
        interval = ?cfg.check_interval,
        "monitoring configured, waiting for leader election"
    );

    let supervisor = Supervisor::new(
        election,
        HealthProbe::default(),
        runtime,
        targets,
        cfg.check_interval,
    );
    supervisor.run(shutdown_signal()).await;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
    };
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install the SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received interrupt, shutting down"),
            _ = term.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received interrupt, shutting down");
    }
}

fn init_tracing() -> Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_filter(console_filter);

    // File logging is opt-in; replicas usually run with stdout collection.
    match std::env::var("RKWARD_LOG_DIR") {
        Ok(log_dir) => {
            fs::create_dir_all(&log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_PREFIX);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_appender)
                .with_filter(LevelFilter::DEBUG);
            Registry::default().with(console_layer).with(file_layer).init();
        }
        Err(_) => Registry::default().with(console_layer).init(),
    }
    Ok(())
}
