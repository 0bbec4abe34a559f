//! SurveyShield -- delayed-submission server for anonymous survey responses.
//!
//! Crash-only design: every startup is a recovery.  The pending queue lives
//! in memory only and is never written out, on shutdown or otherwise.
//! SIGTERM/SIGINT stop the listener, then the flush loop, then leadership
//! is relinquished so a peer can take over without waiting for a timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use surveyshield::anonymize::{Anonymizer, PassThroughAnonymizer, PatternAnonymizer};
use surveyshield::cluster::{InstanceIdentity, LeaderCoordinator, PeerClient};
use surveyshield::config::{Config, DeploymentMode, LoggingConfig};
use surveyshield::coordination::sqlite::SqliteSettingsStore;
use surveyshield::coordination::SettingsStore;
use surveyshield::dss::{FlushPolicy, FlushScheduler, ThreadRngDice};
use surveyshield::storage::sqlite::SqliteResponseSink;
use surveyshield::storage::ResponseSink;

/// Command-line arguments for the SurveyShield server.
#[derive(Parser, Debug)]
#[command(
    name = "surveyshield",
    version,
    about = "Leader-elected delayed-submission server for survey responses"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "surveyshield.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        surveyshield::config::load_config(&cli.config)
            .with_context(|| format!("failed to load configuration from {}", cli.config))?
    } else {
        Config::default()
    };
    config.apply_env_overrides()?;
    // Before the identity is derived, so peers are told the port we listen on.
    if let Some(bind) = &cli.bind {
        config.apply_bind(bind)?;
    }
    config.validate()?;

    init_tracing(&config.logging);
    info!(path = %cli.config, mode = ?config.cluster.mode, "Configuration loaded");

    let policy = FlushPolicy::from_config(&config.flush)?;

    if config.observability.metrics {
        surveyshield::metrics::init_metrics();
        surveyshield::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Settings and responses share one SQLite file.
    let db_path = &config.storage.path;
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let settings: Arc<dyn SettingsStore> = Arc::new(SqliteSettingsStore::new(db_path)?);
    let sink: Arc<dyn ResponseSink> = Arc::new(SqliteResponseSink::new(db_path)?);
    info!(path = %db_path, "SQLite stores initialized");

    let identity = InstanceIdentity::from_config(&config);
    let peer = Arc::new(PeerClient::new(
        identity.clone(),
        &config.cluster.shared_secret,
        Duration::from_secs(config.cluster.request_timeout_seconds),
    )?);

    // Crash-only: seeding is idempotent and runs on every start.
    if config.cluster.mode == DeploymentMode::Multi {
        LeaderCoordinator::seed_settings(settings.as_ref(), &config.election).await?;
    }

    let coordinator = Arc::new(LeaderCoordinator::new(
        identity.clone(),
        config.cluster.mode,
        settings,
        peer.clone(),
        config.election.clone(),
    ));
    if let Err(e) = coordinator.start().await {
        error!(instance = %identity, error = %e, "Refusing to start");
        return Err(e.into());
    }

    let anonymizer: Arc<dyn Anonymizer> = if config.anonymization.enabled {
        Arc::new(PatternAnonymizer::new()?)
    } else {
        warn!("Free-text anonymization is disabled");
        Arc::new(PassThroughAnonymizer)
    };

    let scheduler = Arc::new(FlushScheduler::new(
        policy,
        coordinator.clone(),
        anonymizer,
        sink,
        Arc::new(ThreadRngDice),
    ));
    scheduler.start();

    let bind_addr = config.bind_address();
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);

    let state = Arc::new(surveyshield::AppState {
        config,
        coordinator: coordinator.clone(),
        scheduler: scheduler.clone(),
        peer,
    });
    let app = surveyshield::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(instance = %identity, "SurveyShield listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Timers stop before leadership is given up.
    let teardown = async {
        scheduler.stop().await;
        coordinator.stop().await;
    };
    if tokio::time::timeout(shutdown_timeout, teardown).await.is_err() {
        warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "Shutdown timed out; peers will wait for the leader timeout"
        );
    }

    info!("SurveyShield shut down");
    Ok(())
}

/// Install the global subscriber.  `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
