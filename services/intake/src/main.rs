use anyhow::{Context, Result};
use intake_service::config::{LedgerBackend, LoggingConfig};
use intake_service::{
    start_api_server, Adapters, AppState, BotApiNotifier, Config, CoordinatorSettings,
    LambdaTrigger, MemoryLedger, MtProtoSession, PgLedger, S3Uploader, ServiceHealth,
    SessionStatus, SubmissionCoordinator, SubmissionLedger, VideoStorage, VolunteerRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Video Intake Service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let (ledger, volunteers) = init_ledger(&config).await?;

    let storage: Arc<dyn VideoStorage> = Arc::new(
        S3Uploader::new(&config.s3)
            .await
            .context("Failed to initialize S3 uploader")?,
    );

    let trigger = Arc::new(
        LambdaTrigger::new(&config.lambda, &config.s3.region)
            .await
            .context("Failed to initialize Lambda trigger")?,
    );

    let notifier = Arc::new(
        BotApiNotifier::new(&config.notifier).context("Failed to initialize notifier")?,
    );

    let health = Arc::new(ServiceHealth::new());
    let coordinator = SubmissionCoordinator::new(
        Adapters {
            ledger,
            volunteers,
            storage: storage.clone(),
            trigger,
            notifier,
        },
        health.clone(),
        CoordinatorSettings {
            key_prefix: config.s3.key_prefix.clone(),
            progress_updates: config.notifier.progress_updates,
            max_concurrent_submissions: config.pipeline.max_concurrent_submissions,
        },
    );

    let session_status = SessionStatus::new();
    let shutdown = CancellationToken::new();

    // Spawn ingress task
    let ingress_handle = {
        let telegram = config.telegram.clone();
        let status = session_status.clone();
        let handler = Arc::new(coordinator.clone());
        let health = health.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let session = match MtProtoSession::connect(&telegram, status, health, &shutdown).await
            {
                Ok(Some(session)) => session,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Failed to start Telegram session");
                    return;
                }
            };
            if let Err(e) = session.run(handler, shutdown).await {
                error!(error = %e, "Ingress stopped with error");
            }
        })
    };

    // Spawn API server task
    let api_state = AppState {
        coordinator,
        storage,
        session: session_status,
        health,
        service_name: config.service.name.clone(),
        health_check_timeout: config.api.health_check_timeout(),
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Video intake service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down video intake service");

    // Let ingress save its session before the runtime goes away
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), ingress_handle)
        .await
        .is_err()
    {
        warn!("Ingress did not stop in time");
    }
    api_handle.abort();

    info!("Video intake service stopped");

    Ok(())
}

async fn init_ledger(
    config: &Config,
) -> Result<(Arc<dyn SubmissionLedger>, Arc<dyn VolunteerRegistry>)> {
    match config.ledger.backend {
        LedgerBackend::Postgres => {
            let ledger = Arc::new(
                PgLedger::new(&config.ledger)
                    .await
                    .context("Failed to initialize submission ledger")?,
            );

            if config.ledger.run_migrations {
                ledger
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let submissions: Arc<dyn SubmissionLedger> = ledger.clone();
            let volunteers: Arc<dyn VolunteerRegistry> = ledger;
            Ok((submissions, volunteers))
        }
        LedgerBackend::Memory => {
            warn!("Using in-memory ledger; submissions are lost on restart");
            let ledger = Arc::new(MemoryLedger::new());
            let submissions: Arc<dyn SubmissionLedger> = ledger.clone();
            let volunteers: Arc<dyn VolunteerRegistry> = ledger;
            Ok((submissions, volunteers))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(&config.level)
            .add_directive("grammers_mtsender=warn".parse()?)
            .add_directive("grammers_session=warn".parse()?)
            .add_directive("sqlx=warn".parse()?),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
