use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ontime::api::metrics::init_metrics;
use ontime::api::rate_limit::spawn_cleanup_task;
use ontime::config::Config;
use ontime::payments::HttpPaymentGateway;
use ontime::sms::{HttpSmsGateway, LogGateway, SmsGateway, SmsWorker};
use ontime::AppState;

#[derive(Parser, Debug)]
#[command(name = "ontime")]
#[command(author, version, about = "Appointment booking with SMS reminders", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ontime.toml", env = "ONTIME_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting OnTime v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db = ontime::db::init(&config.server.data_dir).await?;

    if let (Some(username), Some(password)) = (
        config.auth.bootstrap_admin_username.as_deref(),
        config.auth.bootstrap_admin_password.as_deref(),
    ) {
        ontime::db::ensure_admin(&db, username, password).await?;
    }

    let payments = Arc::new(HttpPaymentGateway::new(&config.payment)?);
    let mut state = AppState::new(config.clone(), db.clone(), payments);

    match init_metrics() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Metrics recorder not installed"),
    }
    let state = Arc::new(state);

    // SMS delivery worker
    let gateway: Arc<dyn SmsGateway> = if config.sms.enabled {
        Arc::new(HttpSmsGateway::new(&config.sms)?)
    } else {
        tracing::warn!("SMS gateway disabled, messages will only be logged");
        Arc::new(LogGateway)
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SmsWorker::new(state.sms.clone(), gateway, config.sms.poll_interval_ms);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    if config.rate_limit.enabled {
        spawn_cleanup_task(state.rate_limiter.clone(), config.rate_limit.cleanup_interval);
    }

    let app = ontime::api::create_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Let the worker finish the message it is sending
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "SMS worker task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
