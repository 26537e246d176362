//! DealScan Engine
//!
//! Scans deal provider categories on a fixed interval, ranks what it finds
//! and hands fresh deals to the configured publisher.
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT signals, ensuring:
//! - An in-flight cycle is abandoned without marking anything surfaced
//! - The status server stops accepting connections
//! - Database connections are closed cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dealscan::api::{self, AppState};
use dealscan::config::{Config, LoggingConfig};
use dealscan::publisher::{DryRunPublisher, Publisher, WebhookPublisher};
use dealscan::{Database, DedupStore, ProviderClient, RateBudget, Result, ScanScheduler, ScoringEngine};

type ServiceHandle = JoinHandle<Result<()>>;

#[tokio::main]
async fn main() -> Result<()> {
    let logging = LoggingConfig::from_env();
    // Dropping the guard flushes the log file
    let _log_guard = init_tracing(&logging);

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 DealScan Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    let config = Config::from_env()?;
    info!("✅ Configuration loaded and validated");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let budget = Arc::new(RateBudget::load_or_new(
        config.budget.state_file.as_deref(),
        config.budget.tokens_per_minute,
        config.budget.capacity,
    ));
    let client = ProviderClient::new(
        &config.provider,
        Arc::clone(&budget),
        config.budget.acquire_policy(),
    )?;
    info!("✅ Provider client initialized");

    let database = match &config.database {
        Some(db_config) => {
            let db = Database::connect(db_config).await?;
            info!("✅ Database connection pool established");
            Some(db)
        }
        None => None,
    };

    let window = config.cooldown.window_chrono()?;
    let dedup = match &database {
        Some(db) => DedupStore::new(Box::new(db.cooldown_store()), window),
        None => {
            warn!("⚠️ No DATABASE_URL, cooldowns are kept in memory and lost on restart");
            DedupStore::in_memory(window)
        }
    };

    let publisher: Arc<dyn Publisher> = match &config.publisher.webhook_url {
        Some(url) => Arc::new(WebhookPublisher::new(url.clone(), config.publisher.timeout)?),
        None => {
            warn!("⚠️ No PUBLISHER_WEBHOOK_URL, running as a dry run");
            Arc::new(DryRunPublisher)
        }
    };
    info!("✅ Publisher: {}", publisher.name());

    let scheduler = Arc::new(
        ScanScheduler::new(
            config.scheduler.clone(),
            &config.catalog,
            Arc::new(client),
            ScoringEngine::new(config.publisher.affiliate_tag.clone()),
            dedup,
            publisher,
        )
        .with_budget(Arc::clone(&budget)),
    );

    let mut handles: Vec<ServiceHandle> = Vec::new();

    info!(
        "🔍 Starting scheduler ({} categories every {:?})...",
        scheduler.dispatch_order().len(),
        config.scheduler.cycle_interval
    );
    handles.push(spawn_scheduler(Arc::clone(&scheduler), &shutdown_tx));

    if config.api.enabled {
        let state = Arc::new(AppState {
            scheduler: Arc::clone(&scheduler),
            budget: Arc::clone(&budget),
            database: database.clone(),
        });
        handles.push(tokio::spawn(api::start_server(
            state,
            config.api.clone(),
            shutdown_tx.subscribe(),
        )));
        info!(
            "  🔗 Status: http://{}:{}/api/v1/status",
            config.api.host, config.api.port
        );
    }

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started");
    info!("═══════════════════════════════════════════════════════════════");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_exit(&handles) => {
            warn!("⚠️ A service stopped, initiating shutdown");
        }
    }

    info!("🛑 Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(30);
    let outcome = match tokio::time::timeout(shutdown_timeout, shutdown_services(handles)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("⚠️ Shutdown timeout exceeded, forcing exit");
            Ok(())
        }
    };

    if let Some(path) = &config.budget.state_file {
        match budget.snapshot().save(path) {
            Ok(()) => info!("💾 Budget saved to {}", path.display()),
            Err(e) => warn!("⚠️ Failed to save budget to {}: {}", path.display(), e),
        }
    }

    if let Some(db) = database {
        db.close().await;
    }

    info!("👋 DealScan Engine stopped");
    outcome
}

/// Initialize structured logging with tracing.
///
/// Stdout is pretty or JSON per `LOG_FORMAT`; with `LOG_DIR` set a daily
/// rotating JSON file is written too.
fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("dealscan=debug,dealscan_engine=debug,tower_http=info,sqlx=warn,info")
    });

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dealscan.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, pretty_layer) = if config.json {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(std::env::var("NO_COLOR").is_err());
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    guard
}

fn spawn_scheduler(
    scheduler: Arc<ScanScheduler>,
    shutdown: &broadcast::Sender<()>,
) -> ServiceHandle {
    let shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let result = scheduler.run(shutdown_rx).await;
        if let Err(e) = &result {
            error!("Scheduler stopped: {}", e);
        }
        result
    })
}

/// Wait for any service to exit
async fn wait_for_any_exit(handles: &[ServiceHandle]) {
    loop {
        if handles.iter().any(|h| h.is_finished()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for all services and report the first failure
async fn shutdown_services(handles: Vec<ServiceHandle>) -> Result<()> {
    let mut outcome = Ok(());
    for handle in handles {
        match handle.await {
            Ok(Err(e)) if outcome.is_ok() => outcome = Err(e),
            Ok(_) => {}
            Err(e) => error!("Service task panicked: {}", e),
        }
    }
    outcome
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
}
