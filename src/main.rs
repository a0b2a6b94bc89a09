//! Main entry point for the Heart Link matchmaking service
//!
//! This is the production entry point that initializes and runs the
//! matchmaking engine with its expiry reaper and monitoring endpoints,
//! with proper error handling, logging, and graceful shutdown.

use anyhow::Result;
use clap::Parser;
use heart_link::config::{AppConfig, StoreBackend};
use heart_link::service::{AppState, HealthCheck, HealthContext, HealthStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Heart Link Matchmaking Service - pairs waiting users into private sessions
#[derive(Parser)]
#[command(
    name = "heart-link",
    version,
    about = "A pairwise matchmaking service for private two-party sessions",
    long_about = "Heart Link pairs users who ask to be matched into private two-party sessions. \
                 Candidates are ranked by recent activity and match history, claimed with a \
                 guarded atomic update, and committed together with their session so no user \
                 is ever paired twice. A background reaper expires abandoned requests and ends \
                 idle sessions."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Check the configured store and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health/metrics server port")]
    health_port: Option<u16>,

    /// Store backend override
    #[arg(long, value_name = "BACKEND", help = "Override store backend (memory, sqlite)")]
    store: Option<StoreBackend>,

    /// Sqlite path override
    #[arg(long, value_name = "FILE", help = "Override sqlite database path")]
    sqlite_path: Option<PathBuf>,

    /// Disable the periodic reaper
    #[arg(long, help = "Disable the periodic expiry reaper (lazy expiry still applies)")]
    no_reaper: bool,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// One-shot check of the configured store; exits with the result
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let app_state = AppState::new(config).await?;
    // The check runs outside a started service, so report it as running
    let context = HealthContext::new(
        app_state.config().service.name.clone(),
        app_state.manager(),
        Arc::new(RwLock::new(true)),
    );

    match HealthCheck::check(&context).await {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            println!("  Requests Waiting: {}", health.stats.requests_waiting);
            println!("  Requests Matched: {}", health.stats.requests_matched);
            println!("  Active Sessions: {}", health.stats.active_sessions);
            println!("  Match Rate: {:.1}%", health.stats.match_rate);

            if health.status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30 seconds
async fn health_check_task(context: HealthContext) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while context.is_running().await {
        interval.tick().await;

        match HealthCheck::check(&context).await {
            Ok(health) => {
                info!(
                    "Health check: {} - {} waiting, {} active sessions",
                    health.status, health.stats.requests_waiting, health.stats.active_sessions
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

/// Display startup banner with service information
fn display_startup_banner(config: &AppConfig) {
    info!("💞 Heart Link Matchmaking Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    match config.store.backend {
        StoreBackend::Memory => info!("   Store: memory"),
        StoreBackend::Sqlite => info!("   Store: sqlite ({})", config.store.sqlite_path.display()),
    }
    info!(
        "   Pending TTL: {}s, matched TTL: {}s",
        config.matching.pending_ttl_seconds, config.matching.matched_ttl_seconds
    );
    info!(
        "   Reaper: {} (every {}s)",
        if config.reaper.enabled { "enabled" } else { "disabled" },
        config.reaper.interval_seconds
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load and merge configuration from file/environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    if let Some(backend) = args.store {
        config.store.backend = backend;
    }

    if let Some(sqlite_path) = &args.sqlite_path {
        config.store.sqlite_path = sqlite_path.clone();
    }

    if args.no_reaper {
        config.reaper.enabled = false;
    }

    heart_link::config::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let mut app_state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting service...");
    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.health_context()));

    info!("✅ Heart Link Matchmaking Service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => {
            info!("✅ Graceful shutdown completed successfully");
        }
        Ok(Err(e)) => {
            error!("Shutdown finished with errors: {}", e);
        }
        Err(_) => {
            warn!("⚠️  Shutdown timeout exceeded, forcing exit");
        }
    }

    info!("🛑 Heart Link Matchmaking Service stopped");
    Ok(())
}
