//! Main application state and service coordination
//!
//! This module contains the production AppState that wires the match store,
//! the lifecycle manager, the expiry reaper and the monitoring endpoints
//! together, and owns their background tasks.

use crate::activity::{ActivityFeed, InMemoryActivityFeed};
use crate::config::{AppConfig, StoreBackend};
use crate::lifecycle::RequestLifecycleManager;
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::reaper::ReaperTask;
use crate::service::health::{HealthCheck, HealthContext};
use crate::store::{InMemoryMatchStore, MatchStore, SqliteMatchStore};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Public entry points of the engine
    manager: RequestLifecycleManager,

    /// Online-status feed consulted by scoring and the reaper
    activity_feed: Arc<dyn ActivityFeed>,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Periodic expiry sweeps, when enabled
    reaper_task: Option<ReaperTask>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application with an in-process activity feed fed by
    /// the engine's own calls
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        Self::with_activity_feed(config, Arc::new(InMemoryActivityFeed::new())).await
    }

    /// Initialize the application around an existing activity feed
    pub async fn with_activity_feed(
        config: AppConfig,
        activity_feed: Arc<dyn ActivityFeed>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing heart-link matchmaking service");
        info!(
            "Configuration: service={}, store={:?}",
            config.service.name, config.store.backend
        );

        crate::config::validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        let store = Self::initialize_store(&config)?;

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let manager = RequestLifecycleManager::with_metrics(
            store,
            activity_feed.clone(),
            &config,
            metrics_collector.clone(),
        );

        let is_running = Arc::new(RwLock::new(false));
        let context = HealthContext::new(
            config.service.name.clone(),
            manager.clone(),
            is_running.clone(),
        );
        let metrics_service = Self::initialize_metrics(&config, metrics_collector, context);

        Ok(Self {
            config,
            manager,
            activity_feed,
            metrics_service,
            reaper_task: None,
            background_tasks: Vec::new(),
            is_running,
        })
    }

    /// Start the health endpoints, the reaper and the maintenance tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting heart-link matchmaking service");

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;
        self.start_reaper();
        self.start_background_tasks();

        info!("✅ Heart-link matchmaking service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of heart-link service");

        *self.is_running.write().await = false;

        if let Some(reaper) = self.reaper_task.take() {
            reaper.stop().await;
            info!("✅ Expiry reaper stopped");
        }

        info!("Stopping metrics service...");
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        } else {
            info!("✅ Metrics service stopped");
        }

        self.stop_background_tasks().await;

        let final_stats =
            self.manager
                .stats()
                .await
                .map_err(|e| ServiceError::BackgroundTask {
                    message: format!("Failed to get final stats: {}", e),
                })?;

        info!("Final service statistics: {:?}", final_stats);
        info!("✅ Heart-link service shutdown completed");

        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Get the lifecycle manager for operations
    pub fn manager(&self) -> RequestLifecycleManager {
        self.manager.clone()
    }

    /// Feed consulted for presence and recent activity
    pub fn activity_feed(&self) -> Arc<dyn ActivityFeed> {
        self.activity_feed.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    /// Health context sharing this service's running flag
    pub fn health_context(&self) -> HealthContext {
        HealthContext::new(
            self.config.service.name.clone(),
            self.manager.clone(),
            self.is_running.clone(),
        )
    }

    fn initialize_store(config: &AppConfig) -> Result<Arc<dyn MatchStore>, ServiceError> {
        match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory match store");
                Ok(Arc::new(InMemoryMatchStore::new()))
            }
            StoreBackend::Sqlite => {
                info!(
                    "Opening sqlite match store at {}",
                    config.store.sqlite_path.display()
                );
                let store = SqliteMatchStore::open(&config.store.sqlite_path, config.busy_timeout())
                    .map_err(|e| ServiceError::Storage {
                        message: format!("{:#}", e),
                    })?;
                Ok(Arc::new(store))
            }
        }
    }

    fn initialize_metrics(
        config: &AppConfig,
        metrics_collector: Arc<MetricsCollector>,
        context: HealthContext,
    ) -> Arc<MetricsService> {
        info!(
            "Initializing metrics service on port {}",
            config.service.health_port
        );

        let health_config = HealthServerConfig {
            port: config.service.health_port,
            host: "0.0.0.0".to_string(),
        };

        let health_server = Arc::new(
            HealthServer::new(health_config, metrics_collector.clone()).with_context(context),
        );
        Arc::new(MetricsService::new(metrics_collector, health_server))
    }

    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        info!("Starting metrics and health endpoints");

        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {:#}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ Metrics service started on port {}", port);
        Ok(())
    }

    fn start_reaper(&mut self) {
        if !self.config.reaper.enabled {
            info!("Expiry reaper disabled - relying on lazy expiry only");
            return;
        }

        self.reaper_task = Some(ReaperTask::spawn(
            self.manager.reaper(),
            self.config.reaper_interval(),
            self.config.reaper_jitter(),
        ));
    }

    fn start_background_tasks(&mut self) {
        let refresh = self.config.stats_refresh_interval();
        info!(
            "Starting matching stats refresh task ({}s interval)...",
            refresh.as_secs()
        );
        let stats_task = {
            let manager = self.manager.clone();
            let metrics_collector = self.metrics_service.collector();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(refresh);
                info!("Stats refresh task started");

                while *is_running.read().await {
                    interval.tick().await;

                    match manager.stats().await {
                        Ok(stats) => {
                            debug!(
                                "Updating metrics - pending: {}, matched: {}, sessions: {}",
                                stats.counts.pending, stats.counts.matched, stats.active_sessions
                            );
                            metrics_collector.update_from_stats(&stats);
                        }
                        Err(e) => {
                            warn!("Failed to get matching stats for metrics update: {}", e);
                        }
                    }
                }

                info!("Stats refresh task stopped");
            })
        };

        info!("Starting health metrics task (60s interval)...");
        let health_metrics_task = {
            let metrics_collector = self.metrics_service.collector();
            let context = self.health_context();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                let start_time = tokio::time::Instant::now();
                info!("Health metrics task started");

                while context.is_running().await {
                    interval.tick().await;

                    let uptime_seconds = start_time.elapsed().as_secs() as i64;
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(uptime_seconds);

                    match HealthCheck::check(&context).await {
                        Ok(health) => {
                            metrics_collector.update_health_status(health.status.as_gauge());
                            for check in &health.checks {
                                metrics_collector.update_component_health(
                                    &check.name,
                                    check.status.as_gauge() > 0,
                                );
                            }
                        }
                        Err(e) => warn!("Health check failed: {}", e),
                    }

                    debug!(
                        "Updated service health metrics - uptime: {}s",
                        uptime_seconds
                    );
                }

                info!("Health metrics task stopped");
            })
        };

        self.background_tasks.push(stats_task);
        self.background_tasks.push(health_metrics_task);

        info!("Background maintenance tasks started successfully");
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        let grace = self.config.shutdown_timeout().min(Duration::from_millis(500));
        for (i, task) in self.background_tasks.drain(..).enumerate() {
            debug!("Stopping background task {}/{}", i + 1, task_count);
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}
