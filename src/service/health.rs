//! Health check endpoints and monitoring
//!
//! This module provides health check functionality for the heart-link
//! matchmaking service, including readiness and liveness checks.

use crate::lifecycle::RequestLifecycleManager;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

impl HealthStatus {
    /// Gauge value used by `heart_link_health_status`
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Healthy => 2,
        }
    }
}

/// What the health checks need to look at
#[derive(Clone)]
pub struct HealthContext {
    /// Service name reported in responses
    pub service_name: String,
    /// Engine façade; its stats query doubles as a store ping
    pub manager: RequestLifecycleManager,
    /// Flipped by `AppState::start` / `shutdown`
    pub is_running: Arc<RwLock<bool>>,
}

impl HealthContext {
    pub fn new(
        service_name: impl Into<String>,
        manager: RequestLifecycleManager,
        is_running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            manager,
            is_running,
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Service statistics
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Requests waiting for a partner (pending or mid-claim)
    pub requests_waiting: u64,
    /// Requests that ended in a match
    pub requests_matched: u64,
    /// Sessions with two participants
    pub active_sessions: u64,
    /// Percentage of all requests that are matched
    pub match_rate: f64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(context: &HealthContext) -> Result<Self> {
        let mut checks = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        let service_check = Self::check_service_running(context).await;
        if service_check.status != HealthStatus::Healthy {
            overall_status = HealthStatus::Unhealthy;
        }
        checks.push(service_check);

        let store_check = Self::check_match_store(context).await;
        if store_check.status == HealthStatus::Unhealthy {
            overall_status = HealthStatus::Unhealthy;
        } else if store_check.status == HealthStatus::Degraded
            && overall_status == HealthStatus::Healthy
        {
            overall_status = HealthStatus::Degraded;
        }
        checks.push(store_check);

        let stats = Self::gather_service_stats(context).await;

        Ok(HealthCheck {
            status: overall_status,
            service: context.service_name.clone(),
            version: std::env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(context: &HealthContext) -> Result<HealthStatus> {
        if context.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify the store answers queries
    pub async fn readiness_check(context: &HealthContext) -> Result<HealthStatus> {
        if !context.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        Ok(Self::check_match_store(context).await.status)
    }

    async fn check_service_running(context: &HealthContext) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if context.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_match_store(context: &HealthContext) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match context.manager.stats().await {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Match store stats query failed: {}", e);
                (
                    HealthStatus::Degraded,
                    Some(format!("Stats query failed: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "match_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn gather_service_stats(context: &HealthContext) -> ServiceStats {
        match context.manager.stats().await {
            Ok(stats) => ServiceStats {
                requests_waiting: stats.counts.pending + stats.counts.matching,
                requests_matched: stats.counts.matched,
                active_sessions: stats.active_sessions,
                match_rate: stats.match_rate,
            },
            Err(e) => {
                debug!("Failed to get matching stats for health check: {}", e);
                ServiceStats::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityFeed;
    use crate::config::AppConfig;
    use crate::store::InMemoryMatchStore;

    fn context(running: bool) -> HealthContext {
        let manager = RequestLifecycleManager::new(
            Arc::new(InMemoryMatchStore::new()),
            Arc::new(InMemoryActivityFeed::new()),
            &AppConfig::default(),
        );
        HealthContext::new("heart-link", manager, Arc::new(RwLock::new(running)))
    }

    #[tokio::test]
    async fn test_stopped_service_is_unhealthy() {
        let context = context(false);
        assert_eq!(
            HealthCheck::liveness_check(&context).await.unwrap(),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthCheck::readiness_check(&context).await.unwrap(),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_full_check_reports_stats() {
        let context = context(true);
        context.manager.create_request("alice").await.unwrap();
        context.manager.create_request("bob").await.unwrap();

        let health = HealthCheck::check(&context).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.service, "heart-link");
        assert_eq!(health.checks.len(), 2);
        assert_eq!(health.stats.requests_matched, 2);
        assert_eq!(health.stats.active_sessions, 1);
        assert!(health.to_json().unwrap().contains("match_store"));
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(HealthStatus::Healthy.as_gauge(), 2);
        assert_eq!(HealthStatus::Degraded.as_gauge(), 1);
        assert_eq!(HealthStatus::Unhealthy.as_gauge(), 0);
    }
}
