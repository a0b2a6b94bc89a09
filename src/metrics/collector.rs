//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the heart-link matchmaking
//! service using Prometheus metrics.

use crate::types::{CleanupReport, MatchingStats};
use anyhow::Result;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Request lifecycle metrics
    request_metrics: RequestMetrics,

    /// Pairing protocol metrics
    pairing_metrics: PairingMetrics,

    /// Expiry and cleanup metrics
    expiry_metrics: ExpiryMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Request lifecycle metrics
#[derive(Clone)]
pub struct RequestMetrics {
    /// create_request calls by outcome (matched, pending, reconnect, rejected)
    pub requests_created_total: IntCounterVec,

    /// Requests cancelled by their owner
    pub requests_cancelled_total: IntCounter,

    /// Cancel calls that found nothing pending
    pub cancels_rejected_total: IntCounter,

    /// Requests currently in each status
    pub requests_by_status: IntGaugeVec,

    /// Sessions currently active
    pub active_sessions: IntGauge,

    /// Share of all requests that are matched (0-100)
    pub match_rate: Gauge,
}

/// Pairing protocol metrics
#[derive(Clone)]
pub struct PairingMetrics {
    /// Pairings committed
    pub matches_total: IntCounter,

    /// Claims or commits lost to a concurrent attempt
    pub races_lost_total: IntCounter,

    /// Commit failures by kind (transient, terminal, exhausted)
    pub commit_conflicts_total: IntCounterVec,

    /// Activity feed lookups that failed and were scored as idle
    pub activity_feed_errors_total: IntCounter,

    /// Candidates examined per attempt
    pub candidates_examined: Histogram,
}

/// Expiry and cleanup metrics
#[derive(Clone)]
pub struct ExpiryMetrics {
    /// Requests expired by reason (pending_ttl, matched_ttl, session_ended, conflict)
    pub requests_expired_total: IntCounterVec,

    /// Sessions ended by reason (inactivity, participant)
    pub sessions_ended_total: IntCounterVec,

    /// Reaper items skipped because of an error
    pub sweep_failures_total: IntCounter,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Matcher attempt duration
    pub attempt_duration: Histogram,

    /// Full create_request duration
    pub create_request_duration: Histogram,

    /// Reaper sweep duration
    pub sweep_duration: Histogram,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let request_metrics = RequestMetrics::new(&registry)?;
        let pairing_metrics = PairingMetrics::new(&registry)?;
        let expiry_metrics = ExpiryMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            request_metrics,
            pairing_metrics,
            expiry_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get request metrics
    pub fn requests(&self) -> &RequestMetrics {
        &self.request_metrics
    }

    /// Get pairing metrics
    pub fn pairing(&self) -> &PairingMetrics {
        &self.pairing_metrics
    }

    /// Get expiry metrics
    pub fn expiry(&self) -> &ExpiryMetrics {
        &self.expiry_metrics
    }

    /// Get performance metrics
    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh gauges from a statistics snapshot
    pub fn update_from_stats(&self, stats: &MatchingStats) {
        let counts = &stats.counts;
        for (status, count) in [
            ("pending", counts.pending),
            ("matching", counts.matching),
            ("matched", counts.matched),
            ("expired", counts.expired),
            ("cancelled", counts.cancelled),
        ] {
            self.request_metrics
                .requests_by_status
                .with_label_values(&[status])
                .set(count as i64);
        }

        self.request_metrics
            .active_sessions
            .set(stats.active_sessions as i64);
        self.request_metrics.match_rate.set(stats.match_rate);
    }

    /// Record a create_request call
    pub fn record_request_created(&self, outcome: &str, duration: Duration) {
        self.request_metrics
            .requests_created_total
            .with_label_values(&[outcome])
            .inc();

        self.performance_metrics
            .create_request_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a cancel_request call
    pub fn record_cancellation(&self, cancelled: usize) {
        if cancelled == 0 {
            self.request_metrics.cancels_rejected_total.inc();
        } else {
            self.request_metrics
                .requests_cancelled_total
                .inc_by(cancelled as u64);
        }
    }

    /// Record a finished matcher attempt
    pub fn record_attempt(&self, candidates_examined: usize, duration: Duration) {
        self.pairing_metrics
            .candidates_examined
            .observe(candidates_examined as f64);
        self.performance_metrics
            .attempt_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a committed pairing
    pub fn record_match(&self) {
        self.pairing_metrics.matches_total.inc();
    }

    /// Record a lost claim or commit race
    pub fn record_race_lost(&self) {
        self.pairing_metrics.races_lost_total.inc();
    }

    /// Record a commit failure (transient, terminal, exhausted)
    pub fn record_commit_conflict(&self, kind: &str) {
        self.pairing_metrics
            .commit_conflicts_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record an activity feed failure
    pub fn record_activity_feed_error(&self) {
        self.pairing_metrics.activity_feed_errors_total.inc();
    }

    /// Record requests expired for a reason
    pub fn record_expired(&self, reason: &str, count: usize) {
        if count > 0 {
            self.expiry_metrics
                .requests_expired_total
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    /// Record sessions ended for a reason
    pub fn record_sessions_ended(&self, reason: &str, count: usize) {
        if count > 0 {
            self.expiry_metrics
                .sessions_ended_total
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    /// Record a completed reaper pass
    pub fn record_cleanup(&self, report: &CleanupReport, duration: Duration) {
        self.expiry_metrics
            .sweep_failures_total
            .inc_by(report.failed_items as u64);
        self.performance_metrics
            .sweep_duration
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("heart_link_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "heart_link_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("heart_link_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl RequestMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_created_total = IntCounterVec::new(
            Opts::new(
                "heart_link_requests_created_total",
                "create_request calls by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_created_total.clone()))?;

        let requests_cancelled_total = IntCounter::new(
            "heart_link_requests_cancelled_total",
            "Match requests cancelled by their owner",
        )?;
        registry.register(Box::new(requests_cancelled_total.clone()))?;

        let cancels_rejected_total = IntCounter::new(
            "heart_link_cancels_rejected_total",
            "Cancel calls with nothing pending",
        )?;
        registry.register(Box::new(cancels_rejected_total.clone()))?;

        let requests_by_status = IntGaugeVec::new(
            Opts::new("heart_link_requests", "Match requests by status"),
            &["status"],
        )?;
        registry.register(Box::new(requests_by_status.clone()))?;

        let active_sessions =
            IntGauge::new("heart_link_active_sessions", "Sessions currently active")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let match_rate = Gauge::new(
            "heart_link_match_rate_percent",
            "Share of all requests that are matched",
        )?;
        registry.register(Box::new(match_rate.clone()))?;

        Ok(Self {
            requests_created_total,
            requests_cancelled_total,
            cancels_rejected_total,
            requests_by_status,
            active_sessions,
            match_rate,
        })
    }
}

impl PairingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_total =
            IntCounter::new("heart_link_matches_total", "Pairings committed")?;
        registry.register(Box::new(matches_total.clone()))?;

        let races_lost_total = IntCounter::new(
            "heart_link_races_lost_total",
            "Claims or commits lost to a concurrent attempt",
        )?;
        registry.register(Box::new(races_lost_total.clone()))?;

        let commit_conflicts_total = IntCounterVec::new(
            Opts::new(
                "heart_link_commit_conflicts_total",
                "Pairing commit failures by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(commit_conflicts_total.clone()))?;

        let activity_feed_errors_total = IntCounter::new(
            "heart_link_activity_feed_errors_total",
            "Activity feed lookups that failed",
        )?;
        registry.register(Box::new(activity_feed_errors_total.clone()))?;

        let candidates_examined = Histogram::with_opts(
            HistogramOpts::new(
                "heart_link_candidates_examined",
                "Candidates examined per matcher attempt",
            )
            .buckets(vec![0.0, 1.0, 2.0, 3.0, 5.0, 10.0, 25.0, 50.0]),
        )?;
        registry.register(Box::new(candidates_examined.clone()))?;

        Ok(Self {
            matches_total,
            races_lost_total,
            commit_conflicts_total,
            activity_feed_errors_total,
            candidates_examined,
        })
    }
}

impl ExpiryMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_expired_total = IntCounterVec::new(
            Opts::new(
                "heart_link_requests_expired_total",
                "Match requests expired by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(requests_expired_total.clone()))?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("heart_link_sessions_ended_total", "Sessions ended by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        let sweep_failures_total = IntCounter::new(
            "heart_link_sweep_failures_total",
            "Reaper items skipped because of an error",
        )?;
        registry.register(Box::new(sweep_failures_total.clone()))?;

        Ok(Self {
            requests_expired_total,
            sessions_ended_total,
            sweep_failures_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let attempt_duration = Histogram::with_opts(
            HistogramOpts::new(
                "heart_link_attempt_duration_seconds",
                "Matcher attempt duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(attempt_duration.clone()))?;

        let create_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "heart_link_create_request_duration_seconds",
                "create_request duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(create_request_duration.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "heart_link_sweep_duration_seconds",
                "Expiry reaper pass duration",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            attempt_duration,
            create_request_duration,
            sweep_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
