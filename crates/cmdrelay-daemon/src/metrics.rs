//! Prometheus metrics for the relay.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `cmdrelay_relay_connections_active` | Gauge | Streams currently pumping | `area` |
//! | `cmdrelay_relay_connections_total` | Counter | Relay requests by outcome | `area`, `outcome` |
//! | `cmdrelay_relay_bytes_forwarded_total` | Counter | Bytes copied downstream | `area` |
//! | `cmdrelay_session_invalidations_total` | Counter | Session invalidations | `reason` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! let metrics = registry.relay_metrics().clone();
//! metrics.connection_finished("grill", "closed_normal");
//! let output = registry.encode_text()?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::{error, info};

/// Maximum length for label values. Area labels are already bounded by
/// validation; reasons and outcomes are static.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Relay metrics.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across connection tasks.
#[derive(Clone)]
pub struct RelayMetrics {
    connections_active: GaugeVec,
    connections_total: CounterVec,
    bytes_forwarded_total: CounterVec,
    session_invalidations_total: CounterVec,
}

impl RelayMetrics {
    /// Creates relay metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let connections_active = GaugeVec::new(
            Opts::new(
                "cmdrelay_relay_connections_active",
                "Number of relay streams currently pumping",
            ),
            &["area"],
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_total = CounterVec::new(
            Opts::new(
                "cmdrelay_relay_connections_total",
                "Relay requests by terminal outcome",
            ),
            &["area", "outcome"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let bytes_forwarded_total = CounterVec::new(
            Opts::new(
                "cmdrelay_relay_bytes_forwarded_total",
                "Bytes forwarded from upstream to downstream",
            ),
            &["area"],
        )?;
        registry.register(Box::new(bytes_forwarded_total.clone()))?;

        let session_invalidations_total = CounterVec::new(
            Opts::new(
                "cmdrelay_session_invalidations_total",
                "Session invalidations by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(session_invalidations_total.clone()))?;

        Ok(Self {
            connections_active,
            connections_total,
            bytes_forwarded_total,
            session_invalidations_total,
        })
    }

    /// Creates metrics bound to a private registry. Used by tests and by
    /// callers that do not export metrics.
    #[must_use]
    pub fn unregistered() -> Self {
        // A fresh registry cannot already hold these names.
        Self::new(&Registry::new()).unwrap_or_else(|_| unreachable!("fresh registry"))
    }

    /// Marks a stream for `area` as pumping until the guard is dropped.
    #[must_use]
    pub fn stream_opened(&self, area: &str) -> ActiveStreamGuard {
        let gauge = self
            .connections_active
            .with_label_values(&[truncate_label(area)]);
        gauge.inc();
        ActiveStreamGuard { gauge }
    }

    /// Currently pumping streams for `area`.
    #[must_use]
    pub fn active_streams(&self, area: &str) -> f64 {
        self.connections_active
            .with_label_values(&[truncate_label(area)])
            .get()
    }

    /// Records the terminal outcome of one relay request.
    pub fn connection_finished(&self, area: &str, outcome: &str) {
        self.connections_total
            .with_label_values(&[truncate_label(area), truncate_label(outcome)])
            .inc();
    }

    /// Returns the number of relay requests with `outcome` for testing.
    #[must_use]
    pub fn connection_count(&self, area: &str, outcome: &str) -> f64 {
        self.connections_total
            .with_label_values(&[truncate_label(area), truncate_label(outcome)])
            .get()
    }

    /// Adds `bytes` to the forwarded counter for `area`.
    #[allow(clippy::cast_precision_loss)]
    pub fn bytes_forwarded(&self, area: &str, bytes: usize) {
        self.bytes_forwarded_total
            .with_label_values(&[truncate_label(area)])
            .inc_by(bytes as f64);
    }

    /// Returns the bytes forwarded for `area`.
    #[must_use]
    pub fn bytes_forwarded_count(&self, area: &str) -> f64 {
        self.bytes_forwarded_total
            .with_label_values(&[truncate_label(area)])
            .get()
    }

    /// Records a session invalidation.
    ///
    /// # Arguments
    ///
    /// * `reason` - Why the session was cleared (e.g., `missing_credential`,
    ///   `upstream_401`, `logout`)
    pub fn session_invalidated(&self, reason: &str) {
        self.session_invalidations_total
            .with_label_values(&[truncate_label(reason)])
            .inc();
    }

    /// Returns the invalidations recorded for `reason`.
    #[must_use]
    pub fn invalidation_count(&self, reason: &str) -> f64 {
        self.session_invalidations_total
            .with_label_values(&[truncate_label(reason)])
            .get()
    }
}

/// Decrements the active-stream gauge on drop.
pub struct ActiveStreamGuard {
    gauge: prometheus::Gauge,
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Prometheus registry together with the relay metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    relay_metrics: RelayMetrics,
}

impl MetricsRegistry {
    /// Creates a new registry with all relay metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let relay_metrics = RelayMetrics::new(&registry)?;
        Ok(Self {
            registry,
            relay_metrics,
        })
    }

    /// Returns the relay metrics.
    #[must_use]
    pub const fn relay_metrics(&self) -> &RelayMetrics {
        &self.relay_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Builds the router served on the metrics listener.
pub fn metrics_router(registry: SharedMetricsRegistry) -> Router {
    let metrics_handler = move || {
        let registry = Arc::clone(&registry);
        async move {
            match registry.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [(
                        header::CONTENT_TYPE,
                        "text/plain; version=0.0.4; charset=utf-8",
                    )],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics",
                    )
                        .into_response()
                },
            }
        }
    };

    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves [`metrics_router`] on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_metrics_server(
    registry: SharedMetricsRegistry,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "metrics server listening");
    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Truncates a label value at a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exports_all_families() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.relay_metrics();
        let guard = metrics.stream_opened("grill");
        metrics.connection_finished("grill", "closed_normal");
        metrics.bytes_forwarded("grill", 12);
        metrics.session_invalidated("logout");

        let output = registry.encode_text().unwrap();
        for family in [
            "cmdrelay_relay_connections_active",
            "cmdrelay_relay_connections_total",
            "cmdrelay_relay_bytes_forwarded_total",
            "cmdrelay_session_invalidations_total",
        ] {
            assert!(output.contains(family), "missing {family}");
        }
        drop(guard);
    }

    #[test]
    fn active_guard_decrements_on_drop() {
        let metrics = RelayMetrics::unregistered();
        let first = metrics.stream_opened("bar");
        let second = metrics.stream_opened("bar");
        assert!((metrics.active_streams("bar") - 2.0).abs() < f64::EPSILON);
        drop(first);
        drop(second);
        assert!(metrics.active_streams("bar").abs() < f64::EPSILON);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = RelayMetrics::unregistered();
        metrics.bytes_forwarded("bar", 10);
        metrics.bytes_forwarded("bar", 5);
        metrics.session_invalidated("upstream_401");
        assert!((metrics.bytes_forwarded_count("bar") - 15.0).abs() < f64::EPSILON);
        assert!((metrics.invalidation_count("upstream_401") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        RelayMetrics::new(&registry).unwrap();
        assert!(matches!(
            RelayMetrics::new(&registry),
            Err(MetricsError::RegistrationFailed(_))
        ));
    }

    #[test]
    fn truncate_label_is_utf8_safe() {
        let long = "é".repeat(MAX_LABEL_VALUE_LEN);
        let truncated = truncate_label(&long);
        assert!(truncated.len() <= MAX_LABEL_VALUE_LEN);
        assert!(truncate_label("grill") == "grill");
    }
}
