//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  : Prometheus text format
//!   GET /healthz  : Liveness probe (always 200 if process is running)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tds_keys::{KeyServer, SessionStats};

#[derive(Clone)]
pub struct KeyServerMetrics {
    pub sessions: Counter,
    pub active_sessions: Gauge,
    pub keys_issued: Family<Vec<(String, String)>, Counter>,
    pub batches: Counter,
    pub rejected_batches: Counter,
    pub session_errors: Counter,
    threshold: Gauge,
    solver_runs: Gauge,
    pending_observations: Gauge,
}

impl KeyServerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            sessions: Counter::default(),
            active_sessions: Gauge::default(),
            keys_issued: Family::default(),
            batches: Counter::default(),
            rejected_batches: Counter::default(),
            session_errors: Counter::default(),
            threshold: Gauge::default(),
            solver_runs: Gauge::default(),
            pending_observations: Gauge::default(),
        };

        registry.register(
            "tds_sessions",
            "Key exchange sessions accepted",
            metrics.sessions.clone(),
        );
        registry.register(
            "tds_active_sessions",
            "Key exchange sessions currently open",
            metrics.active_sessions.clone(),
        );
        registry.register(
            "tds_keys_issued",
            "Keys issued, by popularity class",
            metrics.keys_issued.clone(),
        );
        registry.register(
            "tds_batches",
            "Key batches answered",
            metrics.batches.clone(),
        );
        registry.register(
            "tds_rejected_batches",
            "Malformed key batches that ended a session",
            metrics.rejected_batches.clone(),
        );
        registry.register(
            "tds_session_errors",
            "Sessions ended by a channel or server error",
            metrics.session_errors.clone(),
        );
        registry.register(
            "tds_popularity_threshold",
            "Current popularity threshold",
            metrics.threshold.clone(),
        );
        registry.register(
            "tds_solver_runs",
            "Completed threshold solver runs",
            metrics.solver_runs.clone(),
        );
        registry.register(
            "tds_solver_pending_observations",
            "Observations waiting for the next solver run",
            metrics.pending_observations.clone(),
        );
        metrics
    }

    fn class_labels(class: &str) -> Vec<(String, String)> {
        vec![("class".to_string(), class.to_string())]
    }

    pub fn record_session(&self, stats: &SessionStats) {
        self.batches.inc_by(stats.batches);
        self.keys_issued
            .get_or_create(&Self::class_labels("popular"))
            .inc_by(stats.popular);
        self.keys_issued
            .get_or_create(&Self::class_labels("unpopular"))
            .inc_by(stats.unpopular);
    }

    /// Refresh gauges read from the key server at scrape time.
    pub fn refresh(&self, server: &KeyServer) {
        let solver = server.solver();
        self.threshold.set(gauge_value(server.threshold()));
        self.solver_runs.set(gauge_value(solver.runs()));
        self.pending_observations
            .set(gauge_value(solver.pending() as u64));
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct MetricsState {
    pub registry: Arc<Registry>,
    pub metrics: KeyServerMetrics,
    pub server: KeyServer,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9101")
pub async fn serve(addr: String, state: MetricsState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

fn render(state: &MetricsState) -> Result<String, std::fmt::Error> {
    state.metrics.refresh(&state.server);
    let mut body = String::new();
    encode(&mut body, &state.registry)?;
    Ok(body)
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    match render(&state) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
