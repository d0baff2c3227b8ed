//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - RPC endpoint health per chain
//! - Indexer polls and their failure rate per medium
//! - Hop fulfillment latency
//! - Session lifecycle and recovery outcomes

use crate::coordination::topology::Medium;
use crate::error::{ReconcilerError, ReconcilerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "pivot_reconciler_chain_connected",
        "RPC health per chain (1=healthy, 0=unreachable)",
        &["chain_id"]
    ).unwrap();

    // Poll metrics
    pub static ref POLLS: CounterVec = register_counter_vec!(
        "pivot_reconciler_polls_total",
        "Indexer polls issued by hop pollers",
        &["medium"]
    ).unwrap();

    pub static ref POLL_FAILURES: CounterVec = register_counter_vec!(
        "pivot_reconciler_poll_failures_total",
        "Indexer polls that failed and were retried on schedule",
        &["medium"]
    ).unwrap();

    pub static ref HOPS_FULFILLED: CounterVec = register_counter_vec!(
        "pivot_reconciler_hops_fulfilled_total",
        "Hops observed as fulfilled",
        &["medium"]
    ).unwrap();

    pub static ref HOP_LATENCY: HistogramVec = register_histogram_vec!(
        "pivot_reconciler_hop_latency_seconds",
        "Time from a hop turning pending to its fulfillment",
        &["medium"],
        vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]
    ).unwrap();

    // Session metrics
    pub static ref SESSIONS_STARTED: CounterVec = register_counter_vec!(
        "pivot_reconciler_sessions_started_total",
        "Sessions started by operation kind",
        &["kind"]
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: Gauge = register_gauge!(
        "pivot_reconciler_active_sessions",
        "Sessions neither complete nor stopped"
    ).unwrap();

    pub static ref RECOVERIES: CounterVec = register_counter_vec!(
        "pivot_reconciler_recoveries_total",
        "Recovery attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref REFRESHES: CounterVec = register_counter_vec!(
        "pivot_reconciler_refreshes_total",
        "Refresh notifications delivered to callers",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ReconcilerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ReconcilerError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ReconcilerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_poll(medium: Medium) {
    POLLS.with_label_values(&[medium.as_str()]).inc();
}

pub fn record_poll_failure(medium: Medium) {
    POLL_FAILURES.with_label_values(&[medium.as_str()]).inc();
}

pub fn record_hop_fulfilled(medium: Medium, latency: Duration) {
    HOPS_FULFILLED.with_label_values(&[medium.as_str()]).inc();
    HOP_LATENCY
        .with_label_values(&[medium.as_str()])
        .observe(latency.as_secs_f64());
}

pub fn record_session_started(kind: &str) {
    SESSIONS_STARTED.with_label_values(&[kind]).inc();
}

pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as f64);
}

pub fn record_recovery(outcome: &str) {
    RECOVERIES.with_label_values(&[outcome]).inc();
}

pub fn record_refresh() {
    REFRESHES.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_counters_by_medium() {
        let before = POLL_FAILURES
            .with_label_values(&[Medium::MessageBridge.as_str()])
            .get();
        record_poll_failure(Medium::MessageBridge);
        let after = POLL_FAILURES
            .with_label_values(&[Medium::MessageBridge.as_str()])
            .get();
        assert!(after >= before + 1.0);
    }

    #[tokio::test]
    async fn test_metrics_handler_encodes() {
        record_recovery("recovered");
        let body = metrics_handler().await.unwrap();
        assert!(body.contains("pivot_reconciler_recoveries_total"));
    }
}
