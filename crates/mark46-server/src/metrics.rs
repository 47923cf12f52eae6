use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness flag shared between the signaling server and the `/ready`
/// probe. Cloning hands out another handle to the same flag.
#[derive(Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    /// Creates a flag that starts out ready.
    #[must_use]
    pub fn ready() -> Self {
        let flag = Self::default();
        flag.set(true);
        flag
    }

    /// Updates the flag.
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Relaxed);
    }

    /// Reads the flag.
    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr` until the process
/// exits. `/ready` flips to 503 once the flag is cleared during shutdown.
///
/// # Errors
///
/// Fails when the Prometheus recorder cannot be installed or the listener
/// cannot bind.
pub async fn serve(addr: SocketAddr, ready: ReadyFlag) -> anyhow::Result<()> {
    let recorder = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let recorder = recorder.clone();
                async move { recorder.render() }
            }),
        )
        .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
        .route(
            "/ready",
            get(move || {
                let ready = ready.clone();
                async move { ready_response(ready.get()) }
            }),
        );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn ready_response(ready: bool) -> (StatusCode, Json<Value>) {
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"ready": ready})))
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("mark46_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("mark46_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake attempt with the given status label.
    pub fn handshakes_total(status: &'static str) {
        metrics::counter!("mark46_handshakes_total", "status" => status).increment(1);
    }

    /// Record an authentication outcome with the given status label.
    pub fn auth_total(status: &'static str) {
        metrics::counter!("mark46_auth_total", "status" => status).increment(1);
    }

    /// Record a signal crossing the server in the given direction.
    pub fn signals_total(direction: &'static str) {
        metrics::counter!("mark46_signals_total", "direction" => direction).increment(1);
    }

    /// Increment the broadcast counter.
    pub fn broadcasts_total() {
        metrics::counter!("mark46_broadcasts_total").increment(1);
    }

    /// Record a disconnect with its close code.
    pub fn disconnects_total(code: u16) {
        metrics::counter!("mark46_disconnects_total", "code" => code.to_string()).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a signal dispatch latency observation in seconds.
    pub fn dispatch_seconds(value: f64) {
        metrics::histogram!("mark46_dispatch_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_flag_round_trips() {
        let flag = ReadyFlag::ready();
        assert!(flag.get());
        flag.set(false);
        assert!(!flag.get());

        // Clones observe the same flag.
        let other = flag.clone();
        other.set(true);
        assert!(flag.get());
    }

    #[test]
    fn default_flag_starts_not_ready() {
        assert!(!ReadyFlag::default().get());
    }

    #[test]
    fn ready_response_status_tracks_flag() {
        assert_eq!(ready_response(true).0, StatusCode::OK);
        assert_eq!(ready_response(false).0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
