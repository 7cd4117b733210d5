use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "appstats";

/// Prometheus metrics for the service, all under the "appstats" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events accepted by the report endpoint.
    pub events_reported: Counter,
    /// Events rejected before reaching the store, by reason.
    pub events_rejected: CounterVec,
    /// Users seen for the first time.
    pub new_users: Counter,
    /// Series requests by granularity.
    pub series_requests: CounterVec,
    /// Breakdown requests by dimension.
    pub breakdown_requests: CounterVec,
    /// Failed store queries by query name.
    pub store_query_errors: CounterVec,
    /// Store query duration by query name.
    pub store_query_duration: HistogramVec,
    /// Time spent assembling and reaggregating a series.
    pub series_build_duration: Histogram,
    /// Store connection state by backend (1=connected, 0=disconnected).
    pub store_connected: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new instance with every metric registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_reported = Counter::with_opts(
            Opts::new("events_reported_total", "Total events accepted for ingestion.")
                .namespace(NAMESPACE),
        )?;
        let events_rejected = CounterVec::new(
            Opts::new(
                "events_rejected_total",
                "Total event reports rejected by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let new_users = Counter::with_opts(
            Opts::new("new_users_total", "Total users seen for the first time.")
                .namespace(NAMESPACE),
        )?;
        let series_requests = CounterVec::new(
            Opts::new(
                "series_requests_total",
                "Total usage series requests by granularity.",
            )
            .namespace(NAMESPACE),
            &["granularity"],
        )?;
        let breakdown_requests = CounterVec::new(
            Opts::new(
                "breakdown_requests_total",
                "Total top-N breakdown requests by dimension.",
            )
            .namespace(NAMESPACE),
            &["dimension"],
        )?;
        let store_query_errors = CounterVec::new(
            Opts::new(
                "store_query_errors_total",
                "Total failed event store queries by query.",
            )
            .namespace(NAMESPACE),
            &["query"],
        )?;
        let store_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_query_duration_seconds",
                "Event store query duration by query.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["query"],
        )?;
        let series_build_duration = Histogram::with_opts(
            HistogramOpts::new(
                "series_build_duration_seconds",
                "Time to assemble and reaggregate a usage series.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01]),
        )?;
        let store_connected = GaugeVec::new(
            Opts::new(
                "store_connected",
                "Whether the event store is reachable (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )?;

        registry.register(Box::new(events_reported.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(new_users.clone()))?;
        registry.register(Box::new(series_requests.clone()))?;
        registry.register(Box::new(breakdown_requests.clone()))?;
        registry.register(Box::new(store_query_errors.clone()))?;
        registry.register(Box::new(store_query_duration.clone()))?;
        registry.register(Box::new(series_build_duration.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_reported,
            events_rejected,
            new_users,
            series_requests,
            breakdown_requests,
            store_query_errors,
            store_query_duration,
            series_build_duration,
            store_connected,
        })
    }

    /// Router serving /metrics and /healthz.
    pub fn router(&self) -> Router {
        let state = Arc::new(HealthState {
            registry: self.registry.clone(),
        });

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state)
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the metrics server in the background.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = bind_address(addr);

        let app = self.router();

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand into an all-interfaces bind address.
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

struct HealthState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_address("127.0.0.1:9191"), "127.0.0.1:9191");
    }

    #[test]
    fn test_render_includes_namespace() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.events_reported.inc();
        metrics.series_requests.with_label_values(&["week"]).inc();

        let text = metrics.render().expect("render");
        assert!(text.contains("appstats_events_reported_total 1"));
        assert!(text.contains("appstats_series_requests_total{granularity=\"week\"} 1"));
    }

    #[tokio::test]
    async fn test_router_serves_health_and_metrics() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.new_users.inc_by(3.0);

        let resp = metrics
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = metrics
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("appstats_new_users_total 3"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.start().await.expect("start");
        metrics.stop().await.expect("stop");
        // Stopping twice is a no-op.
        metrics.stop().await.expect("stop again");
    }
}
