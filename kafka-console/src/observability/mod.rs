//! The optional HTTP observability interface.

use crate::http::HttpServerError;
use crate::registry::ClusterRegistry;
use crate::runner::ReloadHandle;
use anyhow::{Context, Result, anyhow};
use axum::{Router, extract::State, response::Html};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, trace};

/// Serves prometheus metrics and the registered clusters, and allows the log filter to be changed at runtime.
pub(crate) struct LogFilterHttpExporter {
    recorder_handle: PrometheusHandle,
    address: SocketAddr,
    tracing_handle: ReloadHandle,
    registry: Arc<ClusterRegistry>,
}

impl LogFilterHttpExporter {
    pub fn new(
        recorder_handle: PrometheusHandle,
        address: SocketAddr,
        tracing_handle: ReloadHandle,
        registry: Arc<ClusterRegistry>,
    ) -> Self {
        LogFilterHttpExporter {
            recorder_handle,
            address,
            tracing_handle,
            registry,
        }
    }

    pub async fn async_run(self) {
        if let Err(err) = self.async_run_inner().await {
            error!("Observability HTTP server failed: {err:?}");
        }
    }

    async fn async_run_inner(self) -> Result<()> {
        let state = AppState {
            recorder_handle: Arc::new(self.recorder_handle),
            tracing_handle: Arc::new(self.tracing_handle),
            registry: self.registry,
        };

        let app = Router::new()
            .route("/", axum::routing::get(root))
            .route("/metrics", axum::routing::get(serve_metrics))
            .route("/clusters", axum::routing::get(serve_clusters))
            .route("/filter", axum::routing::put(put_filter))
            .with_state(state);

        let address = self.address;
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind observability interface to {address}"))?;
        tracing::info!("Observability interface listening on {address}");
        axum::serve(listener, app).await.map_err(|e| anyhow!(e))
    }
}

async fn root() -> Html<&'static str> {
    Html("try /filter, /metrics or /clusters")
}

async fn serve_metrics(State(state): State<AppState>) -> Html<String> {
    Html(state.recorder_handle.render())
}

async fn serve_clusters(State(state): State<AppState>) -> String {
    render_clusters(&state.registry)
}

/// One line per registered cluster: id, key and whether its admin client is shared.
fn render_clusters(registry: &ClusterRegistry) -> String {
    registry
        .cluster_ids()
        .iter()
        .filter_map(|id| registry.get(id))
        .map(|context| {
            let admin = if context.admin().is_some() {
                "shared"
            } else {
                "per-request"
            };
            format!("{} {} {admin}\n", context.cluster_id(), context.cluster_key())
        })
        .collect()
}

async fn put_filter(
    State(state): State<AppState>,
    new_filter_string: String,
) -> Result<Html<&'static str>, HttpServerError> {
    trace!("setting filter to: {new_filter_string}");
    let new_filter = new_filter_string.parse::<tracing_subscriber::filter::EnvFilter>()?;
    state.tracing_handle.reload(new_filter)?;
    tracing::info!("filter set to: {new_filter_string}");
    Ok(Html("Filter set"))
}

#[derive(Clone)]
struct AppState {
    tracing_handle: Arc<ReloadHandle>,
    recorder_handle: Arc<PrometheusHandle>,
    registry: Arc<ClusterRegistry>,
}
