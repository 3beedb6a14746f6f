//! HTTP exposition of the prometheus registry.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub(crate) fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(String::from_utf8(buffer)?)
}

async fn metrics_handler(State(registry): State<Registry>) -> Response<Body> {
    match encode_registry(&registry) {
        Ok(text) => {
            let mut response = Response::new(Body::from(text));
            if let Ok(value) = TextEncoder::new().format_type().parse::<HeaderValue>() {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "metrics scrape failed");
            let mut response = Response::new(Body::from(e.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Running exposition endpoint
pub(crate) struct MetricsServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    pub(crate) async fn bind(listen_addr: SocketAddr, path: &str, registry: Registry) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {}", listen_addr))?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .route(path, get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(registry);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "metrics server failed");
            }
        });

        info!("metrics endpoint listening on http://{}{}", addr, path);
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "metrics server task panicked");
        }
        info!(addr = %self.addr, "metrics endpoint stopped");
    }
}
