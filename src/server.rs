//! # Metrics Server
//!
//! An `axum`-based web server exposing the collected metrics to a
//! Prometheus scraper, plus a small index page.
//!
//! A scrape is more than a render: the persistent (log-derived) families
//! are gathered as-is, but the queue snapshot families are produced right
//! here, by connecting to each instance's showq socket and parsing one
//! fresh listing per request. Each socket connection serves exactly one
//! scrape and is closed afterwards.
//!
//! The server is designed for graceful shutdown, listening to a signal from
//! the main application to stop serving requests and terminate cleanly.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use log::{debug, error, warn};
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::registry::LogMetrics;
use crate::showq;

/// Everything a scrape needs: the persistent registry, the `up` gauge, and
/// where to find each instance's showq socket.
pub struct ScrapeContext {
    pub registry: Registry,
    pub metrics: Arc<LogMetrics>,
    pub instances: Vec<String>,
    pub spool_directory: PathBuf,
    pub telemetry_path: String,
}

/// A server that exposes metrics to a Prometheus scraper.
pub struct MetricsServer {
    listener: TcpListener,
    context: Arc<ScrapeContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    /// Creates a new `MetricsServer` but does not spawn it.
    ///
    /// # Arguments
    ///
    /// * `listener` - A `TcpListener` that has already been bound to an address.
    /// * `context` - The scrape context shared with the handler.
    /// * `shutdown_rx` - A watch channel receiver for graceful shutdown.
    pub fn new(
        listener: TcpListener,
        context: Arc<ScrapeContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            context,
            shutdown_rx,
        }
    }

    /// Returns a future that runs the server until a shutdown signal is
    /// received.
    pub fn run(mut self) -> impl Future<Output = ()> {
        let app = Router::new()
            .route(&self.context.telemetry_path, get(serve_metrics))
            .route("/", get(index))
            .with_state(self.context.clone());

        async move {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    debug!("metrics server received shutdown signal");
                }
                result = axum::serve(self.listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        error!("metrics server error: {}", e);
                    }
                }
            }
            debug!("metrics server task finished");
        }
    }
}

async fn serve_metrics(State(ctx): State<Arc<ScrapeContext>>) -> Response {
    // Collect the queue snapshots first so this scrape's `up` values are
    // part of the gathered output.
    let mut snapshot_families = Vec::new();
    for instance in &ctx.instances {
        let socket = showq::socket_path(&ctx.spool_directory, instance);
        let socket_label = socket.display().to_string();
        let up = ctx.metrics.up.with_label_values(&[instance, &socket_label]);
        match showq::collect_from_socket(&ctx.spool_directory, instance).await {
            Ok(families) => {
                up.set(1.0);
                snapshot_families.extend(families);
            }
            Err(err) => {
                warn!("failed to scrape showq for instance {}: {}", instance, err);
                up.set(0.0);
            }
        }
    }

    let mut families = ctx.registry.gather();
    families.extend(snapshot_families);

    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buffer) {
        error!("failed to encode metrics: {}", err);
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

async fn index(State(ctx): State<Arc<ScrapeContext>>) -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html>\n<head>\n\t<meta charset=\"UTF-8\">\n\t\
         <title>Postwatch</title>\n</head>\n<body>\n\t<h1>Postwatch</h1>\n\t\
         <p><a href=\"{}\">Metrics</a></p>\n</body>\n</html>\n",
        ctx.telemetry_path
    ))
}
