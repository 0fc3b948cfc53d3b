// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Extension, Router};
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;

use crate::runtime::{Handle, JoinHandle};

pub const METRICS_ROUTE: &str = "/metrics";

/// Serves the registry at `/metrics` until the returned task is aborted.
pub fn start_prometheus_server(
    address: SocketAddr,
    registry: &Registry,
) -> JoinHandle<Result<(), std::io::Error>> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .layer(Extension(registry.clone()));

    tracing::info!("Metrics endpoint for the merger on {address}{METRICS_ROUTE}");
    Handle::current().spawn(async move {
        let listener = TcpListener::bind(&address).await?;
        axum::serve(listener, app).await
    })
}

async fn metrics(registry: Extension<Registry>) -> (StatusCode, String) {
    match TextEncoder.encode_to_string(&registry.gather()) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unable to encode metrics: {error}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Metrics, BLOCKS_RECEIVED_TOTAL};

    #[tokio::test]
    async fn handler_renders_registered_metrics() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        metrics.blocks_received_total.inc_by(4);
        let (status, body) = super::metrics(Extension(registry)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&format!("{BLOCKS_RECEIVED_TOTAL} 4")));
    }
}
