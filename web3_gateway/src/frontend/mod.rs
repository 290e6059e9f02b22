//! HTTP ingress: routing, response headers, and the metrics endpoint.

pub mod http_proxy;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Extension, Router};
use http::{header, HeaderValue, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;

use crate::app::Web3Gateway;

pub fn router(gateway: Arc<Web3Gateway>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/rpc/:chain", post(http_proxy::proxy_rpc))
        .route("/:chain", post(http_proxy::proxy_chain))
        .route("/:apikey/:chain", post(http_proxy::proxy_keyed))
        .layer(Extension(gateway))
        .layer(TraceLayer::new_for_http())
}

async fn metrics() -> axum::response::Response {
    let metric_families = prometheus::gather();

    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return axum::response::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(axum::body::boxed(axum::body::Empty::new()))
            .expect("static response builds");
    }

    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )
        .body(axum::body::boxed(axum::body::Full::from(buffer)))
        .expect("static response builds")
}
