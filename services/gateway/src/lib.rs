//! The HTTP/WebSocket gateway: wires the Device Session Layer, File Transfer
//! Engine, Event Bus, LSP Proxy and Package Install crates behind one
//! `axum` router shared by both the `gateway` and `tool-channel` binaries.

pub mod config;
pub mod error;
pub mod http;
pub mod shutdown;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Assemble the full REST + WebSocket surface described in SPEC_FULL.md §6.
/// CORS is permissive on every route, matching the spec's "every response
/// carries permissive CORS headers" requirement.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(http::health::healthz))
        .route("/readyz", get(http::health::readyz))
        .route("/api/ports", get(http::devices::list_ports))
        .route("/api/logs", get(http::health::logs))
        .route("/api/devices", get(http::devices::list_devices))
        .route(
            "/api/devices/:port",
            get(http::devices::get_device).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/connect",
            post(http::devices::connect).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/disconnect",
            post(http::devices::disconnect).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/reset",
            post(http::devices::reset).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/interrupt",
            post(http::devices::interrupt).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/repl",
            post(http::devices::repl).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/files",
            get(http::files::list).delete(http::files::delete).options(http::options_ok),
        )
        .route("/api/devices/:port/files/read", get(http::files::read))
        .route(
            "/api/devices/:port/files/write",
            post(http::files::write).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/files/mkdir",
            post(http::files::mkdir).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/sync/compare",
            post(http::sync::compare).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/sync/upload",
            post(http::sync::upload).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/packages/install",
            post(http::packages::install).options(http::options_ok),
        )
        .route(
            "/api/devices/:port/packages/uninstall",
            post(http::packages::uninstall).options(http::options_ok),
        )
        .route("/api/lsp/status", get(http::lsp::status))
        .route("/api/lsp/initialize", post(http::lsp::initialize))
        .route("/api/lsp/completion", post(http::lsp::completion))
        .route("/api/lsp/hover", post(http::lsp::hover))
        .route("/api/lsp/definition", post(http::lsp::definition))
        .route("/api/lsp/signature", post(http::lsp::signature))
        .route("/api/lsp/didOpen", post(http::lsp::did_open))
        .route("/api/lsp/didChange", post(http::lsp::did_change))
        .route("/api/lsp/didClose", post(http::lsp::did_close))
        .route("/api/lsp/shutdown", post(http::lsp::shutdown))
        .route(
            "/api/config",
            get(http::settings::get).put(http::settings::put),
        )
        .route("/ws", get(ws::upgrade))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn fallback() -> (StatusCode, axum::Json<repl_proto::ApiErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        axum::Json(repl_proto::ApiErrorBody::new("no such route")),
    )
}
