//! Admin HTTP API for inspecting and toggling the cache at runtime.
//!
//! # Routes
//! - `GET /admin/status`: version, store backend, live connections
//! - `GET /admin/cache`: both cache toggles
//! - `GET|PUT|DELETE /admin/cache/{flag}`: read, set or clear one toggle
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::cache::CacheFlags;
use crate::lifecycle::shutdown;
use crate::net::ConnectionTracker;

/// Shared state behind the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub flags: CacheFlags,
    pub api_key: Arc<str>,
    pub store_name: &'static str,
    pub connections: ConnectionTracker,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/cache", get(get_cache))
        .route("/admin/cache/{flag}", get(get_flag).put(set_flag).delete(clear_flag))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(addr: SocketAddr, state: AdminState, shutdown_rx: broadcast::Receiver<()>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown::wait(shutdown_rx))
        .await
}
