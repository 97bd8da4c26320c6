//! HTTP server exposing the gitcache read-through proxy.
//!
//! Split into a library (router assembly, handlers, CGI adapter) and a thin
//! `main.rs` binary so the router can be exercised directly in integration
//! tests without spawning a subprocess.

pub mod cgi;
pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use gitcache_core::{ReleaseCache, RefreshCoordinator};

/// Shared state handed to every request handler.
pub struct AppState {
    pub store_root: std::path::PathBuf,
    pub http_client: reqwest::Client,
    pub release_cache: ReleaseCache,
    pub coordinator: RefreshCoordinator,
}

impl AppState {
    pub fn new(store_root: std::path::PathBuf, http_client: reqwest::Client) -> Self {
        Self {
            store_root,
            http_client,
            release_cache: ReleaseCache::new(),
            coordinator: RefreshCoordinator::new(),
        }
    }
}

/// Build the `reqwest::Client` the release cache uses for upstream calls,
/// honoring `HTTP_PROXY` when set, per the original spec's §6 environment
/// variable table.
pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
        if !proxy_url.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
    }
    Ok(builder.build()?)
}

/// Assemble the router described in the original spec's §6 HTTP surface
/// table: a `releases/*url` cache proxy and a `{remote}/{owner}/{repo}/*action`
/// git smart-HTTP dispatcher.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/releases/{*url}", get(handlers::releases))
        .route(
            "/{remote}/{owner}/{repo}/{*action}",
            any(handlers::repo_dispatch),
        )
        .with_state(state)
}
