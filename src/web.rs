//! Static HTTP server for the browser viewer page
//!
//! Serves `server.web_root` read-only. `ServeDir` handles GET/HEAD only
//! and rejects path traversal. The viewer itself lives in the web root;
//! this process only hosts it.

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::info;

/// Serve `web_root` on `bind` until `shutdown` is cancelled.
pub async fn serve(bind: SocketAddr, web_root: PathBuf, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().fallback_service(ServeDir::new(&web_root));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind web viewer port {}", bind))?;

    info!(
        "web viewer listening on http://{} (root: {})",
        bind,
        web_root.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web viewer server error")
}
