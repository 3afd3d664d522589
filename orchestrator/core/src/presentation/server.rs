// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTPS listener for the REST API

use crate::infrastructure::tls::LeafPaths;
use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// In-flight requests get this long once shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve `app` over TLS until `shutdown` fires
pub async fn serve_tls(
    app: Router,
    bind: SocketAddr,
    leaf: &LeafPaths,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = RustlsConfig::from_pem_file(&leaf.cert, &leaf.key)
        .await
        .with_context(|| format!("Failed to load TLS certificate {}", leaf.cert.display()))?;

    let handle = Handle::new();
    let drain = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Draining HTTPS connections");
        drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    info!(address = %bind, "REST API listening");
    axum_server::bind_rustls(bind, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("HTTPS server on {} failed", bind))?;
    Ok(())
}
