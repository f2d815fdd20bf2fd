use anyhow::Result;
use axum::Router;
use axum::routing::get;
use std::net::SocketAddr;

/// Serves `GET /healthz` for load-balancer liveness probes.
pub async fn serve(addr: impl Into<SocketAddr>) -> Result<()> {
    let addr = addr.into();

    let service = Router::new()
        .route("/healthz", get(|| async { "" }))
        .into_make_service();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, service).await?;

    Ok(())
}
