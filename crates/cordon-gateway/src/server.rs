use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::Gateway;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// Build the gateway router: a single JSON-RPC endpoint with bearer auth.
pub fn router(gateway: Arc<Gateway>) -> Router {
  Router::new()
    .route("/rpc", post(handle_rpc))
    .with_state(gateway)
}

/// Serve the gateway until the token is cancelled.
pub async fn serve(
  gateway: Arc<Gateway>,
  addr: SocketAddr,
  cancel: CancellationToken,
) -> std::io::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  info!(%addr, "tool gateway listening");

  axum::serve(listener, router(gateway))
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
}

async fn handle_rpc(
  State(gateway): State<Arc<Gateway>>,
  headers: HeaderMap,
  Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
  let bearer = headers
    .get("authorization")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "));

  Json(gateway.handle(bearer, request).await)
}
