//! HTTP frontend of the coordinator

use crate::Coordinator;
use crate::protocol::{Request, Response, status};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, put};
use axum::Json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Routes: `GET /` liveness probe, `PUT /transactions` RPC endpoint
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/transactions", put(transactions))
        .with_state(coordinator)
}

async fn home() -> &'static str {
    "ok"
}

async fn transactions(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> Json<Response> {
    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!("Rejected request body: {}", err);
            return Json(Response::error(
                status::UNKNOWN_ACTION,
                None,
                format!("unknown action: {}", err),
            ));
        }
    };
    Json(coordinator.handle(request).await)
}

/// Serve the coordinator on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Coordinator listening on {}", addr);
    }
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
}
