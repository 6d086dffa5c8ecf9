//! HTTP surface over the orchestrator.

pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ServeState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: ServeState, addr: SocketAddr) -> EngineResult<()> {
    let app = router::router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| EngineError::internal(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "http server listening");
    axum::serve(listener, app)
        .await
        .map_err(|err| EngineError::internal(format!("server error: {err}")))
}
