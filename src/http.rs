//! Read-only HTTP status endpoint
//!
//! Two paths project coordinator state as JSON:
//!
//! - `GET /status` - the server itself: timing, recording, clients
//! - `GET /source` - the managed source's status map; 404 when no source
//!
//! Handlers hold no state of their own; each request is answered from a
//! snapshot the coordinator produces on demand, so the single-writer rule
//! holds here too.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tower_http::cors::CorsLayer;

use crate::coordinator::Event;

type Events = mpsc::UnboundedSender<Event>;

/// Build the status router.
pub fn router(events: Events) -> Router {
    Router::new()
        .route("/status", get(serve_status))
        .route("/source", get(serve_source_status))
        .layer(CorsLayer::permissive())
        .with_state(events)
}

/// Serve the status endpoint until cancelled.
pub async fn serve(listener: TcpListener, events: Events, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP status server listening");
    axum::serve(listener, router(events))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP status server failed")
}

/// GET /status - the server's own state.
async fn serve_status(State(events): State<Events>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if events.send(Event::StatusQuery { reply: reply_tx }).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(report) => Json(report).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// GET /source - the managed source's status map.
async fn serve_source_status(State(events): State<Events>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if events
        .send(Event::SourceStatusQuery { reply: reply_tx })
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
