//! Local administration API.
//!
//! The agent listens on a Unix socket and answers HTTP with the virtual
//! host `v1`; any other host, path, or method is a 400. The surface is
//! deliberately small: inspect the overlay's membership view, submit and
//! inspect updates, force re-broadcasts, and read the effective
//! configuration.
//!
//! Submission statuses mirror the ingest outcomes: 200 accepted, 208
//! already present at that version, 406 older than installed, 401 bad
//! signature, 403 source copy failure, 404 missing source file, 500
//! anything else.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use updraft_core::config::AgentConfig;
use updraft_core::notification::Notification;

use crate::overlay::OverlayConn;
use crate::updates::{IngestError, UpdateManager};

/// Shared state behind the API handlers.
pub struct ApiContext {
    /// The agent's update manager.
    pub manager: Arc<UpdateManager>,
    /// The agent's overlay connection.
    pub overlay: Arc<OverlayConn>,
    /// Effective agent configuration, as served by `GET /config`.
    pub config: AgentConfig,
}

/// A local update submission: a readable source file plus its signed
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Path of the payload file on the agent host.
    pub source: PathBuf,
    /// Signed notification describing the payload.
    pub notification: Notification,
}

/// Builds the API router.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/overlay/peers", get(get_peers))
        .route("/update", get(get_updates).post(post_update))
        .route(
            "/update/{uuid}",
            get(get_update).delete(delete_update).patch(patch_update),
        )
        .route("/config", get(get_config))
        .fallback(bad_request)
        .method_not_allowed_fallback(bad_request)
        .layer(middleware::from_fn(require_v1_host))
        .with_state(ctx)
}

/// Serves the API on `listener` until `shutdown` fires.
pub async fn serve(
    ctx: Arc<ApiContext>,
    listener: tokio::net::UnixListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = router(ctx);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = server.await {
        warn!(error = %e, "api server failed");
    }
}

/// Every request must address the `v1` virtual host.
async fn require_v1_host(request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok());
    match host {
        Some("v1") => next.run(request).await,
        other => {
            debug!(host = ?other, "rejecting request with bad host");
            StatusCode::BAD_REQUEST.into_response()
        },
    }
}

async fn bad_request() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn get_peers(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.overlay.peers())
}

async fn get_updates(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.manager.list().await)
}

async fn get_update(
    State(ctx): State<Arc<ApiContext>>,
    Path(uuid): Path<String>,
) -> Response {
    match ctx.manager.view(&uuid).await {
        Some(view) => Json(view).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_update(
    State(ctx): State<Arc<ApiContext>>,
    Path(uuid): Path<String>,
) -> StatusCode {
    // Idempotent: deleting an unknown uuid is still a 200.
    let existed = ctx.manager.delete(&uuid).await;
    debug!(%uuid, existed, "delete requested");
    StatusCode::OK
}

async fn patch_update(
    State(ctx): State<Arc<ApiContext>>,
    Path(uuid): Path<String>,
) -> StatusCode {
    match ctx.manager.rebroadcast(&uuid).await {
        Some(()) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

async fn get_config(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.config.clone())
}

async fn post_update(State(ctx): State<Arc<ApiContext>>, body: bytes::Bytes) -> StatusCode {
    let request: SubmitRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed submission body");
            return StatusCode::BAD_REQUEST;
        },
    };

    let uuid = request.notification.uuid.clone();
    let version = request.notification.version;
    match ctx
        .manager
        .ingest(request.notification, Some(&request.source))
        .await
    {
        Ok(()) => {
            info!(%uuid, version, "local submission accepted");
            ctx.manager.schedule_rebroadcast(uuid, version);
            StatusCode::OK
        },
        Err(e) => {
            info!(%uuid, version, error = %e, "local submission rejected");
            submit_status(&e)
        },
    }
}

fn submit_status(error: &IngestError) -> StatusCode {
    match error {
        IngestError::AlreadyExists { .. } => StatusCode::ALREADY_REPORTED,
        IngestError::Older { .. } => StatusCode::NOT_ACCEPTABLE,
        IngestError::Verification(_) => StatusCode::UNAUTHORIZED,
        IngestError::SourceCopyFailed { .. } => StatusCode::FORBIDDEN,
        IngestError::SourceMissing(_) => StatusCode::NOT_FOUND,
        IngestError::InvalidUuid(_)
        | IngestError::InvalidName(_)
        | IngestError::Swarm(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_errors_map_onto_the_documented_statuses() {
        let already = IngestError::AlreadyExists {
            uuid: "u".into(),
            version: 1,
        };
        assert_eq!(submit_status(&already), StatusCode::ALREADY_REPORTED);

        let older = IngestError::Older {
            uuid: "u".into(),
            candidate: 1,
            current: 2,
        };
        assert_eq!(submit_status(&older), StatusCode::NOT_ACCEPTABLE);

        let missing = IngestError::SourceMissing("/tmp/x".into());
        assert_eq!(submit_status(&missing), StatusCode::NOT_FOUND);

        let copy = IngestError::SourceCopyFailed {
            dest: "/tmp/y".into(),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(submit_status(&copy), StatusCode::FORBIDDEN);
    }
}
