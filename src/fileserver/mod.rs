//! Sidecar file server
//!
//! Serves the mount point as static files to anonymous clients. Every
//! request except the liveness probe must carry a valid signed URL.
//!
//! Routes:
//! - `GET /livez` - liveness probe, no signature required
//! - everything else - signed-URL gate, then static files under the mount point

use std::path::Path;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::signing::UrlSigner;
use crate::Error;

/// Path of the liveness probe
pub const LIVEZ_PATH: &str = "/livez";

/// Shared state for the signed-URL gate
#[derive(Clone)]
pub struct FileServerState {
    signer: UrlSigner,
    namespace: String,
}

impl FileServerState {
    /// Validate URLs with `signer` against the key in `namespace`
    pub fn new(signer: UrlSigner, namespace: impl Into<String>) -> Self {
        Self {
            signer,
            namespace: namespace.into(),
        }
    }
}

/// Why the gate turned a request away
#[derive(Debug)]
enum Rejection {
    /// Missing, expired, or wrong signature
    NotValid,
    /// The URL, expiry, or signature could not be parsed
    Malformed(Error),
    /// The signing key could not be read
    Internal(Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Rejection::NotValid => (StatusCode::BAD_REQUEST, "invalid signed url".to_string()),
            Rejection::Malformed(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Rejection::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<Error> for Rejection {
    fn from(e: Error) -> Self {
        if e.is_client_error() {
            Rejection::Malformed(e)
        } else {
            Rejection::Internal(e)
        }
    }
}

/// Build the file server router rooted at `mount_point`
pub fn file_server_router(state: FileServerState, mount_point: impl AsRef<Path>) -> Router {
    let files = ServiceBuilder::new()
        .layer(middleware::from_fn_with_state(state, require_signed_url))
        .service(ServeDir::new(mount_point.as_ref()));

    Router::new()
        .route(LIVEZ_PATH, get(livez))
        .fallback_service(files)
        .layer(TraceLayer::new_for_http())
}

async fn livez() -> &'static str {
    "ok"
}

async fn require_signed_url(
    State(state): State<FileServerState>,
    request: Request,
    next: Next,
) -> Response {
    let url = request_url(&request);
    match state.signer.validate(&url, &state.namespace).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            debug!(path = %request.uri().path(), "rejected request without a valid signature");
            Rejection::NotValid.into_response()
        }
        Err(e) => {
            let rejection = Rejection::from(e);
            if let Rejection::Internal(e) = &rejection {
                error!(error = %e, "failed to validate signed url");
            }
            rejection.into_response()
        }
    }
}

/// The URL the client used: `http://<Host><path-and-query>`
fn request_url(request: &Request) -> String {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{}{}", host, path_and_query)
}
