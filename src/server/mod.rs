//! HTTP front end: the LFS Batch, transfer and locking APIs plus CI artifact
//! uploads, served with axum.
//!
//! - `POST /{owner}/{repo}/info/lfs/objects/batch`
//! - `GET /{owner}/{repo}/info/lfs/objects/{oid}[/{name}]`
//! - `PUT /{owner}/{repo}/info/lfs/objects/{oid}/{size}`
//! - `POST /{owner}/{repo}/info/lfs/verify`
//! - `GET|POST /{owner}/{repo}/info/lfs/locks`, `POST …/locks/verify`,
//!   `POST …/locks/{id}/unlock`
//! - `PUT|POST|GET /api/actions/artifacts/{run}/{artifact}/{upload|finalize|download}`
//!
//! Storage work runs on the blocking pool; bodies are streamed, never
//! buffered whole.

mod artifacts;
mod auth;
mod batch;
mod body;
mod error;
mod locks;
mod objects;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use artifacts::{FinalizeRequest, FinalizeResponse};
pub use auth::credentials;
pub use error::ApiError;

use crate::artifacts::ArtifactStore;
use crate::batch::MEDIA_TYPE;
use crate::service::LfsService;

/// Shared state of all handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub service: Arc<LfsService>,
    pub artifacts: Option<ArtifactStore>,
    pub artifacts_serve_direct: bool,
}

/// Configuration for creating an [`LfsServer`].
pub struct LfsServerConfig {
    pub service: LfsService,
    /// CI artifact storage; the artifact routes answer 404 without it.
    pub artifacts: Option<ArtifactStore>,
    /// Redirect artifact downloads to backend URLs where possible.
    pub artifacts_serve_direct: bool,
}

pub struct LfsServer {
    router: Router,
}

impl LfsServer {
    pub fn new(config: LfsServerConfig) -> Self {
        let state = AppState {
            service: Arc::new(config.service),
            artifacts: config.artifacts,
            artifacts_serve_direct: config.artifacts_serve_direct,
        };
        LfsServer {
            router: Self::build_router(state),
        }
    }

    fn build_router(state: AppState) -> Router {
        let lfs = Router::new()
            .route("/{owner}/{repo}/info/lfs/objects/batch", post(batch::batch))
            .route("/{owner}/{repo}/info/lfs/objects/{oid}", get(objects::download))
            .route(
                "/{owner}/{repo}/info/lfs/objects/{oid}/{extra}",
                get(objects::download_named).put(objects::upload),
            )
            .route("/{owner}/{repo}/info/lfs/verify", post(objects::verify))
            .route(
                "/{owner}/{repo}/info/lfs/locks",
                get(locks::list).post(locks::create),
            )
            .route("/{owner}/{repo}/info/lfs/locks/verify", post(locks::verify))
            .route(
                "/{owner}/{repo}/info/lfs/locks/{id}/unlock",
                post(locks::unlock),
            );

        let artifacts = Router::new()
            .route(
                "/api/actions/artifacts/{run}/{artifact}/upload",
                put(artifacts::upload),
            )
            .route(
                "/api/actions/artifacts/{run}/{artifact}/finalize",
                post(artifacts::finalize),
            )
            .route(
                "/api/actions/artifacts/{run}/{artifact}/download",
                get(artifacts::download),
            );

        Router::new()
            .merge(lfs)
            .merge(artifacts)
            .with_state(state)
    }

    /// Return the inner [`Router`] (useful for testing with `tower::ServiceExt`).
    pub fn into_router(self) -> Router {
        self.router
    }

    pub async fn serve(self, addr: &str) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "LFS server listening");
        axum::serve(listener, self.router).await
    }

    /// Serve until `shutdown` completes, then wait for in-flight requests.
    pub async fn serve_with_shutdown(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "LFS server listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// A JSON response with the LFS media type.
pub(crate) fn lfs_json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => (status, [(header::CONTENT_TYPE, MEDIA_TYPE)], body).into_response(),
        Err(e) => ApiError::from(crate::Error::from(e)).into_response(),
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}
