use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Response, StatusCode};

use super::auth::{require_lfs_accept, Auth};
use super::body::blocking;
use super::error::ApiError;
use super::{lfs_json, parse_json, AppState};
use crate::batch::{BatchRequest, Operation};
use crate::token::Scope;

/// `POST …/objects/batch`
pub(crate) async fn batch(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;
    let request: BatchRequest = parse_json(&body)?;
    let scope = match request.operation {
        Operation::Download => Scope::Download,
        Operation::Upload => Scope::Upload,
    };

    let service = state.service.clone();
    let response = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, scope)?;
        tracing::debug!(
            repo = %access.repo.full_name(),
            operation = ?request.operation,
            objects = request.objects.len(),
            "batch request"
        );
        let items = service.negotiate(&access, request.operation, &request.objects)?;
        service.batch_response(&access, request.operation, items)
    })
    .await?;
    Ok(lfs_json(StatusCode::OK, &response))
}
