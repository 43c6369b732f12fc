//! CI artifact upload, finalize and download endpoints.
//!
//! Every request carries `sig` and `expires` query parameters produced by
//! [`TokenSigner::sign_artifact`](crate::token::TokenSigner::sign_artifact)
//! for the endpoint, run and artifact it targets.

use std::io::Read;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::{IntoResponse, Redirect};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::body::{blocking, request_reader, response_body};
use super::error::ApiError;
use super::{parse_json, AppState};
use crate::artifacts::{ArtifactKey, ArtifactStore};
use crate::chunks::{MergeOutcome, CHECKSUM_HEADER};
use crate::range::ContentRange;
use crate::storage::{content_disposition, UrlParams};
use crate::Error;

#[derive(Debug, Deserialize)]
pub struct Signature {
    pub sig: String,
    pub expires: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub ok: bool,
    /// Final size once merged, otherwise the contiguous prefix received.
    pub size: i64,
}

fn authorize(
    state: &AppState,
    endpoint: &str,
    run_id: i64,
    artifact_id: i64,
    signature: &Signature,
) -> Result<(ArtifactStore, ArtifactKey), ApiError> {
    let store = state
        .artifacts
        .clone()
        .ok_or_else(|| Error::NotFound("artifacts are disabled".into()))?;
    let key = ArtifactKey::new(run_id, artifact_id)?;
    state.service.tokens().verify_artifact(
        endpoint,
        run_id,
        artifact_id,
        &signature.sig,
        signature.expires,
    )?;
    Ok((store, key))
}

/// `PUT /api/actions/artifacts/{run}/{artifact}/upload`
pub(crate) async fn upload(
    State(state): State<AppState>,
    Path((run_id, artifact_id)): Path<(i64, i64)>,
    Query(signature): Query<Signature>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    let (store, key) = authorize(&state, "upload", run_id, artifact_id, &signature)?;
    let range = headers
        .get(header::CONTENT_RANGE)
        .ok_or_else(|| Error::InvalidRange("missing Content-Range".into()))?
        .to_str()
        .map_err(|_| Error::InvalidRange("non-ASCII Content-Range".into()))?;
    let range = ContentRange::parse(range)?;
    let checksum = headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let mut reader = request_reader(body, token);
    blocking(move || store.upload_chunk(key, &range, &mut reader, checksum.as_deref())).await?;
    Ok(StatusCode::OK.into_response())
}

/// `POST /api/actions/artifacts/{run}/{artifact}/finalize`
pub(crate) async fn finalize(
    State(state): State<AppState>,
    Path((run_id, artifact_id)): Path<(i64, i64)>,
    Query(signature): Query<Signature>,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    let (store, key) = authorize(&state, "finalize", run_id, artifact_id, &signature)?;
    let request: FinalizeRequest = parse_json(&body)?;

    let outcome = blocking(move || store.finalize(key, request.size)).await?;
    let (status, response) = match outcome {
        MergeOutcome::Merged { size } => (StatusCode::OK, FinalizeResponse { ok: true, size }),
        MergeOutcome::Incomplete { received } => (
            StatusCode::ACCEPTED,
            FinalizeResponse {
                ok: false,
                size: received,
            },
        ),
    };
    Ok((status, axum::Json(response)).into_response())
}

/// `GET /api/actions/artifacts/{run}/{artifact}/download`
pub(crate) async fn download(
    State(state): State<AppState>,
    Path((run_id, artifact_id)): Path<(i64, i64)>,
    Query(signature): Query<Signature>,
) -> Result<Response<Body>, ApiError> {
    let (store, key) = authorize(&state, "download", run_id, artifact_id, &signature)?;

    if state.artifacts_serve_direct {
        let params = UrlParams {
            expires_in: state.service.tokens().ttl(),
        };
        let direct = store.clone();
        match blocking(move || direct.url(key, &params)).await {
            Ok(url) => return Ok(Redirect::to(url.as_str()).into_response()),
            Err(ApiError::Lfs(Error::UrlNotSupported)) => {}
            Err(e) => tracing::warn!(run_id, artifact_id, error = %e, "direct artifact URL failed"),
        }
    }

    let (object, size) = blocking(move || {
        let object = store.open(key).map_err(|e| {
            if e.is_not_exist() {
                Error::NotFound(format!("artifact {}/{}", run_id, artifact_id))
            } else {
                e
            }
        })?;
        let size = object.stat()?.size;
        Ok((object, size))
    })
    .await?;

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, size);
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&key.file_name())) {
        response = response.header(header::CONTENT_DISPOSITION, value);
    }
    response
        .body(response_body(object.take(size.max(0) as u64)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}
