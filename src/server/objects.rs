//! Object transfer and verification endpoints.

use std::io::Read;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use super::auth::{require_lfs_accept, Auth};
use super::body::{blocking, request_reader, response_body};
use super::error::ApiError;
use super::{lfs_json, parse_json, AppState};
use crate::range::{ByteRange, ContentRange};
use crate::service::{Credentials, Download, UploadStatus};
use crate::storage::content_disposition;
use crate::token::Scope;
use crate::{Error, Pointer};

/// `GET …/objects/{oid}`
pub(crate) async fn download(
    State(state): State<AppState>,
    Path((owner, repo, oid)): Path<(String, String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    serve_object(state, owner, repo, oid, None, credentials, &headers).await
}

/// `GET …/objects/{oid}/{name}` where `name` is the base64url file name to
/// suggest to the client.
pub(crate) async fn download_named(
    State(state): State<AppState>,
    Path((owner, repo, oid, name)): Path<(String, String, String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let name = URL_SAFE_NO_PAD
        .decode(name.trim_end_matches('='))
        .ok()
        .and_then(|b| String::from_utf8(b).ok());
    serve_object(state, owner, repo, oid, name, credentials, &headers).await
}

async fn serve_object(
    state: AppState,
    owner: String,
    repo: String,
    oid: String,
    file_name: Option<String>,
    credentials: Credentials,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    let service = state.service.clone();
    let Download {
        pointer,
        object,
        from,
        to,
        partial,
    } = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Download)?;
        service.download(&access, &oid, range)
    })
    .await?;

    let len = (to - from + 1).max(0);
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes");
    if partial {
        builder = builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", from, to, pointer.size),
        );
    }
    if let Some(value) = file_name
        .as_deref()
        .and_then(|name| HeaderValue::from_str(&content_disposition(name)).ok())
    {
        builder = builder.header(header::CONTENT_DISPOSITION, value);
    }
    tracing::debug!(oid = %pointer.oid, from, to, "serving object");
    builder
        .body(response_body(object.take(len as u64)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// `PUT …/objects/{oid}/{size}`, optionally one chunk of a resumable upload.
pub(crate) async fn upload(
    State(state): State<AppState>,
    Path((owner, repo, oid, size)): Path<(String, String, String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    let size: i64 = size
        .parse()
        .map_err(|_| Error::InvalidPointer(format!("size {:?}", size)))?;
    let range = match headers.get(header::CONTENT_RANGE) {
        Some(value) => Some(ContentRange::parse(
            value
                .to_str()
                .map_err(|_| Error::InvalidRange("non-ASCII Content-Range".into()))?,
        )?),
        None => None,
    };

    // Dropping the handler cancels the copy.
    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let mut reader = request_reader(body, token);
    let pointer = Pointer::new(oid, size);

    let service = state.service.clone();
    let status = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Upload)?;
        service.upload(&access, &pointer, &mut reader, range.as_ref())
    })
    .await?;

    Ok(match status {
        UploadStatus::Stored => StatusCode::OK.into_response(),
        UploadStatus::Partial { received } => lfs_json(
            StatusCode::ACCEPTED,
            &serde_json::json!({ "received": received }),
        ),
    })
}

/// `POST …/verify`
pub(crate) async fn verify(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;
    let pointer: Pointer = parse_json(&body)?;

    let service = state.service.clone();
    blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Verify)?;
        service.verify(&access, &pointer)
    })
    .await?;
    Ok(StatusCode::OK.into_response())
}
