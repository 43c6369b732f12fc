//! LFS File Locking API.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Response, StatusCode};

use super::auth::{require_lfs_accept, Auth};
use super::body::blocking;
use super::error::ApiError;
use super::{lfs_json, parse_json, AppState};
use crate::batch::{
    LockCreateRequest, LockJson, LockList, LockListQuery, LockResponse, LockVerifyList,
    LockVerifyRequest, UnlockRequest,
};
use crate::service::LfsService;
use crate::token::Scope;
use crate::Error;

fn page_size(service: &LfsService, requested: Option<usize>) -> usize {
    let max = service.options().locks_paging_num.max(1);
    requested.unwrap_or(max).clamp(1, max)
}

/// `POST …/locks`
pub(crate) async fn create(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;
    let request: LockCreateRequest = parse_json(&body)?;

    let service = state.service.clone();
    let created = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Upload)?;
        let backend = service.lock_backend(&access)?;
        let refname = request.reference.as_ref().map(|r| r.name.as_str());
        match backend.create(&request.path, refname) {
            Ok(lock) => Ok(Ok(lock)),
            Err(Error::LockConflict(existing)) => Ok(Err(existing)),
            Err(e) => Err(e),
        }
    })
    .await?;

    Ok(match created {
        Ok(lock) => lfs_json(
            StatusCode::CREATED,
            &LockResponse {
                lock: LockJson::from(&lock),
                message: None,
            },
        ),
        Err(existing) => lfs_json(
            StatusCode::CONFLICT,
            &LockResponse {
                lock: LockJson::from(existing.as_ref()),
                message: Some("already created lock".into()),
            },
        ),
    })
}

/// `GET …/locks`
pub(crate) async fn list(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Auth(credentials): Auth,
    Query(query): Query<LockListQuery>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;

    let service = state.service.clone();
    let list = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Download)?;
        let backend = service.lock_backend(&access)?;

        let mut locks = Vec::new();
        let mut next_cursor = None;
        if let Some(id) = query.id.as_deref().filter(|id| !id.is_empty()) {
            let id = id
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid lock id {:?}", id)))?;
            locks.extend(backend.from_id(id)?.as_ref().map(LockJson::from));
        } else if let Some(path) = query.path.as_deref().filter(|p| !p.is_empty()) {
            locks.extend(backend.from_path(path)?.as_ref().map(LockJson::from));
        } else {
            let limit = page_size(&service, query.limit);
            next_cursor = backend.range(
                query.cursor.as_deref().unwrap_or_default(),
                limit,
                &mut |lock| {
                    locks.push(LockJson::from(lock));
                    Ok(())
                },
            )?;
        }
        Ok(LockList { locks, next_cursor })
    })
    .await?;
    Ok(lfs_json(StatusCode::OK, &list))
}

/// `POST …/locks/verify`
pub(crate) async fn verify(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;
    let request: LockVerifyRequest = parse_json(&body)?;

    let service = state.service.clone();
    let list = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Upload)?;
        let backend = service.lock_backend(&access)?;
        let limit = page_size(&service, request.limit);

        let mut ours = Vec::new();
        let mut theirs = Vec::new();
        let next_cursor = backend.range(
            request.cursor.as_deref().unwrap_or_default(),
            limit,
            &mut |lock| {
                if backend.is_ours(lock) {
                    ours.push(LockJson::from(lock));
                } else {
                    theirs.push(LockJson::from(lock));
                }
                Ok(())
            },
        )?;
        Ok(LockVerifyList {
            ours,
            theirs,
            next_cursor,
        })
    })
    .await?;
    Ok(lfs_json(StatusCode::OK, &list))
}

/// `POST …/locks/{id}/unlock`
pub(crate) async fn unlock(
    State(state): State<AppState>,
    Path((owner, repo, id)): Path<(String, String, String)>,
    Auth(credentials): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    require_lfs_accept(&headers)?;
    let request: UnlockRequest = if body.is_empty() {
        UnlockRequest::default()
    } else {
        parse_json(&body)?
    };
    let id: i64 = id
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid lock id {:?}", id)))?;

    let service = state.service.clone();
    let lock = blocking(move || {
        let access = service.authorize(&owner, &repo, &credentials, Scope::Upload)?;
        service.lock_backend(&access)?.unlock(id, request.force)
    })
    .await?;
    Ok(lfs_json(
        StatusCode::OK,
        &LockResponse {
            lock: LockJson::from(&lock),
            message: None,
        },
    ))
}
