//! Request credentials and content negotiation.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::error::ApiError;
use crate::batch::MEDIA_TYPE;
use crate::service::Credentials;
use crate::Error;

/// Credentials from the `Authorization` header.
pub struct Auth(pub Credentials);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        credentials(&parts.headers).map(Auth)
    }
}

pub fn credentials(headers: &HeaderMap) -> Result<Credentials, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(Credentials::Anonymous);
    };
    let malformed = || ApiError::from(Error::Unauthorized("malformed Authorization header".into()));
    let value = value.to_str().map_err(|_| malformed())?.trim();
    let (scheme, rest) = value.split_once(' ').ok_or_else(malformed)?;

    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = STANDARD.decode(rest.trim()).map_err(|_| malformed())?;
        let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
        let (username, password) = decoded.split_once(':').ok_or_else(malformed)?;
        Ok(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    } else if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
        Ok(Credentials::Bearer(rest.trim().to_string()))
    } else {
        Err(malformed())
    }
}

/// The LFS JSON endpoints only answer clients that accept the LFS media type.
pub fn require_lfs_accept(headers: &HeaderMap) -> Result<(), ApiError> {
    let accepted = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim() == MEDIA_TYPE);
    if accepted {
        Ok(())
    } else {
        Err(ApiError::NotAcceptable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn test_credentials() {
        assert_eq!(credentials(&HeaderMap::new()).unwrap(), Credentials::Anonymous);
        let basic = format!("Basic {}", STANDARD.encode("alice:pw:x"));
        assert_eq!(
            credentials(&headers(header::AUTHORIZATION, &basic)).unwrap(),
            Credentials::Basic {
                username: "alice".into(),
                password: "pw:x".into()
            }
        );
        assert_eq!(
            credentials(&headers(header::AUTHORIZATION, "Bearer abc")).unwrap(),
            Credentials::Bearer("abc".into())
        );
        assert!(credentials(&headers(header::AUTHORIZATION, "Basic !!")).is_err());
        assert!(credentials(&headers(header::AUTHORIZATION, "Digest x")).is_err());
    }

    #[test]
    fn test_accept() {
        assert!(require_lfs_accept(&headers(header::ACCEPT, MEDIA_TYPE)).is_ok());
        assert!(require_lfs_accept(&headers(
            header::ACCEPT,
            "application/vnd.git-lfs+json; charset=utf-8"
        ))
        .is_ok());
        assert!(require_lfs_accept(&headers(header::ACCEPT, "application/json")).is_err());
        assert!(require_lfs_accept(&HeaderMap::new()).is_err());
    }
}
