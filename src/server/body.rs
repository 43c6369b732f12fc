//! Bridges between async HTTP bodies and the blocking storage layer.

use std::io::{self, Read};

use axum::body::Body;
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

use super::error::ApiError;
use crate::content_store::Cancellable;

/// Size of the pipe between a blocking reader and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Run storage work on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

/// A blocking reader over a request body. Must be created on the runtime.
///
/// Reads fail once `token` is cancelled.
pub fn request_reader(body: Body, token: CancellationToken) -> impl Read + Send + 'static {
    let stream = body.into_data_stream().map_err(io::Error::other);
    Cancellable::new(SyncIoBridge::new(StreamReader::new(stream)), token)
}

/// A response body fed from a blocking reader through a bounded pipe.
pub fn response_body<R: Read + Send + 'static>(mut reader: R) -> Body {
    let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let mut writer = SyncIoBridge::new(tx);
    tokio::task::spawn_blocking(move || {
        let result = io::copy(&mut reader, &mut writer).and_then(|_| writer.shutdown());
        if let Err(e) = result {
            // The client going away shows up as a broken pipe.
            tracing::debug!(error = %e, "response body ended early");
        }
    });
    Body::from_stream(ReaderStream::new(rx))
}
