//! Blob reads

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use storage::StorageError;
use tokio::io::AsyncReadExt as _;
use tokio_util::io::ReaderStream;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::pull_through::{BlobSource, PullThrough};
use crate::upstream::DOCKER_CONTENT_DIGEST;

/// A `Range` request resolved against a blob of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    /// Serve everything.
    Full,

    /// Serve `start..=end`.
    Partial(u64, u64),

    /// Nothing of the blob lies in the range.
    Unsatisfiable,
}

/// Resolve a single `bytes=` range. Anything else, including multiple ranges, is served in full.
fn span(range: Option<&str>, total: u64) -> Span {
    let Some(spec) = range.and_then(|value| value.trim().strip_prefix("bytes=")) else {
        return Span::Full;
    };
    if spec.contains(',') {
        return Span::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Span::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // A suffix: the last `end` bytes.
        return match end.parse::<u64>() {
            Ok(0) => Span::Unsatisfiable,
            Ok(_) if total == 0 => Span::Unsatisfiable,
            Ok(suffix) => Span::Partial(total.saturating_sub(suffix), total - 1),
            Err(_) => Span::Full,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return Span::Full;
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) if end < start => return Span::Full,
            Ok(end) => Some(end),
            Err(_) => return Span::Full,
        }
    };

    if start >= total {
        return Span::Unsatisfiable;
    }
    Span::Partial(start, end.map_or(total - 1, |end| end.min(total - 1)))
}

fn blob_headers(response: &mut Response, digest: &Digest, length: u64) -> RegistryResult<()> {
    let value = HeaderValue::try_from(digest.to_string())
        .map_err(|_| RegistryError::InvalidDigest(digest.to_string()))?;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(DOCKER_CONTENT_DIGEST, value);
    Ok(())
}

/// Get or check a blob
pub(super) async fn serve(
    pull: &PullThrough,
    name: &str,
    digest: &str,
    headers: &HeaderMap,
    head: bool,
) -> RegistryResult<Response> {
    let digest: Digest = digest.parse()?;
    let content = pull.catalog().content();
    let source = pull.blob(name, &digest).await?;

    let total = match source {
        BlobSource::Fetched(size) => size,
        BlobSource::Local => content.size(&digest).await?,
    };

    if head {
        let mut response = Response::new(Body::empty());
        blob_headers(&mut response, &digest, total)?;
        return Ok(response);
    }

    let range = headers.get(header::RANGE).and_then(|value| value.to_str().ok());

    match span(range, total) {
        Span::Full => {
            let reader = content.reader(&digest).await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            blob_headers(&mut response, &digest, total)?;
            Ok(response)
        }
        Span::Partial(start, end) => {
            let mut reader = content.reader(&digest).await?;
            tokio::io::copy(&mut (&mut reader).take(start), &mut tokio::io::sink())
                .await
                .map_err(|err| StorageError::from_io("stream", err))?;
            let body = ReaderStream::new(reader.take(end - start + 1));
            let mut response = Response::new(Body::from_stream(body));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            blob_headers(&mut response, &digest, end - start + 1)?;
            if let Ok(value) = HeaderValue::try_from(format!("bytes {start}-{end}/{total}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            Ok(response)
        }
        Span::Unsatisfiable => {
            let mut response = RegistryError::RangeNotSatisfiable.into_response();
            if let Ok(value) = HeaderValue::try_from(format!("bytes */{total}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            Ok(response)
        }
    }
}
