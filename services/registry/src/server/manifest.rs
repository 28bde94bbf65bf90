//! Manifest reads

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{DOCKER_SCHEMA1_SIGNED, negotiate};
use crate::pull_through::PullThrough;
use crate::reference::Reference;
use crate::upstream::DOCKER_CONTENT_DIGEST;

/// The media types a client accepts, in header order.
fn accepted(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Get or check a manifest by tag or digest
pub(super) async fn serve(
    pull: &PullThrough,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    head: bool,
) -> RegistryResult<Response> {
    let reference = Reference::parse(reference)?;
    let (record, bytes) = pull.manifest(name, &reference).await?;

    let accept = accepted(headers);
    if !negotiate(record.media_type, &accept) {
        tracing::debug!(
            media_type = %record.media_type,
            accept = ?accept,
            "no acceptable manifest type"
        );
        return Err(RegistryError::ManifestNotFound(format!(
            "{name}:{reference} is stored as {}",
            record.media_type
        )));
    }

    let content_type = if record.media_type.is_schema1() {
        DOCKER_SCHEMA1_SIGNED
    } else {
        record.media_type.as_str()
    };
    let digest = HeaderValue::try_from(record.digest.to_string())
        .map_err(|_| RegistryError::InvalidDigest(record.digest.to_string()))?;

    let length = bytes.len();
    let body = if head { Body::empty() } else { Body::from(bytes) };
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response_headers.insert(DOCKER_CONTENT_DIGEST, digest);
    Ok(response)
}
