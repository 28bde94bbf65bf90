//! Docker schema 1 manifests.
//!
//! Signed schema 1 manifests embed JWS signatures in the document itself. Their digest is
//! taken over the payload the signatures cover, which is the original document with the
//! `signatures` section cut out. The protected header of each signature records how to
//! rebuild it: keep the first `formatLength` bytes, then append the base64url `formatTail`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Deserialize)]
pub(super) struct Document {
    #[serde(rename = "fsLayers")]
    pub(super) fs_layers: Vec<FsLayer>,

    #[serde(default)]
    pub(super) signatures: Vec<Signature>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FsLayer {
    #[serde(rename = "blobSum")]
    pub(super) blob_sum: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Signature {
    protected: String,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,

    #[serde(rename = "formatTail")]
    format_tail: String,
}

fn decode(value: &str) -> RegistryResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|err| RegistryError::InvalidManifest(format!("bad base64 in signature: {err}")))
}

/// Reconstruct the signed payload of a schema 1 manifest.
pub(super) fn payload(document: &Document, raw: &[u8]) -> RegistryResult<Vec<u8>> {
    let signature = document
        .signatures
        .first()
        .ok_or_else(|| RegistryError::InvalidManifest("schema 1 manifest is not signed".into()))?;

    let header: ProtectedHeader = serde_json::from_slice(&decode(&signature.protected)?)
        .map_err(|err| RegistryError::InvalidManifest(format!("bad protected header: {err}")))?;

    let head = raw.get(..header.format_length).ok_or_else(|| {
        RegistryError::InvalidManifest(format!(
            "formatLength {} exceeds manifest size {}",
            header.format_length,
            raw.len()
        ))
    })?;

    let mut payload = head.to_vec();
    payload.extend_from_slice(&decode(&header.format_tail)?);
    Ok(payload)
}

/// Layers in base-first order.
///
/// Schema 1 lists `fsLayers` top-most first.
pub(super) fn layers(document: &Document) -> RegistryResult<Vec<Digest>> {
    document
        .fs_layers
        .iter()
        .rev()
        .map(|layer| layer.blob_sum.parse())
        .collect()
}
