use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Docker schema 1 manifest.
pub const DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 1 manifest carrying JWS signatures.
pub const DOCKER_SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 image manifest.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Layer media types whose content is hosted outside the registry.
pub const FOREIGN_LAYER_TYPES: &[&str] = &[
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
];

/// The manifest schemas this registry understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MediaType {
    /// Docker schema 1, unsigned.
    Schema1,
    /// Docker schema 1, signed.
    Schema1Signed,
    /// Docker schema 2 image manifest.
    DockerManifest,
    /// Docker schema 2 manifest list.
    DockerManifestList,
    /// OCI image manifest.
    OciManifest,
    /// OCI image index.
    OciIndex,
}

impl MediaType {
    /// Every supported type, most preferred first, as sent in `Accept` to upstreams.
    pub const ALL: [MediaType; 6] = [
        MediaType::OciIndex,
        MediaType::DockerManifestList,
        MediaType::OciManifest,
        MediaType::DockerManifest,
        MediaType::Schema1Signed,
        MediaType::Schema1,
    ];

    /// The media type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Schema1 => DOCKER_SCHEMA1,
            MediaType::Schema1Signed => DOCKER_SCHEMA1_SIGNED,
            MediaType::DockerManifest => DOCKER_MANIFEST,
            MediaType::DockerManifestList => DOCKER_MANIFEST_LIST,
            MediaType::OciManifest => OCI_MANIFEST,
            MediaType::OciIndex => OCI_INDEX,
        }
    }

    /// Whether this type references other manifests rather than blobs.
    pub fn is_list(&self) -> bool {
        matches!(self, MediaType::DockerManifestList | MediaType::OciIndex)
    }

    /// Whether this is one of the schema 1 types.
    pub fn is_schema1(&self) -> bool {
        matches!(self, MediaType::Schema1 | MediaType::Schema1Signed)
    }

    /// The `Accept` header value listing every supported type.
    pub fn accept_header() -> String {
        MediaType::ALL
            .iter()
            .map(MediaType::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        MediaType::ALL
            .into_iter()
            .find(|media_type| media_type.as_str() == essence)
            .ok_or_else(|| RegistryError::UnsupportedManifestType(essence.to_owned()))
    }
}

impl TryFrom<String> for MediaType {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MediaType> for String {
    fn from(value: MediaType) -> Self {
        value.as_str().to_owned()
    }
}

/// Whether a layer media type refers to foreign (non-distributable) content.
pub fn is_foreign_layer(media_type: &str) -> bool {
    FOREIGN_LAYER_TYPES.contains(&media_type)
}

/// Decide whether a manifest stored as `stored` may be served to a client sending `accept`.
///
/// Clients that send nothing, or a wildcard, get whatever is stored. Schema 1 is always
/// served since older clients never advertise it. Otherwise the stored type must be listed:
/// nothing is converted between schemas.
pub fn negotiate<S: AsRef<str>>(stored: MediaType, accept: &[S]) -> bool {
    if stored.is_schema1() || accept.is_empty() {
        return true;
    }

    accept.iter().any(|value| {
        let essence = value.as_ref().split(';').next().unwrap_or_default().trim();
        essence == "*/*" || essence == stored.as_str()
    })
}
