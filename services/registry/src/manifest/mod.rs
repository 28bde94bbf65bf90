//! The manifest model.
//!
//! Every supported schema is parsed into one [`Manifest`] shape: an image (config plus
//! base-first layers) or a list of platform manifests. The original bytes are kept, since
//! they are what the digest covers and what gets served back.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};
use crate::error::{RegistryError, RegistryResult};

mod media;
mod schema1;

pub use media::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_SCHEMA1, DOCKER_SCHEMA1_SIGNED,
    FOREIGN_LAYER_TYPES, MediaType, OCI_INDEX, OCI_MANIFEST, is_foreign_layer, negotiate,
};

#[cfg(test)]
pub(crate) use schema1::fixtures as schema1_fixtures;

/// The platform a list entry was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,

    /// Operating system, e.g. `linux`.
    pub os: String,

    /// CPU variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Operating system version.
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Required operating system features.
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

/// A layer blob referenced by an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// The layer digest.
    pub digest: Digest,

    /// The layer media type, when the schema carries one.
    pub media_type: Option<String>,

    /// Declared size in bytes.
    pub size: Option<u64>,

    /// Whether the layer is hosted outside the registry.
    pub foreign: bool,
}

/// A platform specific manifest referenced by a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformManifest {
    /// The child manifest digest.
    pub digest: Digest,

    /// Declared media type of the child.
    pub media_type: Option<String>,

    /// The platform, when declared.
    pub platform: Option<Platform>,
}

/// The normalized body of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestContent {
    /// A single platform image.
    Image {
        /// The config blob. Schema 1 manifests have none.
        config: Option<Digest>,

        /// Layers, base layer first.
        layers: Vec<Layer>,
    },

    /// A multi-platform list.
    List {
        /// The platform manifests.
        manifests: Vec<PlatformManifest>,
    },
}

/// A parsed manifest together with its original bytes.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The manifest identity.
    pub digest: Digest,

    /// The schema.
    pub media_type: MediaType,

    /// The normalized content.
    pub content: ManifestContent,

    /// Annotations, for schemas which carry them.
    pub annotations: BTreeMap<String, String>,

    /// The bytes as received.
    pub bytes: Bytes,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    digest: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct ImageDocument {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ListDocument {
    manifests: Vec<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn invalid(err: serde_json::Error) -> RegistryError {
    RegistryError::InvalidManifest(err.to_string())
}

/// Work out the schema from the body, then the transport content type, then the shape.
fn determine_media_type(
    value: &serde_json::Value,
    content_type: Option<&str>,
) -> RegistryResult<MediaType> {
    if let Some(declared) = value.get("mediaType").and_then(|v| v.as_str()) {
        return declared.parse();
    }

    let schema_version = value.get("schemaVersion").and_then(|v| v.as_u64());
    if schema_version == Some(1) {
        return Ok(if value.get("signatures").is_some() {
            MediaType::Schema1Signed
        } else {
            MediaType::Schema1
        });
    }

    if let Some(media_type) = content_type.and_then(|ct| ct.parse::<MediaType>().ok()) {
        return Ok(media_type);
    }

    match schema_version {
        Some(2) if value.get("manifests").is_some() => Ok(MediaType::OciIndex),
        Some(2) if value.get("config").is_some() => Ok(MediaType::OciManifest),
        _ => Err(RegistryError::UnsupportedManifestType(
            content_type.unwrap_or("unknown").to_owned(),
        )),
    }
}

impl Manifest {
    /// Parse manifest bytes, hashing the identity with `algorithm`.
    ///
    /// `content_type` is the transport `Content-Type`, consulted only when the body does not
    /// declare its own media type.
    pub fn parse(
        content_type: Option<&str>,
        bytes: Bytes,
        algorithm: Algorithm,
    ) -> RegistryResult<Manifest> {
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(invalid)?;
        let media_type = determine_media_type(&value, content_type)?;

        let (content, annotations, digest) = match media_type {
            MediaType::Schema1 | MediaType::Schema1Signed => {
                let document: schema1::Document =
                    serde_json::from_value(value).map_err(invalid)?;
                let layers = schema1::layers(&document)?
                    .into_iter()
                    .map(|digest| Layer {
                        digest,
                        media_type: None,
                        size: None,
                        foreign: false,
                    })
                    .collect();
                let digest = if media_type == MediaType::Schema1Signed {
                    algorithm.digest(&schema1::payload(&document, &bytes)?)
                } else {
                    algorithm.digest(&bytes)
                };
                (
                    ManifestContent::Image {
                        config: None,
                        layers,
                    },
                    BTreeMap::new(),
                    digest,
                )
            }
            MediaType::DockerManifest | MediaType::OciManifest => {
                let document: ImageDocument = serde_json::from_value(value).map_err(invalid)?;
                let layers = document
                    .layers
                    .into_iter()
                    .map(|layer| {
                        let foreign = layer
                            .media_type
                            .as_deref()
                            .is_some_and(media::is_foreign_layer);
                        Ok(Layer {
                            digest: layer.digest.parse()?,
                            media_type: layer.media_type,
                            size: layer.size,
                            foreign,
                        })
                    })
                    .collect::<RegistryResult<Vec<_>>>()?;
                (
                    ManifestContent::Image {
                        config: Some(document.config.digest.parse()?),
                        layers,
                    },
                    document.annotations,
                    algorithm.digest(&bytes),
                )
            }
            MediaType::DockerManifestList | MediaType::OciIndex => {
                let document: ListDocument = serde_json::from_value(value).map_err(invalid)?;
                let manifests = document
                    .manifests
                    .into_iter()
                    .map(|entry| {
                        Ok(PlatformManifest {
                            digest: entry.digest.parse()?,
                            media_type: entry.media_type,
                            platform: entry.platform,
                        })
                    })
                    .collect::<RegistryResult<Vec<_>>>()?;
                (
                    ManifestContent::List { manifests },
                    document.annotations,
                    algorithm.digest(&bytes),
                )
            }
        };

        let manifest = Manifest {
            digest,
            media_type,
            content,
            annotations,
            bytes,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and check the result against an expected digest.
    pub fn parse_verified(
        content_type: Option<&str>,
        bytes: Bytes,
        expected: &Digest,
    ) -> RegistryResult<Manifest> {
        let manifest = Manifest::parse(content_type, bytes, expected.algorithm())?;
        if &manifest.digest != expected {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: manifest.digest.to_string(),
            });
        }
        Ok(manifest)
    }

    /// Structural checks which hold regardless of what is stored.
    pub fn validate(&self) -> RegistryResult<()> {
        match &self.content {
            ManifestContent::List { manifests } if manifests.is_empty() => Err(
                RegistryError::InvalidManifest("manifest list has no platform manifests".into()),
            ),
            ManifestContent::List { manifests } => {
                match manifests.iter().find(|m| m.digest == self.digest) {
                    Some(_) => Err(RegistryError::InvalidManifest(
                        "manifest list references itself".into(),
                    )),
                    None => Ok(()),
                }
            }
            ManifestContent::Image { .. } => Ok(()),
        }
    }

    /// Whether this is a manifest list or index.
    pub fn is_list(&self) -> bool {
        matches!(self.content, ManifestContent::List { .. })
    }

    /// Child manifests of a list, in declaration order.
    pub fn children(&self) -> impl Iterator<Item = &PlatformManifest> {
        let manifests: &[PlatformManifest] = match &self.content {
            ManifestContent::List { manifests } => manifests,
            ManifestContent::Image { .. } => &[],
        };
        manifests.iter()
    }

    /// The config blob of an image, if any.
    pub fn config(&self) -> Option<&Digest> {
        match &self.content {
            ManifestContent::Image { config, .. } => config.as_ref(),
            ManifestContent::List { .. } => None,
        }
    }

    /// Layers of an image, base layer first.
    pub fn layers(&self) -> &[Layer] {
        match &self.content {
            ManifestContent::Image { layers, .. } => layers,
            ManifestContent::List { .. } => &[],
        }
    }

    /// Every digest this manifest points at, without duplicates, in declaration order.
    pub fn references(&self) -> Vec<Digest> {
        let mut seen = std::collections::BTreeSet::new();
        self.config()
            .into_iter()
            .chain(self.layers().iter().map(|layer| &layer.digest))
            .chain(self.children().map(|child| &child.digest))
            .filter(|digest| seen.insert((*digest).clone()))
            .cloned()
            .collect()
    }
}
