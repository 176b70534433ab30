//! Manifest formats, media types and conversions.
//!
//! Three single-image formats are understood (Docker schema 1, Docker
//! schema 2 and OCI image manifests) plus the two list formats (Docker
//! manifest lists and OCI image indexes).

pub mod convert;
pub mod list;
pub mod schema1;
pub mod schema2;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skiff_core::error::{CopyError, Result};

use crate::compression;
use crate::digest::Digest;

pub use convert::{convert, ConversionInput, Converted, ExtraBlob};
pub use list::ManifestList;
pub use schema1::Schema1;
pub use schema2::{OciManifest, Schema2};

pub const DOCKER_V2_SCHEMA1_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_V2_SCHEMA2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_V2_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Annotation carrying the image name inside an OCI index.
pub const OCI_REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Manifest types a copy may produce when nothing else is known.
pub const DEFAULT_MANIFEST_TYPES: &[&str] = &[
    OCI_MANIFEST_MEDIA_TYPE,
    DOCKER_V2_SCHEMA2_MEDIA_TYPE,
    DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
    DOCKER_V2_SCHEMA1_MEDIA_TYPE,
    DOCKER_V2_LIST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
];

/// Platform of a manifest list entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

/// Content descriptor shared by Docker schema 2 and OCI formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub size: i64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn to_blob_info(&self) -> BlobInfo {
        BlobInfo {
            digest: self.digest.clone(),
            size: self.size,
            media_type: self.media_type.clone(),
            urls: self.urls.clone().unwrap_or_default(),
            annotations: self.annotations.clone().unwrap_or_default(),
        }
    }

    pub fn from_blob_info(info: &BlobInfo) -> Self {
        Self {
            media_type: info.media_type.clone(),
            size: info.size,
            digest: info.digest.clone(),
            urls: (!info.urls.is_empty()).then(|| info.urls.clone()),
            annotations: (!info.annotations.is_empty()).then(|| info.annotations.clone()),
            platform: None,
        }
    }
}

/// What the copy pipeline knows about a blob.
///
/// `size` is `-1` when unknown (schema 1 manifests carry no sizes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: i64,
    pub media_type: String,
    pub urls: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

impl BlobInfo {
    pub fn new(digest: Digest, size: i64, media_type: impl Into<String>) -> Self {
        Self {
            digest,
            size,
            media_type: media_type.into(),
            urls: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// A layer as listed by a manifest, bottom first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub info: BlobInfo,
    /// Schema 1 "throwaway" entries that carry no filesystem change
    pub empty_layer: bool,
}

/// Guess the media type of a manifest from its contents.
///
/// Returns an empty string for content that is not a recognizable manifest.
pub fn guess_mime_type(manifest: &[u8]) -> String {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        schema_version: Option<i64>,
        #[serde(default)]
        signatures: Option<serde_json::Value>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
        #[serde(default)]
        config: Option<serde_json::Value>,
        #[serde(default)]
        layers: Option<serde_json::Value>,
    }

    let probe: Probe = match serde_json::from_slice(manifest) {
        Ok(p) => p,
        Err(_) => return String::new(),
    };

    if let Some(mt) = probe.media_type.filter(|mt| !mt.is_empty()) {
        return mt;
    }

    match probe.schema_version {
        Some(1) => {
            if probe.signatures.is_some() {
                DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE.to_string()
            } else {
                DOCKER_V2_SCHEMA1_MEDIA_TYPE.to_string()
            }
        }
        Some(2) => {
            if probe.manifests.is_some() {
                OCI_INDEX_MEDIA_TYPE.to_string()
            } else if probe.config.is_some() || probe.layers.is_some() {
                OCI_MANIFEST_MEDIA_TYPE.to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

/// Replace an absent or generic media type with a guessed one.
pub fn normalize_mime_type(mime_type: &str, manifest: &[u8]) -> String {
    match mime_type {
        "" | "text/plain" | "application/json" | "application/octet-stream" => {
            guess_mime_type(manifest)
        }
        other => other.to_string(),
    }
}

/// Digest of a manifest as used by registries.
///
/// Signed schema 1 manifests are digested over their payload with the JWS
/// signatures removed.
pub fn manifest_digest(manifest: &[u8]) -> Result<Digest> {
    if guess_mime_type(manifest) == DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE {
        let payload = schema1::payload(manifest)?;
        return Ok(Digest::from_bytes(&payload));
    }
    Ok(Digest::from_bytes(manifest))
}

/// Whether `manifest` hashes to `expected`.
pub fn matches_digest(manifest: &[u8], expected: &Digest) -> Result<bool> {
    Ok(&manifest_digest(manifest)? == expected)
}

pub fn is_list(mime_type: &str) -> bool {
    mime_type == DOCKER_V2_LIST_MEDIA_TYPE || mime_type == OCI_INDEX_MEDIA_TYPE
}

pub fn is_schema1(mime_type: &str) -> bool {
    mime_type == DOCKER_V2_SCHEMA1_MEDIA_TYPE || mime_type == DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE
}

/// Media type of a layer after it was (de)compressed in transit.
pub fn layer_media_type_for(
    media_type: &str,
    compression: Option<compression::Algorithm>,
) -> Result<String> {
    use compression::Algorithm;

    let docker = media_type.starts_with("application/vnd.docker.");
    let mt = match (docker, compression) {
        (true, None) => {
            if media_type == DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE {
                return Err(CopyError::ManifestError(
                    "foreign layers can not be stored uncompressed in Docker schema 2".to_string(),
                ));
            }
            DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE
        }
        (true, Some(Algorithm::Gzip)) => {
            if media_type == DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE {
                DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE
            } else {
                DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE
            }
        }
        (true, Some(other)) => {
            return Err(CopyError::ManifestError(format!(
                "{} compressed layers can not be represented in Docker schema 2",
                other.name()
            )))
        }
        (false, compression) => {
            let nondistributable = media_type.starts_with(OCI_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE);
            match (nondistributable, compression) {
                (false, None) => OCI_LAYER_MEDIA_TYPE,
                (false, Some(Algorithm::Gzip)) => OCI_LAYER_GZIP_MEDIA_TYPE,
                (false, Some(Algorithm::Zstd)) => OCI_LAYER_ZSTD_MEDIA_TYPE,
                (true, None) => OCI_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE,
                (true, Some(Algorithm::Gzip)) => OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE,
                (_, Some(other)) => {
                    return Err(CopyError::ManifestError(format!(
                        "{} compressed layers have no OCI media type",
                        other.name()
                    )))
                }
            }
        }
    };
    Ok(mt.to_string())
}

/// A parsed single-image manifest.
#[derive(Debug, Clone)]
pub enum Manifest {
    Schema1(Schema1),
    Schema2(Schema2),
    Oci(OciManifest),
}

impl Manifest {
    /// Parse `blob` according to `mime_type`, guessing when it is generic.
    pub fn from_blob(blob: &[u8], mime_type: &str) -> Result<Self> {
        let mime_type = normalize_mime_type(mime_type, blob);
        match mime_type.as_str() {
            DOCKER_V2_SCHEMA1_MEDIA_TYPE | DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE => {
                Ok(Manifest::Schema1(Schema1::from_blob(blob)?))
            }
            DOCKER_V2_SCHEMA2_MEDIA_TYPE => Ok(Manifest::Schema2(Schema2::from_blob(blob)?)),
            OCI_MANIFEST_MEDIA_TYPE => Ok(Manifest::Oci(OciManifest::from_blob(blob)?)),
            DOCKER_V2_LIST_MEDIA_TYPE | OCI_INDEX_MEDIA_TYPE => Err(CopyError::ManifestError(
                format!("{mime_type} is a manifest list, expected a single image"),
            )),
            "" => Err(CopyError::ManifestError(
                "unrecognized manifest format".to_string(),
            )),
            other => Err(CopyError::ManifestError(format!(
                "unimplemented manifest type {other}"
            ))),
        }
    }

    /// Media type this manifest serializes as.
    pub fn mime_type(&self) -> &str {
        match self {
            Manifest::Schema1(_) => DOCKER_V2_SCHEMA1_MEDIA_TYPE,
            Manifest::Schema2(_) => DOCKER_V2_SCHEMA2_MEDIA_TYPE,
            Manifest::Oci(_) => OCI_MANIFEST_MEDIA_TYPE,
        }
    }

    /// The config blob, absent for schema 1.
    pub fn config_info(&self) -> Option<BlobInfo> {
        match self {
            Manifest::Schema1(_) => None,
            Manifest::Schema2(m) => Some(m.config.to_blob_info()),
            Manifest::Oci(m) => Some(m.config.to_blob_info()),
        }
    }

    /// Layers, bottom first.
    pub fn layer_infos(&self) -> Result<Vec<LayerInfo>> {
        match self {
            Manifest::Schema1(m) => m.layer_infos(),
            Manifest::Schema2(m) => Ok(plain_layers(&m.layers)),
            Manifest::Oci(m) => Ok(plain_layers(&m.layers)),
        }
    }

    /// Replace layer digests, sizes and media types (bottom first).
    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<()> {
        match self {
            Manifest::Schema1(m) => m.update_layer_infos(infos),
            Manifest::Schema2(m) => update_descriptors(&mut m.layers, infos),
            Manifest::Oci(m) => update_descriptors(&mut m.layers, infos),
        }
    }

    /// Serialize; schema 1 manifests are emitted unsigned.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Manifest::Schema1(m) => m.serialize_unsigned(),
            Manifest::Schema2(m) => Ok(serde_json::to_vec(m)?),
            Manifest::Oci(m) => Ok(serde_json::to_vec(m)?),
        }
    }
}

fn plain_layers(layers: &[Descriptor]) -> Vec<LayerInfo> {
    layers
        .iter()
        .map(|d| LayerInfo {
            info: d.to_blob_info(),
            empty_layer: false,
        })
        .collect()
}

fn update_descriptors(layers: &mut [Descriptor], infos: &[BlobInfo]) -> Result<()> {
    if layers.len() != infos.len() {
        return Err(CopyError::ManifestError(format!(
            "error preparing updated manifest: layer count changed from {} to {}",
            layers.len(),
            infos.len()
        )));
    }
    for (layer, info) in layers.iter_mut().zip(infos) {
        layer.digest = info.digest.clone();
        layer.size = info.size;
        layer.media_type = info.media_type.clone();
        layer.urls = (!info.urls.is_empty()).then(|| info.urls.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#),
            DOCKER_V2_SCHEMA2_MEDIA_TYPE
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":1,"fsLayers":[]}"#),
            DOCKER_V2_SCHEMA1_MEDIA_TYPE
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":1,"fsLayers":[],"signatures":[]}"#),
            DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"manifests":[]}"#),
            OCI_INDEX_MEDIA_TYPE
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"config":{},"layers":[]}"#),
            OCI_MANIFEST_MEDIA_TYPE
        );
        assert_eq!(guess_mime_type(b"not json"), "");
        assert_eq!(guess_mime_type(br#"{"schemaVersion":3}"#), "");
    }

    #[test]
    fn test_normalize_mime_type() {
        let blob = br#"{"schemaVersion":2,"config":{},"layers":[]}"#;
        assert_eq!(normalize_mime_type("text/plain", blob), OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(
            normalize_mime_type(DOCKER_V2_SCHEMA2_MEDIA_TYPE, blob),
            DOCKER_V2_SCHEMA2_MEDIA_TYPE
        );
    }

    #[test]
    fn test_manifest_digest_plain() {
        let blob = br#"{"schemaVersion":2}"#;
        assert_eq!(manifest_digest(blob).unwrap(), Digest::from_bytes(blob));
    }

    #[test]
    fn test_layer_media_type_for() {
        use compression::Algorithm;
        assert_eq!(
            layer_media_type_for(DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE, None).unwrap(),
            DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE
        );
        assert_eq!(
            layer_media_type_for(DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE, Some(Algorithm::Gzip))
                .unwrap(),
            DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE
        );
        assert_eq!(
            layer_media_type_for(OCI_LAYER_GZIP_MEDIA_TYPE, None).unwrap(),
            OCI_LAYER_MEDIA_TYPE
        );
        assert_eq!(
            layer_media_type_for(OCI_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE, Some(Algorithm::Gzip))
                .unwrap(),
            OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE
        );
        assert!(layer_media_type_for(DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE, Some(Algorithm::Zstd)).is_err());
    }

    #[test]
    fn test_from_blob_rejects_lists() {
        let blob = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        assert!(Manifest::from_blob(blob, "").is_err());
    }
}
