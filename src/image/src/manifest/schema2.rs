//! Docker schema 2 and OCI image manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skiff_core::error::{CopyError, Result};

use super::{Descriptor, DOCKER_V2_SCHEMA2_MEDIA_TYPE};

/// `application/vnd.docker.distribution.manifest.v2+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2 {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Schema2 {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: DOCKER_V2_SCHEMA2_MEDIA_TYPE.to_string(),
            config,
            layers,
        }
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let m: Schema2 = serde_json::from_slice(blob)?;
        if m.schema_version != 2 {
            return Err(CopyError::ManifestError(format!(
                "unexpected schemaVersion {} in Docker schema 2 manifest",
                m.schema_version
            )));
        }
        Ok(m)
    }
}

/// `application/vnd.oci.image.manifest.v1+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(super::OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers,
            annotations: None,
        }
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let m: OciManifest = serde_json::from_slice(blob)?;
        if m.schema_version != 2 {
            return Err(CopyError::ManifestError(format!(
                "unexpected schemaVersion {} in OCI manifest",
                m.schema_version
            )));
        }
        if let Some(mt) = &m.media_type {
            if mt != super::OCI_MANIFEST_MEDIA_TYPE {
                return Err(CopyError::ManifestError(format!(
                    "OCI manifest has unexpected mediaType {mt}"
                )));
            }
        }
        Ok(m)
    }
}
