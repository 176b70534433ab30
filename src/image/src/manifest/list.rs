//! Docker manifest lists and OCI image indexes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skiff_core::error::{CopyError, Result};

use super::{Descriptor, DOCKER_V2_LIST_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE};
use crate::digest::Digest;

/// A multi-platform manifest list. Both list formats share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ManifestList {
    pub fn from_blob(blob: &[u8], mime_type: &str) -> Result<Self> {
        if mime_type != DOCKER_V2_LIST_MEDIA_TYPE && mime_type != OCI_INDEX_MEDIA_TYPE {
            return Err(CopyError::ManifestError(format!(
                "{mime_type} is not a manifest list type"
            )));
        }
        Ok(serde_json::from_slice(blob)?)
    }

    /// An empty OCI index.
    pub fn new_oci_index() -> Self {
        Self {
            schema_version: 2,
            media_type: None,
            manifests: Vec::new(),
            annotations: None,
        }
    }

    /// Pick the instance matching `os`/`architecture` and, when given,
    /// `variant`. An exact variant match wins over an entry without one.
    pub fn choose_instance(
        &self,
        os: &str,
        architecture: &str,
        variant: Option<&str>,
    ) -> Result<Digest> {
        let candidates: Vec<&Descriptor> = self
            .manifests
            .iter()
            .filter(|d| {
                d.platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && p.architecture == architecture)
            })
            .collect();

        let chosen = match variant {
            Some(want) => candidates
                .iter()
                .find(|d| d.platform.as_ref().and_then(|p| p.variant.as_deref()) == Some(want))
                .or_else(|| {
                    candidates
                        .iter()
                        .find(|d| d.platform.as_ref().is_some_and(|p| p.variant.is_none()))
                }),
            None => candidates.first(),
        };

        chosen.map(|d| d.digest.clone()).ok_or_else(|| {
            let wanted = match variant {
                Some(v) => format!("{os}/{architecture}/{v}"),
                None => format!("{os}/{architecture}"),
            };
            CopyError::ManifestError(format!(
                "no image found in manifest list for architecture {architecture}, OS {os} ({wanted})"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 528,
                "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                "platform": {"architecture": "amd64", "os": "linux"}
            },
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 528,
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "platform": {"architecture": "arm", "os": "linux", "variant": "v6"}
            },
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 528,
                "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
                "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}
            },
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 528,
                "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                "platform": {"architecture": "amd64", "os": "windows", "os.version": "10.0.17763.1"}
            }
        ]
    }"#;

    fn list() -> ManifestList {
        ManifestList::from_blob(LIST.as_bytes(), DOCKER_V2_LIST_MEDIA_TYPE).unwrap()
    }

    #[test]
    fn test_choose_by_os_and_arch() {
        let digest = list().choose_instance("linux", "amd64", None).unwrap();
        assert!(digest.as_str().ends_with("1111"));
        let digest = list().choose_instance("windows", "amd64", None).unwrap();
        assert!(digest.as_str().ends_with("4444"));
    }

    #[test]
    fn test_choose_by_variant() {
        let digest = list().choose_instance("linux", "arm", Some("v7")).unwrap();
        assert!(digest.as_str().ends_with("3333"));
        let digest = list().choose_instance("linux", "arm", None).unwrap();
        assert!(digest.as_str().ends_with("2222"));
    }

    #[test]
    fn test_choose_no_match() {
        let err = list().choose_instance("linux", "s390x", None).unwrap_err();
        assert!(err.to_string().contains("s390x"));
        assert!(list().choose_instance("linux", "arm", Some("v8")).is_err());
    }

    #[test]
    fn test_rejects_non_list_type() {
        assert!(ManifestList::from_blob(LIST.as_bytes(), "application/json").is_err());
    }
}
