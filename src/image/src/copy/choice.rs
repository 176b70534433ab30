//! Choosing the manifest type written to a destination.

use skiff_core::error::{CopyError, Result};

use crate::manifest::{DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE, DOCKER_V2_SCHEMA2_MEDIA_TYPE};

/// Types most likely to be accepted everywhere, tried first.
const PREFERRED_TYPES: &[&str] = &[DOCKER_V2_SCHEMA2_MEDIA_TYPE, DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE];

/// The manifest type to write first, and what to try if the destination
/// rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestChoice {
    pub preferred: String,
    pub fallbacks: Vec<String>,
}

impl ManifestChoice {
    /// All candidates in the order they should be tried.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.preferred.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }

    /// Whether the preferred type keeps the source format.
    pub fn is_conversion(&self, source_type: &str) -> bool {
        self.preferred != source_type
    }
}

/// Decide which manifest type to write for a `source_type` manifest.
///
/// `supported` is the destination's list (empty accepts anything);
/// `forced` overrides the choice and must be supported.
pub fn determine_manifest_conversion(
    source_type: &str,
    supported: &[String],
    forced: Option<&str>,
) -> Result<ManifestChoice> {
    if let Some(forced) = forced {
        if !supported.is_empty() && !supported.iter().any(|s| s == forced) {
            return Err(CopyError::ManifestError(format!(
                "destination does not support manifest type {forced}, supported types: {}",
                supported.join(", ")
            )));
        }
        return Ok(ManifestChoice {
            preferred: forced.to_string(),
            fallbacks: Vec::new(),
        });
    }

    if supported.is_empty() {
        return Ok(ManifestChoice {
            preferred: source_type.to_string(),
            fallbacks: Vec::new(),
        });
    }

    let mut ordered: Vec<String> = PREFERRED_TYPES
        .iter()
        .filter(|t| supported.iter().any(|s| s == *t))
        .map(|t| t.to_string())
        .collect();
    for t in supported {
        if !ordered.contains(t) {
            ordered.push(t.clone());
        }
    }

    if ordered.iter().any(|t| t == source_type) {
        ordered.retain(|t| t != source_type);
        return Ok(ManifestChoice {
            preferred: source_type.to_string(),
            fallbacks: ordered,
        });
    }

    tracing::debug!(source_type, candidates = ?ordered, "Manifest needs conversion");
    let preferred = ordered.remove(0);
    Ok(ManifestChoice {
        preferred,
        fallbacks: ordered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DOCKER_V2_SCHEMA1_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};

    fn types(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_any_destination_keeps_source() {
        let choice = determine_manifest_conversion(OCI_MANIFEST_MEDIA_TYPE, &[], None).unwrap();
        assert_eq!(choice.preferred, OCI_MANIFEST_MEDIA_TYPE);
        assert!(choice.fallbacks.is_empty());
        assert!(!choice.is_conversion(OCI_MANIFEST_MEDIA_TYPE));
    }

    #[test]
    fn test_supported_source_type_is_kept_with_fallbacks() {
        let supported = types(&[
            OCI_MANIFEST_MEDIA_TYPE,
            DOCKER_V2_SCHEMA2_MEDIA_TYPE,
            DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
            DOCKER_V2_SCHEMA1_MEDIA_TYPE,
        ]);
        let choice = determine_manifest_conversion(OCI_MANIFEST_MEDIA_TYPE, &supported, None).unwrap();
        assert_eq!(choice.preferred, OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(
            choice.fallbacks,
            types(&[
                DOCKER_V2_SCHEMA2_MEDIA_TYPE,
                DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
                DOCKER_V2_SCHEMA1_MEDIA_TYPE
            ])
        );
    }

    #[test]
    fn test_unsupported_source_type_converts() {
        let supported = types(&[DOCKER_V2_SCHEMA2_MEDIA_TYPE]);
        let choice = determine_manifest_conversion(OCI_MANIFEST_MEDIA_TYPE, &supported, None).unwrap();
        assert_eq!(choice.preferred, DOCKER_V2_SCHEMA2_MEDIA_TYPE);
        assert!(choice.is_conversion(OCI_MANIFEST_MEDIA_TYPE));

        let supported = types(&[OCI_MANIFEST_MEDIA_TYPE]);
        let choice =
            determine_manifest_conversion(DOCKER_V2_SCHEMA2_MEDIA_TYPE, &supported, None).unwrap();
        assert_eq!(choice.preferred, OCI_MANIFEST_MEDIA_TYPE);
    }

    #[test]
    fn test_forced_type() {
        let supported = types(&[DOCKER_V2_SCHEMA2_MEDIA_TYPE]);
        assert!(determine_manifest_conversion(
            DOCKER_V2_SCHEMA2_MEDIA_TYPE,
            &supported,
            Some(OCI_MANIFEST_MEDIA_TYPE)
        )
        .is_err());

        let choice = determine_manifest_conversion(
            DOCKER_V2_SCHEMA2_MEDIA_TYPE,
            &[],
            Some(DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE),
        )
        .unwrap();
        assert_eq!(choice.preferred, DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE);
        assert_eq!(choice.candidates().count(), 1);
    }
}
