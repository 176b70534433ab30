//! Matching the identity claimed by a signature against the image.

use serde_json::Value;
use skiff_core::error::{CopyError, Result};

use crate::reference::DockerReference;

/// `signedIdentity` in a `signedBy` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMatcher {
    /// Signature and image references are identical
    MatchExact,
    /// Repository match for digested images, exact match otherwise
    MatchRepoDigestOrExact,
    /// Same repository, any tag or digest
    MatchRepository,
    /// The signature names exactly this reference
    ExactReference(DockerReference),
    /// The signature names this repository
    ExactRepository(DockerReference),
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        IdentityMatcher::MatchRepoDigestOrExact
    }
}

impl IdentityMatcher {
    pub(crate) fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| policy_err("signedIdentity is not an object"))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| policy_err("signedIdentity is missing \"type\""))?;
        let allowed: &[&str] = match kind {
            "matchExact" | "matchRepoDigestOrExact" | "matchRepository" => &["type"],
            "exactReference" => &["type", "dockerReference"],
            "exactRepository" => &["type", "dockerRepository"],
            other => return Err(policy_err(format!("Unknown signedIdentity type \"{other}\""))),
        };
        if let Some(key) = obj.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(policy_err(format!("Unknown key \"{key}\" in signedIdentity")));
        }

        Ok(match kind {
            "matchExact" => IdentityMatcher::MatchExact,
            "matchRepoDigestOrExact" => IdentityMatcher::MatchRepoDigestOrExact,
            "matchRepository" => IdentityMatcher::MatchRepository,
            "exactReference" => {
                let s = required_str(obj, "dockerReference")?;
                let r = DockerReference::parse_normalized_named(s)
                    .map_err(|e| policy_err(format!("Invalid dockerReference \"{s}\": {e}")))?;
                if r.is_name_only() {
                    return Err(policy_err(format!(
                        "dockerReference \"{s}\" must be tagged or digested"
                    )));
                }
                IdentityMatcher::ExactReference(r)
            }
            _ => {
                let s = required_str(obj, "dockerRepository")?;
                let r = DockerReference::parse_normalized_named(s)
                    .map_err(|e| policy_err(format!("Invalid dockerRepository \"{s}\": {e}")))?;
                IdentityMatcher::ExactRepository(r)
            }
        })
    }

    /// Whether a signature claiming `signature_ref` is acceptable for an
    /// image known as `image_ref`.
    pub fn matches(&self, image_ref: Option<&DockerReference>, signature_ref: &str) -> bool {
        let Ok(sig) = DockerReference::parse_normalized_named(signature_ref) else {
            return false;
        };
        match self {
            IdentityMatcher::MatchExact => image_ref.is_some_and(|img| exact(img, &sig)),
            IdentityMatcher::MatchRepoDigestOrExact => image_ref.is_some_and(|img| {
                if img.digest.is_some() {
                    img.name() == sig.name()
                } else {
                    exact(img, &sig)
                }
            }),
            IdentityMatcher::MatchRepository => image_ref.is_some_and(|img| img.name() == sig.name()),
            IdentityMatcher::ExactReference(want) => want.to_string() == sig.to_string(),
            IdentityMatcher::ExactRepository(want) => want.name() == sig.name(),
        }
    }

    /// Whether this matcher needs the image's own docker reference.
    pub fn uses_image_reference(&self) -> bool {
        matches!(
            self,
            IdentityMatcher::MatchExact
                | IdentityMatcher::MatchRepoDigestOrExact
                | IdentityMatcher::MatchRepository
        )
    }
}

fn exact(image: &DockerReference, sig: &DockerReference) -> bool {
    !image.is_name_only() && !sig.is_name_only() && image.to_string() == sig.to_string()
}

fn required_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| policy_err(format!("signedIdentity is missing \"{key}\"")))
}

fn policy_err(msg: impl Into<String>) -> CopyError {
    CopyError::PolicyError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r(s: &str) -> DockerReference {
        DockerReference::parse_normalized_named(s).unwrap()
    }

    const DIGEST: &str = "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0";

    #[test]
    fn test_match_exact() {
        let m = IdentityMatcher::MatchExact;
        assert!(m.matches(Some(&r("busybox:latest")), "docker.io/library/busybox:latest"));
        assert!(!m.matches(Some(&r("busybox:latest")), "docker.io/library/busybox:1"));
        assert!(!m.matches(Some(&r("busybox")), "docker.io/library/busybox"));
        assert!(!m.matches(None, "docker.io/library/busybox:latest"));
    }

    #[test]
    fn test_match_repo_digest_or_exact() {
        let m = IdentityMatcher::MatchRepoDigestOrExact;
        let digested = r(&format!("quay.io/a/b@{DIGEST}"));
        assert!(m.matches(Some(&digested), "quay.io/a/b:anything"));
        assert!(!m.matches(Some(&digested), "quay.io/a/c:anything"));
        assert!(m.matches(Some(&r("quay.io/a/b:1")), "quay.io/a/b:1"));
        assert!(!m.matches(Some(&r("quay.io/a/b:1")), "quay.io/a/b:2"));
    }

    #[test]
    fn test_match_repository() {
        let m = IdentityMatcher::MatchRepository;
        assert!(m.matches(Some(&r("quay.io/a/b:1")), "quay.io/a/b:2"));
        assert!(!m.matches(Some(&r("quay.io/a/b:1")), "quay.io/a/bb:1"));
    }

    #[test]
    fn test_exact_reference_and_repository() {
        let m = IdentityMatcher::from_json(&json!({"type": "exactReference", "dockerReference": "quay.io/a/b:1"}))
            .unwrap();
        assert!(m.matches(None, "quay.io/a/b:1"));
        assert!(!m.matches(None, "quay.io/a/b:2"));

        let m = IdentityMatcher::from_json(&json!({"type": "exactRepository", "dockerRepository": "quay.io/a/b"}))
            .unwrap();
        assert!(m.matches(None, "quay.io/a/b:2"));
        assert!(!m.uses_image_reference());
    }

    #[test]
    fn test_from_json_rejects() {
        assert!(IdentityMatcher::from_json(&json!({"type": "nope"})).is_err());
        assert!(IdentityMatcher::from_json(&json!({"type": "matchExact", "extra": 1})).is_err());
        assert!(IdentityMatcher::from_json(&json!({"type": "exactReference", "dockerReference": "quay.io/a/b"})).is_err());
        assert!(IdentityMatcher::from_json(&json!({"type": "exactRepository"})).is_err());
    }

    #[test]
    fn test_unparseable_signature_reference() {
        assert!(!IdentityMatcher::MatchRepository.matches(Some(&r("quay.io/a/b:1")), "Not A Ref"));
    }
}
