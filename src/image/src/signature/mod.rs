//! Simple signing: signature payloads, mechanisms, identity matching and
//! the trust policy that decides whether an image may be used.

pub mod identity;
pub mod mechanism;
pub mod payload;
pub mod policy;

pub use identity::IdentityMatcher;
pub use mechanism::{EphemeralKeyring, GpgKeyring, GpgMechanism, SigningMechanism};
pub use payload::UntrustedSignature;
pub use policy::{Policy, PolicyContext, PolicyRequirement, UnparsedImage};

use skiff_core::error::{CopyError, Result};

use crate::manifest;
use crate::reference::DockerReference;

/// Sign `manifest` as `docker_reference` with `key_identity`.
pub async fn sign_docker_manifest(
    mechanism: &dyn SigningMechanism,
    manifest: &[u8],
    docker_reference: &DockerReference,
    key_identity: &str,
) -> Result<Vec<u8>> {
    let digest = manifest::manifest_digest(manifest)?;
    let payload = UntrustedSignature::new(digest, docker_reference.to_string()).to_json()?;
    mechanism.sign(&payload, key_identity).await
}

/// Verify `signature` for `manifest`.
///
/// The signing key must be one of `trusted_keys` (when non-empty), the
/// signed digest must match the manifest and `identity_ok` must accept the
/// signed docker reference.
pub async fn verify_signature(
    mechanism: &dyn SigningMechanism,
    trusted_keys: &[String],
    signature: &[u8],
    manifest: &[u8],
    identity_ok: &(dyn Fn(&str) -> bool + Sync),
) -> Result<UntrustedSignature> {
    let (contents, key) = mechanism.verify(signature).await?;
    if !trusted_keys.is_empty() && !trusted_keys.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
        return Err(CopyError::SignatureError(format!(
            "Signature by key {key} is not accepted"
        )));
    }
    let sig = UntrustedSignature::from_json(&contents)?;
    if !manifest::matches_digest(manifest, &sig.docker_manifest_digest)? {
        return Err(CopyError::SignatureError(format!(
            "Signature for docker digest \"{}\" does not match",
            sig.docker_manifest_digest
        )));
    }
    if !identity_ok(&sig.docker_reference) {
        return Err(CopyError::SignatureError(format!(
            "Signature for identity {} is not accepted",
            sig.docker_reference
        )));
    }
    Ok(sig)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeMechanism;
    use super::*;

    #[tokio::test]
    async fn test_sign_then_verify() {
        let manifest = br#"{"schemaVersion":2}"#;
        let reference = DockerReference::parse_normalized_named("quay.io/a/b:1").unwrap();
        let sig = sign_docker_manifest(&FakeMechanism, manifest, &reference, "KEY1")
            .await
            .unwrap();

        let parsed = verify_signature(&FakeMechanism, &["KEY1".to_string()], &sig, manifest, &|r| {
            r == "quay.io/a/b:1"
        })
        .await
        .unwrap();
        assert_eq!(parsed.docker_reference, "quay.io/a/b:1");
    }

    #[tokio::test]
    async fn test_verify_rejects_untrusted_key() {
        let manifest = br#"{"schemaVersion":2}"#;
        let reference = DockerReference::parse_normalized_named("quay.io/a/b:1").unwrap();
        let sig = sign_docker_manifest(&FakeMechanism, manifest, &reference, "OTHER")
            .await
            .unwrap();
        let err = verify_signature(&FakeMechanism, &["KEY1".to_string()], &sig, manifest, &|_| true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not accepted"));
    }

    #[tokio::test]
    async fn test_verify_rejects_other_manifest() {
        let reference = DockerReference::parse_normalized_named("quay.io/a/b:1").unwrap();
        let sig = sign_docker_manifest(&FakeMechanism, b"{\"a\":1}", &reference, "KEY1")
            .await
            .unwrap();
        let err = verify_signature(&FakeMechanism, &[], &sig, b"{\"a\":2}", &|_| true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn test_verify_rejects_identity() {
        let manifest = br#"{"schemaVersion":2}"#;
        let reference = DockerReference::parse_normalized_named("quay.io/a/b:1").unwrap();
        let sig = sign_docker_manifest(&FakeMechanism, manifest, &reference, "KEY1")
            .await
            .unwrap();
        assert!(verify_signature(&FakeMechanism, &[], &sig, manifest, &|_| false)
            .await
            .is_err());
    }
}
