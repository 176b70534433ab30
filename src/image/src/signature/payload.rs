//! "Atomic container signature" payloads (simple signing).

use serde_json::{json, Map, Value};
use skiff_core::error::{CopyError, Result};

use crate::digest::Digest;

pub const SIGNATURE_TYPE: &str = "atomic container signature";

/// Contents of a signature before its cryptographic envelope is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrustedSignature {
    pub docker_manifest_digest: Digest,
    pub docker_reference: String,
    pub creator: Option<String>,
    /// Unix seconds
    pub timestamp: Option<i64>,
}

impl UntrustedSignature {
    /// A new payload stamped with this tool as creator and the current time.
    pub fn new(docker_manifest_digest: Digest, docker_reference: impl Into<String>) -> Self {
        Self {
            docker_manifest_digest,
            docker_reference: docker_reference.into(),
            creator: Some(format!("skiff {}", skiff_core::VERSION)),
            timestamp: Some(chrono::Utc::now().timestamp()),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut optional = Map::new();
        if let Some(creator) = &self.creator {
            optional.insert("creator".to_string(), json!(creator));
        }
        if let Some(ts) = self.timestamp {
            optional.insert("timestamp".to_string(), json!(ts));
        }
        Ok(serde_json::to_vec(&json!({
            "critical": {
                "type": SIGNATURE_TYPE,
                "image": {"docker-manifest-digest": self.docker_manifest_digest.as_str()},
                "identity": {"docker-reference": self.docker_reference},
            },
            "optional": optional,
        }))?)
    }

    /// Parse a payload, rejecting anything unexpected in the critical section.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| invalid(format!("invalid JSON: {e}")))?;
        let top = exact_object(&value, "signature", &["critical", "optional"])?;

        let critical = exact_object(&top["critical"], "critical", &["type", "image", "identity"])?;
        let kind = critical["type"]
            .as_str()
            .ok_or_else(|| invalid("critical.type is not a string"))?;
        if kind != SIGNATURE_TYPE {
            return Err(invalid(format!("Unrecognized signature type {kind}")));
        }

        let image = exact_object(&critical["image"], "critical.image", &["docker-manifest-digest"])?;
        let digest = image["docker-manifest-digest"]
            .as_str()
            .ok_or_else(|| invalid("docker-manifest-digest is not a string"))?;
        let docker_manifest_digest = Digest::parse(digest)?;

        let identity = exact_object(&critical["identity"], "critical.identity", &["docker-reference"])?;
        let docker_reference = identity["docker-reference"]
            .as_str()
            .ok_or_else(|| invalid("docker-reference is not a string"))?
            .to_string();

        let optional = top["optional"]
            .as_object()
            .ok_or_else(|| invalid("optional is not an object"))?;
        let creator = match optional.get("creator") {
            None => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| invalid("optional.creator is not a string"))?
                    .to_string(),
            ),
        };
        let timestamp = match optional.get("timestamp") {
            None => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| invalid("optional.timestamp is not an integer"))?,
            ),
        };

        Ok(Self {
            docker_manifest_digest,
            docker_reference,
            creator,
            timestamp,
        })
    }
}

fn invalid(msg: impl std::fmt::Display) -> CopyError {
    CopyError::SignatureError(format!("Invalid signature format: {msg}"))
}

/// `value` must be an object with exactly the `fields` keys.
fn exact_object<'a>(value: &'a Value, what: &str, fields: &[&str]) -> Result<&'a Map<String, Value>> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(format!("{what} is not an object")))?;
    for key in obj.keys() {
        if !fields.contains(&key.as_str()) {
            return Err(invalid(format!("unexpected field \"{key}\" in {what}")));
        }
    }
    for field in fields {
        if !obj.contains_key(*field) {
            return Err(invalid(format!("missing field \"{field}\" in {what}")));
        }
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UntrustedSignature {
        UntrustedSignature {
            docker_manifest_digest: Digest::from_bytes(b"manifest"),
            docker_reference: "docker.io/library/busybox:latest".to_string(),
            creator: Some("test".to_string()),
            timestamp: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let sig = sample();
        let parsed = UntrustedSignature::from_json(&sig.to_json().unwrap()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let data = format!(
            r#"{{"critical":{{"type":"atomic container signature","image":{{"docker-manifest-digest":"{}"}},"identity":{{"docker-reference":"quay.io/a/b:1"}}}},"optional":{{}}}}"#,
            Digest::from_bytes(b"m")
        );
        let sig = UntrustedSignature::from_json(data.as_bytes()).unwrap();
        assert!(sig.creator.is_none());
        assert!(sig.timestamp.is_none());
    }

    #[test]
    fn test_rejects_unknown_critical_field() {
        let mut value: Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        value["critical"]["extra"] = json!(1);
        let err = UntrustedSignature::from_json(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_rejects_wrong_type() {
        let mut value: Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        value["critical"]["type"] = json!("something else");
        assert!(UntrustedSignature::from_json(&serde_json::to_vec(&value).unwrap()).is_err());
    }

    #[test]
    fn test_rejects_missing_optional() {
        let mut value: Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("optional");
        assert!(UntrustedSignature::from_json(&serde_json::to_vec(&value).unwrap()).is_err());
    }

    #[test]
    fn test_rejects_bad_digest() {
        let mut value: Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        value["critical"]["image"]["docker-manifest-digest"] = json!("sha256:xyz");
        assert!(UntrustedSignature::from_json(&serde_json::to_vec(&value).unwrap()).is_err());
    }
}
