//! Docker schema 1 manifests and their JWS signatures.
//!
//! Signed schema 1 manifests embed a libtrust "pretty" JWS: the manifest
//! JSON with a `signatures` array appended before the final `}`. The
//! protected header records where the payload ends (`formatLength`) and
//! what followed it (`formatTail`) so that the original bytes can be
//! recovered for digesting and verification.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use skiff_core::error::{CopyError, Result};

use super::{BlobInfo, LayerInfo, DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE};
use crate::digest::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// Fields of a `v1Compatibility` entry that conversions care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct V1Compatibility {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub container_config: V1ContainerConfig,
    #[serde(default)]
    pub throwaway: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V1ContainerConfig {
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
}

/// `application/vnd.docker.distribution.manifest.v1+json`, stored without
/// signatures. Layers and history are listed top layer first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1 {
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<History>,
}

impl Schema1 {
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let m: Schema1 = serde_json::from_slice(blob)?;
        if m.schema_version != 1 {
            return Err(CopyError::ManifestError(format!(
                "unexpected schemaVersion {} in Docker schema 1 manifest",
                m.schema_version
            )));
        }
        if m.fs_layers.len() != m.history.len() {
            return Err(CopyError::ManifestError(
                "length of history not equal to number of layers".to_string(),
            ));
        }
        if m.fs_layers.is_empty() {
            return Err(CopyError::ManifestError(
                "no FSLayers in manifest".to_string(),
            ));
        }
        m.v1_compatibility()?;
        Ok(m)
    }

    /// Parsed history entries, top layer first.
    pub fn v1_compatibility(&self) -> Result<Vec<V1Compatibility>> {
        self.history
            .iter()
            .enumerate()
            .map(|(i, h)| {
                serde_json::from_str(&h.v1_compatibility).map_err(|e| {
                    CopyError::ManifestError(format!("error parsing v1Compatibility {i}: {e}"))
                })
            })
            .collect()
    }

    /// Layers bottom first; sizes are unknown.
    pub fn layer_infos(&self) -> Result<Vec<LayerInfo>> {
        let compat = self.v1_compatibility()?;
        Ok(self
            .fs_layers
            .iter()
            .zip(compat)
            .rev()
            .map(|(layer, c)| LayerInfo {
                info: BlobInfo::new(layer.blob_sum.clone(), -1, DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE),
                empty_layer: c.throwaway,
            })
            .collect())
    }

    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<()> {
        if infos.len() != self.fs_layers.len() {
            return Err(CopyError::ManifestError(format!(
                "error preparing updated manifest: layer count changed from {} to {}",
                self.fs_layers.len(),
                infos.len()
            )));
        }
        for (layer, info) in self.fs_layers.iter_mut().rev().zip(infos) {
            layer.blob_sum = info.digest.clone();
        }
        Ok(())
    }

    /// Serialize the way docker does: three-space indentation, no signatures.
    pub fn serialize_unsigned(&self) -> Result<Vec<u8>> {
        pretty_json(self, b"   ")
    }
}

fn pretty_json<T: Serialize>(value: &T, indent: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

#[derive(Debug, Serialize, Deserialize)]
struct JwsSignature {
    header: JwsHeader,
    signature: String,
    protected: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwsHeader {
    jwk: serde_json::Value,
    alg: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    time: String,
}

#[derive(Deserialize)]
struct SignedEnvelope {
    #[serde(default)]
    signatures: Vec<JwsSignature>,
}

fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(s))
        .map_err(|e| CopyError::ManifestError(format!("invalid base64 in JWS: {e}")))
}

/// Recover the signed payload of a schema 1 manifest.
///
/// Manifests without signatures are returned unchanged.
pub fn payload(manifest: &[u8]) -> Result<Vec<u8>> {
    let envelope: SignedEnvelope = serde_json::from_slice(manifest)?;
    let Some(first) = envelope.signatures.first() else {
        return Ok(manifest.to_vec());
    };
    let protected: ProtectedHeader = serde_json::from_slice(&b64url_decode(&first.protected)?)?;
    if protected.format_length > manifest.len() {
        return Err(CopyError::ManifestError(format!(
            "JWS formatLength {} exceeds manifest size {}",
            protected.format_length,
            manifest.len()
        )));
    }
    let mut out = manifest[..protected.format_length].to_vec();
    out.extend_from_slice(&b64url_decode(&protected.format_tail)?);
    Ok(out)
}

/// Sign an unsigned schema 1 manifest with a freshly generated ES256 key.
pub fn sign(content: &[u8]) -> Result<Vec<u8>> {
    let key = SigningKey::random(&mut rand::rngs::OsRng);
    sign_with_key(content, &key, &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn sign_with_key(content: &[u8], key: &SigningKey, time: &str) -> Result<Vec<u8>> {
    let not_space = |b: &u8| !b.is_ascii_whitespace();
    let close = content
        .iter()
        .rposition(not_space)
        .filter(|&i| content[i] == b'}')
        .ok_or_else(|| CopyError::ManifestError("manifest is not a JSON object".to_string()))?;
    let last = content[..close]
        .iter()
        .rposition(not_space)
        .ok_or_else(|| CopyError::ManifestError("manifest is not a JSON object".to_string()))?;
    if content[last] == b',' {
        return Err(CopyError::ManifestError(
            "manifest has a trailing comma".to_string(),
        ));
    }
    let format_length = last + 1;
    let format_tail = &content[format_length..];

    let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&ProtectedHeader {
        format_length,
        format_tail: URL_SAFE_NO_PAD.encode(format_tail),
        time: time.to_string(),
    })?);
    let signing_input = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(content));
    let signature: Signature = key.sign(signing_input.as_bytes());

    let signatures = vec![JwsSignature {
        header: JwsHeader {
            jwk: jwk(key)?,
            alg: "ES256".to_string(),
        },
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        protected,
    }];
    let indented = String::from_utf8(pretty_json(&signatures, b"   ")?)
        .map_err(|e| CopyError::ManifestError(e.to_string()))?
        .replace('\n', "\n   ");

    let mut out = Vec::with_capacity(content.len() + indented.len() + 34);
    out.extend_from_slice(&content[..format_length]);
    out.extend_from_slice(b",\n   \"signatures\": ");
    out.extend_from_slice(indented.as_bytes());
    out.extend_from_slice(b"\n}");
    Ok(out)
}

fn jwk(key: &SigningKey) -> Result<serde_json::Value> {
    let public = key.verifying_key();
    let point = public.to_encoded_point(false);
    let (x, y) = match (point.x(), point.y()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(CopyError::ManifestError(
                "invalid public key point".to_string(),
            ))
        }
    };
    Ok(serde_json::json!({
        "crv": "P-256",
        "kid": key_id(public)?,
        "kty": "EC",
        "x": URL_SAFE_NO_PAD.encode(x),
        "y": URL_SAFE_NO_PAD.encode(y),
    }))
}

/// libtrust key ID: base32 of the first 240 bits of the SHA-256 of the
/// DER public key, in colon-separated groups of four.
fn key_id(public: &p256::ecdsa::VerifyingKey) -> Result<String> {
    let der = p256::PublicKey::from(public)
        .to_public_key_der()
        .map_err(|e| CopyError::ManifestError(format!("encoding public key: {e}")))?;
    let hash = Sha256::digest(der.as_bytes());
    let encoded = base32(&hash[..30]);
    let groups: Vec<&str> = encoded
        .as_bytes()
        .chunks(4)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    Ok(groups.join(":"))
}

fn base32(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
