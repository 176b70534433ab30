//! Trust policy (`policy.json`) parsing and evaluation.
//!
//! ```json
//! {
//!     "default": [{"type": "reject"}],
//!     "transports": {
//!         "docker": {
//!             "registry.example.com/team": [
//!                 {"type": "signedBy", "keyType": "GPGKeys", "keyPath": "/etc/pki/team.gpg"}
//!             ]
//!         },
//!         "dir": {"": [{"type": "insecureAcceptAnything"}]}
//!     }
//! }
//! ```
//!
//! Parsing is strict: unknown fields and malformed scopes are errors, so a
//! typo never silently weakens the policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use serde_json::{Map, Value};
use skiff_core::error::{CopyError, Result};

use super::identity::IdentityMatcher;
use super::mechanism::{EphemeralKeyring, GpgKeyring};
use crate::context::SystemContext;
use crate::transports::{image_name, ImageReference, Transport};

pub const SYSTEM_DEFAULT_POLICY_PATH: &str = "/etc/containers/policy.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    GpgKeys,
    SignedByGpgKeys,
    X509Certificates,
    SignedByX509Cas,
}

impl KeyType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "GPGKeys" => Ok(KeyType::GpgKeys),
            "signedByGPGKeys" => Ok(KeyType::SignedByGpgKeys),
            "X509Certificates" => Ok(KeyType::X509Certificates),
            "signedByX509CAs" => Ok(KeyType::SignedByX509Cas),
            other => Err(policy_err(format!("Unknown keyType \"{other}\""))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            KeyType::GpgKeys => "GPGKeys",
            KeyType::SignedByGpgKeys => "signedByGPGKeys",
            KeyType::X509Certificates => "X509Certificates",
            KeyType::SignedByX509Cas => "signedByX509CAs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Path(PathBuf),
    Data(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBy {
    pub key_type: KeyType,
    pub key: KeySource,
    pub signed_identity: IdentityMatcher,
}

/// One entry of a requirement list; all entries must accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRequirement {
    InsecureAcceptAnything,
    Reject,
    SignedBy(SignedBy),
    /// Parsed for compatibility; always rejects
    SignedBaseLayer(IdentityMatcher),
}

/// A parsed `policy.json`.
#[derive(Debug, Clone)]
pub struct Policy {
    pub default: Vec<PolicyRequirement>,
    /// transport name → scope → requirements
    pub transports: HashMap<String, HashMap<String, Vec<PolicyRequirement>>>,
}

impl Policy {
    /// A policy accepting every image (`--insecure-policy`).
    pub fn insecure_accept_anything() -> Self {
        Self {
            default: vec![PolicyRequirement::InsecureAcceptAnything],
            transports: HashMap::new(),
        }
    }

    /// Load the policy selected by `ctx`: `--policy`, then
    /// `~/.config/containers/policy.json`, then the system default.
    pub fn default_policy(ctx: &SystemContext) -> Result<Self> {
        Self::from_file(&default_policy_path(ctx))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            CopyError::PolicyError(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&data).map_err(|e| match e {
            CopyError::PolicyError(msg) => {
                CopyError::PolicyError(format!("invalid policy in \"{}\": {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data).map_err(|e| policy_err(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| policy_err("policy is not a JSON object"))?;
        check_keys(obj, &["default", "transports"], "policy")?;

        let default = parse_requirements(
            obj.get("default")
                .ok_or_else(|| policy_err("Default policy is missing"))?,
        )?;
        if default.is_empty() {
            return Err(policy_err("Default policy is empty"));
        }

        let mut transports = HashMap::new();
        if let Some(t) = obj.get("transports") {
            let t = t
                .as_object()
                .ok_or_else(|| policy_err("\"transports\" is not an object"))?;
            for (transport_name, scopes) in t {
                let transport = Transport::try_from(transport_name.as_str()).ok();
                let scopes = scopes.as_object().ok_or_else(|| {
                    policy_err(format!("transport \"{transport_name}\" is not an object"))
                })?;
                let mut parsed = HashMap::new();
                for (scope, reqs) in scopes {
                    if let Some(transport) = transport {
                        transport.validate_policy_scope(scope)?;
                    }
                    let reqs = parse_requirements(reqs)?;
                    if reqs.is_empty() {
                        return Err(policy_err(format!(
                            "Policy for transport \"{transport_name}\" scope \"{scope}\" has no requirements"
                        )));
                    }
                    parsed.insert(scope.clone(), reqs);
                }
                transports.insert(transport_name.clone(), parsed);
            }
        }

        Ok(Self {
            default,
            transports,
        })
    }
}

/// Path of the policy file a context selects.
pub fn default_policy_path(ctx: &SystemContext) -> PathBuf {
    if let Some(path) = &ctx.signature_policy_path {
        return path.clone();
    }
    if let Some(home) = dirs::home_dir() {
        let user = home.join(".config").join("containers").join("policy.json");
        if user.exists() {
            return user;
        }
    }
    PathBuf::from(SYSTEM_DEFAULT_POLICY_PATH)
}

fn policy_err(msg: impl Into<String>) -> CopyError {
    CopyError::PolicyError(msg.into())
}

fn check_keys(obj: &Map<String, Value>, allowed: &[&str], what: &str) -> Result<()> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(policy_err(format!("Unknown key \"{key}\" in {what}"))),
        None => Ok(()),
    }
}

fn parse_requirements(value: &Value) -> Result<Vec<PolicyRequirement>> {
    value
        .as_array()
        .ok_or_else(|| policy_err("policy requirements must be a list"))?
        .iter()
        .map(parse_requirement)
        .collect()
}

fn parse_requirement(value: &Value) -> Result<PolicyRequirement> {
    let obj = value
        .as_object()
        .ok_or_else(|| policy_err("policy requirement is not an object"))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| policy_err("policy requirement is missing \"type\""))?;

    match kind {
        "insecureAcceptAnything" => {
            check_keys(obj, &["type"], kind)?;
            Ok(PolicyRequirement::InsecureAcceptAnything)
        }
        "reject" => {
            check_keys(obj, &["type"], kind)?;
            Ok(PolicyRequirement::Reject)
        }
        "signedBy" => {
            check_keys(
                obj,
                &["type", "keyType", "keyPath", "keyData", "signedIdentity"],
                kind,
            )?;
            let key_type = KeyType::parse(
                obj.get("keyType")
                    .and_then(Value::as_str)
                    .ok_or_else(|| policy_err("signedBy is missing \"keyType\""))?,
            )?;
            let key = match (obj.get("keyPath"), obj.get("keyData")) {
                (Some(path), None) => KeySource::Path(PathBuf::from(
                    path.as_str()
                        .ok_or_else(|| policy_err("\"keyPath\" is not a string"))?,
                )),
                (None, Some(data)) => {
                    let data = data
                        .as_str()
                        .ok_or_else(|| policy_err("\"keyData\" is not a string"))?;
                    KeySource::Data(
                        base64::engine::general_purpose::STANDARD
                            .decode(data)
                            .map_err(|e| policy_err(format!("invalid \"keyData\": {e}")))?,
                    )
                }
                _ => {
                    return Err(policy_err(
                        "exactly one of keyPath and keyData must be specified",
                    ))
                }
            };
            let signed_identity = match obj.get("signedIdentity") {
                Some(v) => IdentityMatcher::from_json(v)?,
                None => IdentityMatcher::default(),
            };
            Ok(PolicyRequirement::SignedBy(SignedBy {
                key_type,
                key,
                signed_identity,
            }))
        }
        "signedBaseLayer" => {
            check_keys(obj, &["type", "baseLayerIdentity"], kind)?;
            let identity = obj
                .get("baseLayerIdentity")
                .ok_or_else(|| policy_err("signedBaseLayer is missing \"baseLayerIdentity\""))?;
            Ok(PolicyRequirement::SignedBaseLayer(IdentityMatcher::from_json(
                identity,
            )?))
        }
        other => Err(policy_err(format!(
            "Unknown policy requirement type \"{other}\""
        ))),
    }
}

/// An image whose manifest and signatures have not been verified yet.
pub struct UnparsedImage<'a> {
    pub reference: &'a dyn ImageReference,
    pub manifest: &'a [u8],
    pub signatures: &'a [Vec<u8>],
}

/// A policy together with what is needed to evaluate it.
pub struct PolicyContext {
    policy: Policy,
    keyring: Arc<dyn EphemeralKeyring>,
}

impl PolicyContext {
    pub fn new(policy: Policy) -> Self {
        Self::with_keyring(policy, Arc::new(GpgKeyring))
    }

    pub fn with_keyring(policy: Policy, keyring: Arc<dyn EphemeralKeyring>) -> Self {
        Self { policy, keyring }
    }

    /// Requirements for `reference`: the most specific matching scope of
    /// its transport, else the transport default `""`, else the global default.
    pub fn requirements_for(&self, reference: &dyn ImageReference) -> &[PolicyRequirement] {
        if let Some(scopes) = self.policy.transports.get(reference.transport().name()) {
            let identity = reference.policy_configuration_identity();
            let candidates = std::iter::once(identity)
                .filter(|s| !s.is_empty())
                .chain(reference.policy_configuration_namespaces())
                .chain(std::iter::once(String::new()));
            for scope in candidates {
                if let Some(reqs) = scopes.get(&scope) {
                    tracing::debug!(
                        transport = %reference.transport(),
                        scope = %scope,
                        "Using policy scope"
                    );
                    return reqs;
                }
            }
        }
        tracing::debug!("Using default policy section");
        &self.policy.default
    }

    /// `Ok` if every applicable requirement accepts the image, otherwise
    /// `PolicyRejected` with the first reason.
    pub async fn is_running_image_allowed(&self, image: &UnparsedImage<'_>) -> Result<()> {
        let requirements = self.requirements_for(image.reference);
        if requirements.is_empty() {
            return Err(CopyError::PolicyRejected(
                "policy contains no requirements".to_string(),
            ));
        }
        for requirement in requirements {
            self.evaluate(requirement, image)
                .await
                .map_err(CopyError::PolicyRejected)?;
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        requirement: &PolicyRequirement,
        image: &UnparsedImage<'_>,
    ) -> std::result::Result<(), String> {
        let name = image_name(image.reference);
        match requirement {
            PolicyRequirement::InsecureAcceptAnything => Ok(()),
            PolicyRequirement::Reject => Err(format!("Running image {name} is rejected by policy.")),
            PolicyRequirement::SignedBaseLayer(_) => {
                Err("signedBaseLayer not implemented yet!".to_string())
            }
            PolicyRequirement::SignedBy(signed_by) => self.evaluate_signed_by(signed_by, image, &name).await,
        }
    }

    async fn evaluate_signed_by(
        &self,
        signed_by: &SignedBy,
        image: &UnparsedImage<'_>,
        name: &str,
    ) -> std::result::Result<(), String> {
        if signed_by.key_type != KeyType::GpgKeys {
            return Err(format!(
                "Unimplemented \"keyType\" value \"{}\"",
                signed_by.key_type.as_str()
            ));
        }
        let docker_reference = image.reference.docker_reference();
        if signed_by.signed_identity.uses_image_reference() && docker_reference.is_none() {
            return Err(format!(
                "Docker reference match attempted on image {name} with no known Docker reference identity"
            ));
        }

        let key_data = match &signed_by.key {
            KeySource::Data(data) => data.clone(),
            KeySource::Path(path) => std::fs::read(path)
                .map_err(|e| format!("reading key {}: {}", path.display(), e))?,
        };
        let (mechanism, trusted) = self
            .keyring
            .import(&[key_data])
            .await
            .map_err(|e| e.to_string())?;
        if trusted.is_empty() {
            return Err("No public keys imported".to_string());
        }
        if image.signatures.is_empty() {
            return Err("A signature was required, but no signature exists".to_string());
        }

        let matcher = &signed_by.signed_identity;
        let identity_ok = |signed: &str| matcher.matches(docker_reference, signed);
        let mut reasons = Vec::new();
        for signature in image.signatures {
            match super::verify_signature(
                mechanism.as_ref(),
                &trusted,
                signature,
                image.manifest,
                &identity_ok,
            )
            .await
            {
                Ok(sig) => {
                    tracing::debug!(reference = %sig.docker_reference, "Signature accepted");
                    return Ok(());
                }
                Err(e) => reasons.push(e.to_string()),
            }
        }
        Err(format!(
            "None of the signatures were accepted, reasons: {}",
            reasons.join("; ")
        ))
    }
}
