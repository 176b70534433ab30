//! Conversions between single-image manifest formats.
//!
//! OCI and Docker schema 2 differ only in media types. Converting to or
//! from schema 1 needs the image config: schema 1 carries its history as
//! `v1Compatibility` strings, while schema 2 and OCI reference a config
//! blob. Conversions that synthesize blobs return them alongside the
//! manifest; they must be written before the manifest itself.

use oci_spec::image::History as ConfigHistory;
use serde_json::{json, Map, Value};
use sha2::{Digest as _, Sha256};
use skiff_core::error::{CopyError, Result};

use super::schema1::{self, FsLayer, History, Schema1};
use super::*;
use crate::digest::Digest;
use crate::reference::DockerReference;

/// A gzip stream of an empty tar archive (1024 zero bytes), used for
/// schema 1 history entries that do not change the filesystem.
pub const GZIPPED_EMPTY_LAYER: &[u8] = &[
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

/// Everything a conversion may need besides the manifest itself.
pub struct ConversionInput<'a> {
    /// Source manifest, with layer infos already updated
    pub manifest: &'a Manifest,
    /// Transferred layers, bottom first, with final digests and sizes
    pub layers: &'a [BlobInfo],
    /// Config blob contents (schema 2 and OCI sources)
    pub config: Option<&'a [u8]>,
    /// Uncompressed layer digests, bottom first (schema 1 sources)
    pub diff_ids: &'a [Option<Digest>],
    /// Destination name, recorded in schema 1 `name`/`tag`
    pub dest_reference: Option<&'a DockerReference>,
}

/// A blob created by a conversion.
#[derive(Debug, Clone)]
pub struct ExtraBlob {
    pub info: BlobInfo,
    pub data: Vec<u8>,
    pub is_config: bool,
}

/// Result of a conversion.
#[derive(Debug, Clone)]
pub struct Converted {
    pub manifest: Vec<u8>,
    pub mime_type: String,
    pub extra_blobs: Vec<ExtraBlob>,
}

/// Convert `input.manifest` to `target`.
pub fn convert(input: &ConversionInput<'_>, target: &str) -> Result<Converted> {
    match target {
        OCI_MANIFEST_MEDIA_TYPE => {
            let (oci, extra) = match input.manifest {
                Manifest::Oci(m) => (m.clone(), Vec::new()),
                Manifest::Schema2(m) => (oci_from_schema2(m)?, Vec::new()),
                Manifest::Schema1(m) => {
                    let (s2, extra) = schema2_from_schema1(m, input)?;
                    (oci_from_schema2(&s2)?, relabel_config(extra, OCI_CONFIG_MEDIA_TYPE))
                }
            };
            Ok(Converted {
                manifest: serde_json::to_vec(&oci)?,
                mime_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
                extra_blobs: extra,
            })
        }
        DOCKER_V2_SCHEMA2_MEDIA_TYPE => {
            let (s2, extra) = match input.manifest {
                Manifest::Schema2(m) => (m.clone(), Vec::new()),
                Manifest::Oci(m) => (schema2_from_oci(m)?, Vec::new()),
                Manifest::Schema1(m) => schema2_from_schema1(m, input)?,
            };
            Ok(Converted {
                manifest: serde_json::to_vec(&s2)?,
                mime_type: DOCKER_V2_SCHEMA2_MEDIA_TYPE.to_string(),
                extra_blobs: extra,
            })
        }
        DOCKER_V2_SCHEMA1_MEDIA_TYPE | DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE => {
            let (mut s1, extra) = match input.manifest {
                Manifest::Schema1(m) => (m.clone(), Vec::new()),
                Manifest::Schema2(_) | Manifest::Oci(_) => schema1_from_image(input)?,
            };
            if let Some(dest) = input.dest_reference {
                s1.name = dest.repository_path().to_string();
                s1.tag = dest.tag.clone().unwrap_or_default();
            }
            let unsigned = s1.serialize_unsigned()?;
            let manifest = if target == DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE {
                schema1::sign(&unsigned)?
            } else {
                unsigned
            };
            Ok(Converted {
                manifest,
                mime_type: target.to_string(),
                extra_blobs: extra,
            })
        }
        other => Err(CopyError::ManifestError(format!(
            "conversion of manifest from {} to {other} is not implemented",
            input.manifest.mime_type()
        ))),
    }
}

fn oci_layer_type(docker: &str) -> Result<String> {
    Ok(match docker {
        DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE => OCI_LAYER_GZIP_MEDIA_TYPE,
        DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE => OCI_LAYER_MEDIA_TYPE,
        DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE => OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE,
        other => {
            return Err(CopyError::ManifestError(format!(
                "unknown media type during manifest conversion: \"{other}\""
            )))
        }
    }
    .to_string())
}

fn docker_layer_type(oci: &str) -> Result<String> {
    Ok(match oci {
        OCI_LAYER_GZIP_MEDIA_TYPE => DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE,
        OCI_LAYER_MEDIA_TYPE => DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE,
        OCI_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE => DOCKER_V2_SCHEMA2_FOREIGN_LAYER_MEDIA_TYPE,
        OCI_LAYER_ZSTD_MEDIA_TYPE => {
            return Err(CopyError::ManifestError(
                "zstd-compressed layers can not be represented in Docker schema 2".to_string(),
            ))
        }
        other => {
            return Err(CopyError::ManifestError(format!(
                "unknown media type during manifest conversion: \"{other}\""
            )))
        }
    }
    .to_string())
}

fn oci_from_schema2(m: &Schema2) -> Result<OciManifest> {
    let mut config = m.config.clone();
    config.media_type = OCI_CONFIG_MEDIA_TYPE.to_string();
    let layers = m
        .layers
        .iter()
        .map(|l| {
            let mut l = l.clone();
            l.media_type = oci_layer_type(&l.media_type)?;
            Ok(l)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(OciManifest::new(config, layers))
}

fn schema2_from_oci(m: &OciManifest) -> Result<Schema2> {
    let mut config = m.config.clone();
    config.media_type = DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE.to_string();
    let layers = m
        .layers
        .iter()
        .map(|l| {
            let mut l = l.clone();
            l.media_type = docker_layer_type(&l.media_type)?;
            l.annotations = None;
            Ok(l)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema2::new(config, layers))
}

fn relabel_config(mut blobs: Vec<ExtraBlob>, media_type: &str) -> Vec<ExtraBlob> {
    for blob in blobs.iter_mut().filter(|b| b.is_config) {
        blob.info.media_type = media_type.to_string();
    }
    blobs
}

/// Build a schema 2 manifest and config from a schema 1 manifest.
fn schema2_from_schema1(s1: &Schema1, input: &ConversionInput<'_>) -> Result<(Schema2, Vec<ExtraBlob>)> {
    let compat = s1.v1_compatibility()?;
    if input.layers.len() != compat.len() {
        return Err(CopyError::ManifestError(format!(
            "schema 1 manifest has {} layers, {} were copied",
            compat.len(),
            input.layers.len()
        )));
    }

    let mut layers = Vec::new();
    let mut diff_ids = Vec::new();
    let mut history = Vec::new();
    // compat is top first; layers and diff IDs are bottom first.
    for (i, entry) in compat.iter().rev().enumerate() {
        let mut h = ConfigHistory::default();
        h.set_created(entry.created.clone());
        h.set_author(entry.author.clone());
        h.set_comment(entry.comment.clone());
        h.set_created_by(entry.container_config.cmd.as_ref().map(|c| c.join(" ")));
        if entry.throwaway {
            h.set_empty_layer(Some(true));
        } else {
            let info = &input.layers[i];
            let diff_id = input.diff_ids.get(i).cloned().flatten().ok_or_else(|| {
                CopyError::ManifestError(format!(
                    "missing uncompressed digest for layer {}",
                    info.digest
                ))
            })?;
            let mut layer = Descriptor::from_blob_info(info);
            if !layer.media_type.starts_with("application/vnd.docker.") {
                layer.media_type = DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE.to_string();
            }
            layers.push(layer);
            diff_ids.push(diff_id.to_string());
        }
        history.push(serde_json::to_value(&h)?);
    }

    let top = s1
        .history
        .first()
        .map(|h| h.v1_compatibility.as_str())
        .unwrap_or("{}");
    let mut config: Map<String, Value> = serde_json::from_str(top)?;
    for key in ["id", "parent", "Size", "parent_id", "layer_id", "throwaway"] {
        config.remove(key);
    }
    config.insert("rootfs".to_string(), json!({"type": "layers", "diff_ids": diff_ids}));
    config.insert("history".to_string(), Value::Array(history));

    let data = serde_json::to_vec(&config)?;
    let info = BlobInfo::new(
        Digest::from_bytes(&data),
        data.len() as i64,
        DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE,
    );
    let manifest = Schema2::new(Descriptor::from_blob_info(&info), layers);
    Ok((
        manifest,
        vec![ExtraBlob {
            info,
            data,
            is_config: true,
        }],
    ))
}

/// Build a schema 1 manifest from a schema 2 or OCI manifest and its config.
fn schema1_from_image(input: &ConversionInput<'_>) -> Result<(Schema1, Vec<ExtraBlob>)> {
    let config_bytes = input.config.ok_or_else(|| {
        CopyError::ManifestError("converting to schema 1 requires the image config".to_string())
    })?;
    let mut config: Map<String, Value> = serde_json::from_slice(config_bytes)?;
    let mut history: Vec<ConfigHistory> = match config.get("history") {
        Some(h) if !h.is_null() => serde_json::from_value(h.clone())?,
        _ => Vec::new(),
    };
    if history.is_empty() {
        history = input.layers.iter().map(|_| ConfigHistory::default()).collect();
    }

    let architecture = config
        .get("architecture")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    config.remove("history");
    config.remove("rootfs");

    let mut next_layer = 0;
    let mut need_empty_layer = false;
    let mut blob_sums = Vec::with_capacity(history.len());
    for entry in &history {
        if entry.empty_layer().unwrap_or(false) {
            blob_sums.push((Digest::from_bytes(GZIPPED_EMPTY_LAYER), true));
            need_empty_layer = true;
        } else {
            let layer = input.layers.get(next_layer).ok_or_else(|| {
                CopyError::ManifestError(
                    "image config history lists more non-empty layers than the manifest".to_string(),
                )
            })?;
            blob_sums.push((layer.digest.clone(), false));
            next_layer += 1;
        }
    }
    if next_layer != input.layers.len() {
        return Err(CopyError::ManifestError(format!(
            "image config history lists {next_layer} non-empty layers, manifest has {}",
            input.layers.len()
        )));
    }

    let mut parent = String::new();
    let mut fs_layers = Vec::with_capacity(history.len());
    let mut v1_history = Vec::with_capacity(history.len());
    let last = history.len().saturating_sub(1);
    for (i, (entry, (blob_sum, throwaway))) in history.iter().zip(&blob_sums).enumerate() {
        let id = hex::encode(Sha256::digest(format!("{} {}", blob_sum.hex(), parent)));
        let mut v1 = if i == last {
            config.clone()
        } else {
            let mut m = Map::new();
            if let Some(comment) = entry.comment() {
                m.insert("comment".to_string(), json!(comment));
            }
            if let Some(created) = entry.created() {
                m.insert("created".to_string(), json!(created));
            }
            if let Some(created_by) = entry.created_by() {
                m.insert("container_config".to_string(), json!({"Cmd": [created_by]}));
            }
            if let Some(author) = entry.author() {
                m.insert("author".to_string(), json!(author));
            }
            m
        };
        v1.insert("id".to_string(), json!(id));
        if !parent.is_empty() {
            v1.insert("parent".to_string(), json!(parent));
        }
        if *throwaway {
            v1.insert("throwaway".to_string(), json!(true));
        }

        fs_layers.push(FsLayer {
            blob_sum: blob_sum.clone(),
        });
        v1_history.push(History {
            v1_compatibility: serde_json::to_string(&v1)?,
        });
        parent = id;
    }
    fs_layers.reverse();
    v1_history.reverse();

    let s1 = Schema1 {
        schema_version: 1,
        name: String::new(),
        tag: String::new(),
        architecture,
        fs_layers,
        history: v1_history,
    };
    let extra = if need_empty_layer {
        vec![ExtraBlob {
            info: BlobInfo::new(
                Digest::from_bytes(GZIPPED_EMPTY_LAYER),
                GZIPPED_EMPTY_LAYER.len() as i64,
                DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE,
            ),
            data: GZIPPED_EMPTY_LAYER.to_vec(),
            is_config: false,
        }]
    } else {
        Vec::new()
    };
    Ok((s1, extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(data: &[u8], media_type: &str) -> BlobInfo {
        BlobInfo::new(Digest::from_bytes(data), data.len() as i64, media_type)
    }

    fn schema2_with_config() -> (Manifest, Vec<u8>, Vec<BlobInfo>) {
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Cmd": ["sh"]},
            "rootfs": {"type": "layers", "diff_ids": [
                Digest::from_bytes(b"base-tar").to_string(),
                Digest::from_bytes(b"app-tar").to_string(),
            ]},
            "history": [
                {"created": "2024-01-01T00:00:00Z", "created_by": "ADD base"},
                {"created": "2024-01-02T00:00:00Z", "created_by": "ENV A=b", "empty_layer": true},
                {"created": "2024-01-03T00:00:00Z", "created_by": "COPY app"}
            ]
        }))
        .unwrap();
        let layers = vec![
            layer(b"base", DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE),
            layer(b"app", DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE),
        ];
        let m = Schema2::new(
            Descriptor::from_blob_info(&BlobInfo::new(
                Digest::from_bytes(&config),
                config.len() as i64,
                DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE,
            )),
            layers.iter().map(Descriptor::from_blob_info).collect(),
        );
        (Manifest::Schema2(m), config, layers)
    }

    #[test]
    fn test_schema2_to_oci_and_back() {
        let (manifest, config, layers) = schema2_with_config();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers,
            config: Some(&config),
            diff_ids: &[],
            dest_reference: None,
        };
        let oci = convert(&input, OCI_MANIFEST_MEDIA_TYPE).unwrap();
        assert!(oci.extra_blobs.is_empty());
        let parsed = OciManifest::from_blob(&oci.manifest).unwrap();
        assert_eq!(parsed.config.media_type, OCI_CONFIG_MEDIA_TYPE);
        assert_eq!(parsed.layers[0].media_type, OCI_LAYER_GZIP_MEDIA_TYPE);

        let back_manifest = Manifest::Oci(parsed);
        let input = ConversionInput {
            manifest: &back_manifest,
            ..input
        };
        let s2 = convert(&input, DOCKER_V2_SCHEMA2_MEDIA_TYPE).unwrap();
        let parsed = Schema2::from_blob(&s2.manifest).unwrap();
        assert_eq!(parsed.config.media_type, DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE);
        assert_eq!(parsed.layers[1].media_type, DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE);
    }

    #[test]
    fn test_oci_zstd_rejected_for_schema2() {
        let zstd = layer(b"z", OCI_LAYER_ZSTD_MEDIA_TYPE);
        let m = Manifest::Oci(OciManifest::new(
            Descriptor::from_blob_info(&layer(b"{}", OCI_CONFIG_MEDIA_TYPE)),
            vec![Descriptor::from_blob_info(&zstd)],
        ));
        let input = ConversionInput {
            manifest: &m,
            layers: std::slice::from_ref(&zstd),
            config: None,
            diff_ids: &[],
            dest_reference: None,
        };
        let err = convert(&input, DOCKER_V2_SCHEMA2_MEDIA_TYPE).unwrap_err();
        assert!(err.to_string().contains("zstd"));
    }

    #[test]
    fn test_schema2_to_schema1() {
        let (manifest, config, layers) = schema2_with_config();
        let dest = DockerReference::parse_normalized_named("registry.example.com/ns/app:v1").unwrap();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers,
            config: Some(&config),
            diff_ids: &[],
            dest_reference: Some(&dest),
        };
        let out = convert(&input, DOCKER_V2_SCHEMA1_MEDIA_TYPE).unwrap();
        assert_eq!(out.mime_type, DOCKER_V2_SCHEMA1_MEDIA_TYPE);
        assert_eq!(out.extra_blobs.len(), 1);
        assert_eq!(out.extra_blobs[0].data, GZIPPED_EMPTY_LAYER);

        let s1 = Schema1::from_blob(&out.manifest).unwrap();
        assert_eq!(s1.name, "ns/app");
        assert_eq!(s1.tag, "v1");
        assert_eq!(s1.architecture, "amd64");
        assert_eq!(s1.fs_layers.len(), 3);
        // top first
        assert_eq!(s1.fs_layers[0].blob_sum, layers[1].digest);
        assert_eq!(s1.fs_layers[1].blob_sum, Digest::from_bytes(GZIPPED_EMPTY_LAYER));
        assert_eq!(s1.fs_layers[2].blob_sum, layers[0].digest);

        let compat = s1.v1_compatibility().unwrap();
        assert!(compat[1].throwaway);
        assert_eq!(compat[0].parent, compat[1].id);
        assert_eq!(compat[1].parent, compat[2].id);
        assert!(compat[2].parent.is_empty());

        let top: Value = serde_json::from_str(&s1.history[0].v1_compatibility).unwrap();
        assert!(top.get("rootfs").is_none());
        assert_eq!(top["config"]["Cmd"][0], "sh");
    }

    #[test]
    fn test_schema2_to_schema1_signed() {
        let (manifest, config, layers) = schema2_with_config();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers,
            config: Some(&config),
            diff_ids: &[],
            dest_reference: None,
        };
        let out = convert(&input, DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE).unwrap();
        assert_eq!(guess_mime_type(&out.manifest), DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE);
    }

    #[test]
    fn test_history_layer_count_mismatch() {
        let (manifest, config, layers) = schema2_with_config();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers[..1],
            config: Some(&config),
            diff_ids: &[],
            dest_reference: None,
        };
        assert!(convert(&input, DOCKER_V2_SCHEMA1_MEDIA_TYPE).is_err());
    }

    #[test]
    fn test_schema1_to_schema2() {
        let (manifest, config, layers) = schema2_with_config();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers,
            config: Some(&config),
            diff_ids: &[],
            dest_reference: None,
        };
        let s1_blob = convert(&input, DOCKER_V2_SCHEMA1_MEDIA_TYPE).unwrap().manifest;
        let s1 = Manifest::from_blob(&s1_blob, DOCKER_V2_SCHEMA1_MEDIA_TYPE).unwrap();

        let s1_layers: Vec<BlobInfo> = s1
            .layer_infos()
            .unwrap()
            .into_iter()
            .map(|l| l.info)
            .collect();
        let diff_ids = vec![
            Some(Digest::from_bytes(b"base-tar")),
            None,
            Some(Digest::from_bytes(b"app-tar")),
        ];
        let input = ConversionInput {
            manifest: &s1,
            layers: &s1_layers,
            config: None,
            diff_ids: &diff_ids,
            dest_reference: None,
        };
        let out = convert(&input, DOCKER_V2_SCHEMA2_MEDIA_TYPE).unwrap();
        let s2 = Schema2::from_blob(&out.manifest).unwrap();
        assert_eq!(s2.layers.len(), 2);
        assert_eq!(s2.layers[0].digest, layers[0].digest);

        let config_blob = &out.extra_blobs[0];
        assert!(config_blob.is_config);
        assert_eq!(s2.config.digest, config_blob.info.digest);
        let cfg: Value = serde_json::from_slice(&config_blob.data).unwrap();
        assert_eq!(cfg["rootfs"]["diff_ids"].as_array().unwrap().len(), 2);
        assert_eq!(cfg["history"].as_array().unwrap().len(), 3);
        assert_eq!(cfg["history"][1]["empty_layer"], true);
        assert!(cfg.get("id").is_none());

        let oci = convert(&input, OCI_MANIFEST_MEDIA_TYPE).unwrap();
        assert_eq!(oci.extra_blobs[0].info.media_type, OCI_CONFIG_MEDIA_TYPE);
    }

    #[test]
    fn test_schema1_to_schema2_requires_diff_ids() {
        let (manifest, config, layers) = schema2_with_config();
        let input = ConversionInput {
            manifest: &manifest,
            layers: &layers,
            config: Some(&config),
            diff_ids: &[],
            dest_reference: None,
        };
        let s1_blob = convert(&input, DOCKER_V2_SCHEMA1_MEDIA_TYPE).unwrap().manifest;
        let s1 = Manifest::from_blob(&s1_blob, "").unwrap();
        let s1_layers: Vec<BlobInfo> = s1.layer_infos().unwrap().into_iter().map(|l| l.info).collect();
        let input = ConversionInput {
            manifest: &s1,
            layers: &s1_layers,
            config: None,
            diff_ids: &[],
            dest_reference: None,
        };
        let err = convert(&input, DOCKER_V2_SCHEMA2_MEDIA_TYPE).unwrap_err();
        assert!(err.to_string().contains("missing uncompressed digest"));
    }
}
