//! Copying an image between two transports.
//!
//! [`copy_image`] checks the source against the trust policy, transfers the
//! config and layers, writes a manifest the destination accepts (converting
//! it when needed), optionally signs it and commits the destination.

pub mod blob;
pub mod choice;
pub mod progress;

pub use blob::{BlobCopier, CopiedLayer};
pub use choice::{determine_manifest_conversion, ManifestChoice};
pub use progress::Reporter;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use skiff_core::error::{CopyError, Result};

use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::{self, convert, BlobInfo, ConversionInput, Manifest, ManifestList};
use crate::reference::DockerReference;
use crate::signature::{
    self, GpgMechanism, PolicyContext, PolicyRequirement, SigningMechanism, UnparsedImage,
};
use crate::transports::{image_name, ImageDestination, ImageReference};

/// Layers transferred concurrently unless configured otherwise.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 6;

/// Options for [`copy_image`].
pub struct CopyOptions {
    /// Drop source signatures instead of copying them
    pub remove_signatures: bool,
    /// Key identity to sign the written manifest with
    pub sign_by: Option<String>,
    /// Where progress lines go; `None` is silent
    pub report_writer: Option<Box<dyn Write + Send>>,
    pub source_ctx: SystemContext,
    pub destination_ctx: SystemContext,
    /// Write exactly this manifest type
    pub force_manifest_mime_type: Option<String>,
    pub max_parallel_downloads: usize,
    /// Signing mechanism; GPG when unset
    pub signer: Option<Arc<dyn SigningMechanism>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            remove_signatures: false,
            sign_by: None,
            report_writer: None,
            source_ctx: SystemContext::default(),
            destination_ctx: SystemContext::default(),
            force_manifest_mime_type: None,
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            signer: None,
        }
    }
}

/// Copy the image at `src_ref` to `dest_ref`, returning the manifest that
/// was written.
pub async fn copy_image(
    policy_ctx: &PolicyContext,
    dest_ref: &dyn ImageReference,
    src_ref: &dyn ImageReference,
    mut options: CopyOptions,
) -> Result<Vec<u8>> {
    let reporter = Reporter::new(options.report_writer.take());
    let src_name = image_name(src_ref);
    let dest_name = image_name(dest_ref);
    tracing::info!(source = %src_name, destination = %dest_name, "Copying image");

    let dest_docker_ref = match &options.sign_by {
        Some(_) => Some(dest_ref.docker_reference().cloned().ok_or_else(|| {
            CopyError::SignatureError(format!(
                "Cannot determine canonical Docker reference for destination {dest_name}"
            ))
        })?),
        None => None,
    };

    let mut dest = dest_ref
        .new_image_destination(&options.destination_ctx)
        .await?;
    let src = src_ref.new_image_source(&options.source_ctx).await?;

    let (top_manifest, top_type) = src.get_manifest(None).await?;
    let top_type = manifest::normalize_mime_type(&top_type, &top_manifest);

    let policy_needs_signatures = policy_ctx
        .requirements_for(src_ref)
        .iter()
        .any(|r| matches!(r, PolicyRequirement::SignedBy(_)));
    let mut signatures = Vec::new();
    if !options.remove_signatures || policy_needs_signatures {
        if !options.remove_signatures {
            reporter.line("Getting image source signatures");
        }
        signatures = src.get_signatures(None).await?;
    }

    policy_ctx
        .is_running_image_allowed(&UnparsedImage {
            reference: src_ref,
            manifest: &top_manifest,
            signatures: &signatures,
        })
        .await?;
    if options.remove_signatures {
        signatures.clear();
    }

    if !signatures.is_empty() || options.sign_by.is_some() {
        dest.signature_support().map_err(|e| {
            CopyError::Other(format!("Can not copy signatures to {dest_name}: {e}"))
        })?;
    }
    let can_modify_manifest = signatures.is_empty();

    let (manifest_bytes, manifest_type) = if manifest::is_list(&top_type) {
        if !can_modify_manifest {
            return Err(CopyError::ManifestError(
                "Choosing an image from a manifest list is required, but signatures of the list can not be preserved; use --remove-signatures".to_string(),
            ));
        }
        let list = ManifestList::from_blob(&top_manifest, &top_type)?;
        let digest = list.choose_instance(
            &options.source_ctx.platform_os(),
            &options.source_ctx.platform_architecture(),
            None,
        )?;
        tracing::debug!(instance = %digest, "Chose image from manifest list");
        let (bytes, mime_type) = src.get_manifest(Some(&digest)).await?;
        if !manifest::matches_digest(&bytes, &digest)? {
            return Err(CopyError::DigestMismatch {
                expected: digest.to_string(),
                actual: manifest::manifest_digest(&bytes)?.to_string(),
            });
        }
        let mime_type = manifest::normalize_mime_type(&mime_type, &bytes);
        (bytes, mime_type)
    } else {
        (top_manifest, top_type)
    };

    let mut parsed = Manifest::from_blob(&manifest_bytes, &manifest_type)?;
    let choice = determine_manifest_conversion(
        &manifest_type,
        &dest.supported_manifest_mime_types(),
        options.force_manifest_mime_type.as_deref(),
    )?;
    let choice = if can_modify_manifest {
        choice
    } else if choice.is_conversion(&manifest_type) {
        return Err(CopyError::ManifestError(format!(
            "Manifest conversion from {} to {} is required, but the manifest can not be modified while copying signatures; use --remove-signatures",
            manifest_type, choice.preferred
        )));
    } else {
        ManifestChoice {
            preferred: choice.preferred,
            fallbacks: Vec::new(),
        }
    };

    let compression = if can_modify_manifest {
        dest.desired_layer_compression()
    } else {
        LayerCompression::Preserve
    };
    let compute_diff_ids = can_modify_manifest
        && manifest::is_schema1(&manifest_type)
        && choice.candidates().any(|c| !manifest::is_schema1(c));

    let spool = tempfile::Builder::new().prefix("skiff-copy").tempdir()?;
    let mut copier = BlobCopier::new(src.as_ref(), dest.as_ref(), &reporter, spool.path());
    copier.compression = compression;
    copier.compute_diff_ids = compute_diff_ids;

    let config = match parsed.config_info() {
        Some(info) => Some(copier.copy_config(&info).await?.1),
        None => None,
    };
    let layers = parsed.layer_infos()?;
    let copied = copier
        .copy_layers(&layers, options.max_parallel_downloads)
        .await?;

    let edited = layers.iter().zip(&copied).any(|(before, after)| {
        before.info.digest != after.info.digest
            || before.info.media_type != after.info.media_type
            || (before.info.size >= 0 && before.info.size != after.info.size)
    });
    let layer_infos: Vec<BlobInfo> = copied.iter().map(|c| c.info.clone()).collect();
    if edited {
        if !can_modify_manifest {
            return Err(CopyError::Other(
                "layers changed while copying, but the manifest can not be modified".to_string(),
            ));
        }
        parsed.update_layer_infos(&layer_infos)?;
    }
    let diff_ids: Vec<Option<Digest>> = copied.iter().map(|c| c.diff_id.clone()).collect();

    let writer = ManifestWriter {
        dest: dest.as_ref(),
        reporter: &reporter,
        spool: spool.path(),
        original: (manifest_bytes.as_slice(), manifest_type.as_str()),
        edited,
        input: ConversionInput {
            manifest: &parsed,
            layers: &layer_infos,
            config: config.as_deref(),
            diff_ids: &diff_ids,
            dest_reference: dest_ref.docker_reference(),
        },
    };
    let written = writer.write(&choice).await?;

    if let (Some(key), Some(dest_docker_ref)) = (&options.sign_by, &dest_docker_ref) {
        let mechanism: Arc<dyn SigningMechanism> = match &options.signer {
            Some(signer) => signer.clone(),
            None => Arc::new(GpgMechanism::new()),
        };
        reporter.line("Signing manifest");
        let signature = sign(mechanism.as_ref(), &written, dest_docker_ref, key).await?;
        signatures.push(signature);
    }

    reporter.line("Storing signatures");
    dest.put_signatures(&signatures).await?;
    dest.commit().await?;
    tracing::info!(destination = %dest_name, "Image copied");
    Ok(written)
}

/// Sign `manifest` and check that the result verifies as expected.
async fn sign(
    mechanism: &dyn SigningMechanism,
    manifest: &[u8],
    docker_reference: &DockerReference,
    key: &str,
) -> Result<Vec<u8>> {
    let signature = signature::sign_docker_manifest(mechanism, manifest, docker_reference, key)
        .await
        .map_err(|e| CopyError::SignatureError(format!("creating signature: {e}")))?;
    let expected = docker_reference.to_string();
    signature::verify_signature(mechanism, &[], &signature, manifest, &|signed: &str| {
        signed == expected
    })
    .await
    .map_err(|e| CopyError::SignatureError(format!("verifying the created signature: {e}")))?;
    Ok(signature)
}

/// Writes the manifest, trying each candidate type in turn.
struct ManifestWriter<'a> {
    dest: &'a dyn ImageDestination,
    reporter: &'a Reporter,
    spool: &'a Path,
    original: (&'a [u8], &'a str),
    edited: bool,
    input: ConversionInput<'a>,
}

impl ManifestWriter<'_> {
    async fn write(&self, choice: &ManifestChoice) -> Result<Vec<u8>> {
        match self.write_as(&choice.preferred).await {
            Ok(written) => return Ok(written),
            Err(e @ CopyError::ManifestTypeRejected { .. }) if !choice.fallbacks.is_empty() => {
                tracing::info!(
                    mime_type = %choice.preferred,
                    error = %e,
                    "Manifest type rejected, trying other formats"
                );
                let mut attempts = vec![format!("{}({})", choice.preferred, e)];
                for candidate in &choice.fallbacks {
                    match self.write_as(candidate).await {
                        Ok(written) => return Ok(written),
                        Err(e) => {
                            tracing::debug!(mime_type = %candidate, error = %e, "Manifest upload failed");
                            attempts.push(format!("{candidate}({e})"));
                        }
                    }
                }
                Err(CopyError::ManifestError(format!(
                    "Uploading manifest failed, attempted the following formats: {}",
                    attempts.join(", ")
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn write_as(&self, mime_type: &str) -> Result<Vec<u8>> {
        let (original, original_type) = self.original;
        let (bytes, mime_type) = if !self.edited && mime_type == original_type {
            (original.to_vec(), original_type.to_string())
        } else {
            let converted = convert(&self.input, mime_type)?;
            for extra in &converted.extra_blobs {
                self.put_extra_blob(&extra.info, &extra.data, extra.is_config)
                    .await?;
            }
            (converted.manifest, converted.mime_type)
        };

        self.reporter.line("Writing manifest to image destination");
        self.dest.put_manifest(&bytes, &mime_type).await?;
        Ok(bytes)
    }

    async fn put_extra_blob(&self, info: &BlobInfo, data: &[u8], is_config: bool) -> Result<()> {
        if self.dest.try_reuse_blob(info).await?.is_some() {
            return Ok(());
        }
        let file = tempfile::NamedTempFile::new_in(self.spool)?;
        tokio::fs::write(file.path(), data).await?;
        self.dest.put_blob(file.path(), info, is_config).await?;
        Ok(())
    }
}
