//! `skiff copy` command.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory};
use skiff_core::CopyError;
use skiff_image::manifest::{
    DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE, DOCKER_V2_SCHEMA2_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use skiff_image::{
    copy_image, list_names, parse_image_name, CopyOptions, DockerAuthConfig, DockerReference,
    SystemContext,
};

use super::{run_with_timeout, Cli, GlobalArgs};

/// Description shown by `skiff copy --help`.
pub(crate) fn long_about() -> String {
    format!(
        "Container \"IMAGE-NAME\" uses a \"transport\":\"details\" format.\n\n\
         Supported transports:\n{}\n\n\
         See skiff(1) section \"IMAGE NAMES\" for the expected format",
        list_names().join(", ")
    )
}

#[derive(Args, Debug)]
pub struct CopyArgs {
    /// SOURCE-IMAGE DESTINATION-IMAGE
    #[arg(value_name = "IMAGE")]
    pub images: Vec<String>,

    /// Additional tags (supports docker-archive)
    #[arg(long = "additional-tag", value_name = "TAG")]
    pub additional_tags: Vec<String>,

    /// Path of the authentication file. Default is ${XDG_RUNTIME_DIR}/containers/auth.json
    #[arg(long, value_name = "PATH")]
    pub authfile: Option<PathBuf>,

    /// Do not copy signatures from SOURCE-IMAGE
    #[arg(long)]
    pub remove_signatures: bool,

    /// Sign the image using a GPG key with the specified FINGERPRINT
    #[arg(long, value_name = "FINGERPRINT")]
    pub sign_by: Option<String>,

    /// Use USERNAME[:PASSWORD] for accessing the source registry
    #[arg(long, visible_alias = "screds", value_name = "USERNAME[:PASSWORD]")]
    pub src_creds: Option<String>,

    /// Use USERNAME[:PASSWORD] for accessing the destination registry
    #[arg(long, visible_alias = "dcreds", value_name = "USERNAME[:PASSWORD]")]
    pub dest_creds: Option<String>,

    /// Use certificates at PATH (*.crt, *.cert, *.key) to connect to the source registry or daemon
    #[arg(long, value_name = "PATH")]
    pub src_cert_dir: Option<PathBuf>,

    /// Use certificates at PATH (*.crt, *.cert, *.key) to connect to the destination registry or daemon
    #[arg(long, value_name = "PATH")]
    pub dest_cert_dir: Option<PathBuf>,

    /// Require HTTPS and verify certificates when talking to the source registry or daemon
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub src_tls_verify: bool,

    /// Require HTTPS and verify certificates when talking to the destination registry or daemon
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub dest_tls_verify: bool,

    /// Temporary directory to use for OSTree commits
    #[arg(long, value_name = "DIR")]
    pub dest_ostree_tmp_dir: Option<PathBuf>,

    /// Directory to use to share blobs across OCI repositories
    #[arg(long, value_name = "DIR")]
    pub src_shared_blob_dir: Option<PathBuf>,

    /// Directory to use to share blobs across OCI repositories
    #[arg(long, value_name = "DIR")]
    pub dest_shared_blob_dir: Option<PathBuf>,

    /// MANIFEST TYPE (oci, v2s1, or v2s2) to use when saving image to directory using the 'dir:' transport (default is manifest type of source)
    #[arg(short = 'f', long, value_name = "MANIFEST TYPE")]
    pub format: Option<String>,

    /// Compress tarball image layers when saving to directory using the 'dir' transport. (default is same compression type as source)
    #[arg(long)]
    pub dest_compress: bool,

    /// Use docker daemon host at HOST (docker-daemon sources only)
    #[arg(long, value_name = "HOST")]
    pub src_daemon_host: Option<String>,

    /// Use docker daemon host at HOST (docker-daemon destinations only)
    #[arg(long, value_name = "HOST")]
    pub dest_daemon_host: Option<String>,
}

pub async fn execute(args: CopyArgs, global: &GlobalArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.images.len() != 2 {
        let mut cmd = Cli::command();
        if let Some(copy) = cmd.find_subcommand_mut("copy") {
            let _ = copy.print_help();
        }
        return Err("Exactly two arguments expected".into());
    }

    let policy_ctx = global
        .policy_context()
        .map_err(|e| format!("Error loading trust policy: {e}"))?;

    let src_ref = parse_image_name(&args.images[0])
        .map_err(|e| format!("Invalid source name {}: {e}", args.images[0]))?;
    let dest_ref = parse_image_name(&args.images[1])
        .map_err(|e| format!("Invalid destination name {}: {e}", args.images[1]))?;

    let (source_ctx, mut destination_ctx) = contexts_from_global_options(global, &args)?;

    let force_manifest_mime_type = args
        .format
        .as_deref()
        .map(manifest_type_for_format)
        .transpose()?;

    for tag in &args.additional_tags {
        destination_ctx
            .docker_archive_additional_tags
            .push(parse_additional_tag(tag)?);
    }

    let options = CopyOptions {
        remove_signatures: args.remove_signatures,
        sign_by: args.sign_by.clone(),
        report_writer: Some(Box::new(std::io::stdout())),
        source_ctx,
        destination_ctx,
        force_manifest_mime_type,
        ..Default::default()
    };

    tracing::debug!(
        source = %args.images[0],
        destination = %args.images[1],
        "Starting copy"
    );
    run_with_timeout(
        copy_image(&policy_ctx, dest_ref.as_ref(), src_ref.as_ref(), options),
        global.command_timeout,
    )
    .await?;
    Ok(())
}

/// Build the source and destination contexts from the `src-`/`dest-`
/// prefixed flags and the global flags.
pub(crate) fn contexts_from_global_options(
    global: &GlobalArgs,
    args: &CopyArgs,
) -> Result<(SystemContext, SystemContext), Box<dyn std::error::Error>> {
    let shared = SystemContext {
        signature_policy_path: global.policy.clone(),
        registries_dir_path: global.registries_d.clone(),
        auth_file_path: args.authfile.clone(),
        architecture_choice: global.override_arch.clone(),
        os_choice: global.override_os.clone(),
        ..Default::default()
    };

    let source = SystemContext {
        docker_auth_config: args.src_creds.as_deref().map(parse_creds).transpose()?,
        docker_cert_path: args.src_cert_dir.clone(),
        docker_insecure_skip_tls_verify: !args.src_tls_verify,
        docker_daemon_host: args.src_daemon_host.clone(),
        docker_daemon_cert_path: args.src_cert_dir.clone(),
        docker_daemon_insecure_skip_tls_verify: !args.src_tls_verify,
        oci_shared_blob_dir: args.src_shared_blob_dir.clone(),
        ..shared.clone()
    };

    let destination = SystemContext {
        docker_auth_config: args.dest_creds.as_deref().map(parse_creds).transpose()?,
        docker_cert_path: args.dest_cert_dir.clone(),
        docker_insecure_skip_tls_verify: !args.dest_tls_verify,
        docker_daemon_host: args.dest_daemon_host.clone(),
        docker_daemon_cert_path: args.dest_cert_dir.clone(),
        docker_daemon_insecure_skip_tls_verify: !args.dest_tls_verify,
        oci_shared_blob_dir: args.dest_shared_blob_dir.clone(),
        ostree_tmp_dir: args.dest_ostree_tmp_dir.clone(),
        dir_force_compress: args.dest_compress,
        ..shared
    };

    Ok((source, destination))
}

fn manifest_type_for_format(format: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mime_type = match format {
        "oci" => OCI_MANIFEST_MEDIA_TYPE,
        "v2s1" => DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
        "v2s2" => DOCKER_V2_SCHEMA2_MEDIA_TYPE,
        other => {
            return Err(format!(
                "unknown format \"{other}\". Choose one of the supported formats: 'oci', 'v2s1', or 'v2s2'"
            )
            .into())
        }
    };
    Ok(mime_type.to_string())
}

fn parse_additional_tag(tag: &str) -> Result<DockerReference, Box<dyn std::error::Error>> {
    let reference = DockerReference::parse_normalized_named(tag)
        .map_err(|e| format!("error parsing additional-tag '{tag}': {e}"))?;
    if reference.tag.is_none() {
        return Err(format!("additional-tag '{tag}' must be a tagged reference").into());
    }
    Ok(reference)
}

/// Parse `USERNAME[:PASSWORD]`, prompting for a missing password.
fn parse_creds(creds: &str) -> Result<DockerAuthConfig, Box<dyn std::error::Error>> {
    if creds.is_empty() {
        return Err("credentials can't be empty".into());
    }
    let (username, password) = match creds.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (creds.to_string(), prompt_password()?),
    };
    if username.is_empty() {
        return Err("username can't be empty".into());
    }
    Ok(DockerAuthConfig { username, password })
}

fn prompt_password() -> Result<String, CopyError> {
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use clap::Parser;

    fn parse(argv: &[&str]) -> (GlobalArgs, CopyArgs) {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Copy(args) => (cli.global, args),
        }
    }

    #[test]
    fn test_copy_flags_and_aliases() {
        let (_, args) = parse(&[
            "skiff",
            "copy",
            "--screds",
            "alice:secret",
            "--dcreds",
            "bob:hunter2",
            "-f",
            "oci",
            "--dest-compress",
            "--additional-tag",
            "busybox:extra",
            "--additional-tag",
            "quay.io/a/b:c",
            "docker://busybox:latest",
            "dir:/tmp/busybox",
        ]);
        assert_eq!(args.src_creds.as_deref(), Some("alice:secret"));
        assert_eq!(args.dest_creds.as_deref(), Some("bob:hunter2"));
        assert_eq!(args.format.as_deref(), Some("oci"));
        assert!(args.dest_compress);
        assert_eq!(args.additional_tags.len(), 2);
        assert_eq!(args.images, vec!["docker://busybox:latest", "dir:/tmp/busybox"]);
    }

    #[test]
    fn test_tls_verify_defaults_and_values() {
        let (_, args) = parse(&["skiff", "copy", "dir:/a", "dir:/b"]);
        assert!(args.src_tls_verify);
        assert!(args.dest_tls_verify);

        let (_, args) = parse(&[
            "skiff",
            "copy",
            "--src-tls-verify=false",
            "--dest-tls-verify",
            "dir:/a",
            "dir:/b",
        ]);
        assert!(!args.src_tls_verify);
        assert!(args.dest_tls_verify);
        assert_eq!(args.images.len(), 2);
    }

    #[test]
    fn test_contexts_from_global_options() {
        let (global, args) = parse(&[
            "skiff",
            "--override-os",
            "linux",
            "--override-arch",
            "arm64",
            "--registries.d",
            "/etc/reg.d",
            "copy",
            "--authfile",
            "/auth.json",
            "--src-creds",
            "u:p",
            "--src-tls-verify=false",
            "--src-cert-dir",
            "/certs",
            "--dest-shared-blob-dir",
            "/shared",
            "--dest-ostree-tmp-dir",
            "/ostree",
            "--dest-daemon-host",
            "unix:///run/docker.sock",
            "--dest-compress",
            "dir:/a",
            "dir:/b",
        ]);
        let (src, dest) = contexts_from_global_options(&global, &args).unwrap();

        assert_eq!(src.os_choice.as_deref(), Some("linux"));
        assert_eq!(dest.architecture_choice.as_deref(), Some("arm64"));
        assert_eq!(src.registries_dir_path, Some(PathBuf::from("/etc/reg.d")));
        assert_eq!(dest.auth_file_path, Some(PathBuf::from("/auth.json")));
        assert_eq!(
            src.docker_auth_config,
            Some(DockerAuthConfig {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );
        assert!(dest.docker_auth_config.is_none());
        assert!(src.docker_insecure_skip_tls_verify);
        assert!(!dest.docker_insecure_skip_tls_verify);
        assert_eq!(src.docker_cert_path, Some(PathBuf::from("/certs")));
        assert!(src.oci_shared_blob_dir.is_none());
        assert_eq!(dest.oci_shared_blob_dir, Some(PathBuf::from("/shared")));
        assert_eq!(dest.ostree_tmp_dir, Some(PathBuf::from("/ostree")));
        assert_eq!(
            dest.docker_daemon_host.as_deref(),
            Some("unix:///run/docker.sock")
        );
        assert!(dest.dir_force_compress);
        assert!(!src.dir_force_compress);
    }

    #[test]
    fn test_manifest_type_for_format() {
        assert_eq!(manifest_type_for_format("oci").unwrap(), OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(
            manifest_type_for_format("v2s1").unwrap(),
            DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE
        );
        assert_eq!(manifest_type_for_format("v2s2").unwrap(), DOCKER_V2_SCHEMA2_MEDIA_TYPE);
        let err = manifest_type_for_format("v2s3").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown format \"v2s3\". Choose one of the supported formats: 'oci', 'v2s1', or 'v2s2'"
        );
    }

    #[test]
    fn test_parse_additional_tag() {
        let r = parse_additional_tag("busybox:extra").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/busybox:extra");

        let err = parse_additional_tag("busybox").unwrap_err();
        assert_eq!(err.to_string(), "additional-tag 'busybox' must be a tagged reference");

        let err = parse_additional_tag("UPPER:tag").unwrap_err();
        assert!(err.to_string().starts_with("error parsing additional-tag 'UPPER:tag'"));
    }

    #[test]
    fn test_parse_creds() {
        let auth = parse_creds("user:pa:ss").unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "pa:ss");
        assert!(parse_creds("").is_err());
        assert!(parse_creds(":password").is_err());
    }

    #[tokio::test]
    async fn test_wrong_argument_count() {
        let (global, args) = parse(&["skiff", "copy", "dir:/only-one"]);
        let err = execute(args, &global).await.unwrap_err();
        assert_eq!(err.to_string(), "Exactly two arguments expected");
    }

    #[tokio::test]
    async fn test_invalid_source_name() {
        let (mut global, args) = parse(&["skiff", "copy", "bogus:/a", "dir:/b"]);
        global.insecure_policy = true;
        let err = execute(args, &global).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Invalid source name bogus:/a:"));
    }
}
