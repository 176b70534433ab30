//! Per-side configuration consumed by transports.
//!
//! A copy has one [`SystemContext`] for the source and one for the
//! destination; transports read only the fields relevant to them.

use std::path::PathBuf;

use crate::reference::DockerReference;

/// Username/password pair for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerAuthConfig {
    pub username: String,
    pub password: String,
}

/// Settings that affect how a transport reads or writes an image.
#[derive(Debug, Clone)]
pub struct SystemContext {
    /// Trust policy file (`--policy`)
    pub signature_policy_path: Option<PathBuf>,
    /// Lookaside configuration directory (`--registries.d`)
    pub registries_dir_path: Option<PathBuf>,
    /// Registry credential file (`--authfile`)
    pub auth_file_path: Option<PathBuf>,
    /// Architecture used when choosing from a manifest list
    pub architecture_choice: Option<String>,
    /// OS used when choosing from a manifest list
    pub os_choice: Option<String>,

    /// Explicit registry credentials (`--src-creds`/`--dest-creds`)
    pub docker_auth_config: Option<DockerAuthConfig>,
    /// Directory holding `*.crt` CA certificates for the registry
    pub docker_cert_path: Option<PathBuf>,
    /// Skip TLS verification for the registry (`--*-tls-verify=false`)
    pub docker_insecure_skip_tls_verify: bool,

    /// Docker daemon endpoint (`unix://…` or `tcp://…`)
    pub docker_daemon_host: Option<String>,
    /// Certificate directory for the docker daemon
    pub docker_daemon_cert_path: Option<PathBuf>,
    /// Skip TLS verification for the docker daemon
    pub docker_daemon_insecure_skip_tls_verify: bool,

    /// Extra `RepoTags` written by docker-archive destinations
    pub docker_archive_additional_tags: Vec<DockerReference>,

    /// Blob directory shared between OCI layouts
    pub oci_shared_blob_dir: Option<PathBuf>,

    /// Temporary directory for OSTree destinations
    pub ostree_tmp_dir: Option<PathBuf>,

    /// Gzip layers when writing to a `dir:` destination
    pub dir_force_compress: bool,
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            signature_policy_path: None,
            registries_dir_path: None,
            auth_file_path: None,
            architecture_choice: None,
            os_choice: None,
            docker_auth_config: None,
            docker_cert_path: None,
            docker_insecure_skip_tls_verify: false,
            docker_daemon_host: None,
            docker_daemon_cert_path: None,
            docker_daemon_insecure_skip_tls_verify: false,
            docker_archive_additional_tags: Vec::new(),
            oci_shared_blob_dir: None,
            ostree_tmp_dir: None,
            dir_force_compress: false,
        }
    }
}

impl SystemContext {
    /// Operating system to select from manifest lists.
    pub fn platform_os(&self) -> String {
        self.os_choice.clone().unwrap_or_else(|| "linux".to_string())
    }

    /// Architecture to select from manifest lists, in OCI/Go naming.
    pub fn platform_architecture(&self) -> String {
        self.architecture_choice
            .clone()
            .unwrap_or_else(|| host_architecture().to_string())
    }
}

/// Host CPU architecture in OCI naming.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        "arm" => "arm",
        other => other,
    }
}
