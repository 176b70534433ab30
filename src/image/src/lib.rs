//! Skiff Image - copying container images between storage mechanisms.
//!
//! This crate provides the image engine behind `skiff copy`: image name
//! parsing, the `dir`, `docker`, `docker-archive`, `docker-daemon`, `oci`
//! and `oci-archive` transports, manifest conversion, trust policy
//! evaluation and signature handling.

#![allow(clippy::result_large_err)]

pub mod auth;
pub mod compression;
pub mod context;
pub mod copy;
pub mod digest;
pub mod lookaside;
pub mod manifest;
pub mod reference;
pub mod signature;
pub mod transports;

// Re-export common types
pub use context::{DockerAuthConfig, SystemContext};
pub use copy::{copy_image, CopyOptions};
pub use digest::Digest;
pub use reference::DockerReference;
pub use signature::{Policy, PolicyContext, PolicyRequirement};
pub use transports::{image_name, list_names, parse_image_name, ImageReference, Transport};

/// Skiff Image version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
