use thiserror::Error;

/// Skiff error types
#[derive(Error, Debug)]
pub enum CopyError {
    /// Image name could not be split into transport and reference
    #[error("Invalid image name \"{name}\", {reason}")]
    InvalidImageName { name: String, reason: String },

    /// Transport-specific reference was malformed
    #[error("Invalid reference: {0}")]
    ReferenceError(String),

    /// Manifest could not be parsed, converted or selected
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Destination refused a manifest type; callers may retry with another type
    #[error("Manifest type {mime_type} rejected: {reason}")]
    ManifestTypeRejected { mime_type: String, reason: String },

    /// Content did not hash to the expected digest
    #[error("Digest did not match, expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Blob transfer failed
    #[error("Blob error: {0}")]
    BlobError(String),

    /// Transport backend failure
    #[error("{transport}: {message}")]
    TransportError { transport: String, message: String },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Docker daemon API error
    #[error("Docker daemon error: {0}")]
    DaemonError(String),

    /// Trust policy could not be loaded or is malformed
    #[error("Policy error: {0}")]
    PolicyError(String),

    /// Trust policy denied the image
    #[error("Source image rejected: {0}")]
    PolicyRejected(String),

    /// Signature could not be read, verified or written
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CopyError {
    fn from(err: serde_json::Error) -> Self {
        CopyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CopyError {
    fn from(err: serde_yaml::Error) -> Self {
        CopyError::SerializationError(err.to_string())
    }
}

impl CopyError {
    /// Shorthand for a transport-scoped error.
    pub fn transport(transport: &str, message: impl Into<String>) -> Self {
        CopyError::TransportError {
            transport: transport.to_string(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation could succeed.
    ///
    /// Network and I/O failures are transient; malformed content and policy
    /// decisions are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CopyError::IoError(_) | CopyError::RegistryError { .. } | CopyError::DaemonError(_)
        )
    }
}

/// Result type alias for skiff operations
pub type Result<T> = std::result::Result<T, CopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_image_name_display() {
        let error = CopyError::InvalidImageName {
            name: "busybox".to_string(),
            reason: "expected colon-separated transport:reference".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid image name \"busybox\", expected colon-separated transport:reference"
        );
    }

    #[test]
    fn test_manifest_type_rejected_display() {
        let error = CopyError::ManifestTypeRejected {
            mime_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            reason: "unsupported".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Manifest type application/vnd.oci.image.manifest.v1+json rejected: unsupported"
        );
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = CopyError::DigestMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest did not match, expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let error = CopyError::transport("oci", "no manifests in index.json");
        assert_eq!(error.to_string(), "oci: no manifests in index.json");
    }

    #[test]
    fn test_registry_error_display() {
        let error = CopyError::RegistryError {
            registry: "quay.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: quay.io - Authentication failed"
        );
    }

    #[test]
    fn test_policy_rejected_display() {
        let error = CopyError::PolicyRejected("Running image docker://x is rejected by policy.".to_string());
        assert_eq!(
            error.to_string(),
            "Source image rejected: Running image docker://x is rejected by policy."
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let copy_error: CopyError = io_error.into();
        assert!(matches!(copy_error, CopyError::IoError(_)));
        assert!(copy_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid json }");
        let copy_error: CopyError = result.unwrap_err().into();
        assert!(matches!(copy_error, CopyError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let copy_error: CopyError = result.unwrap_err().into();
        assert!(matches!(copy_error, CopyError::SerializationError(_)));
    }

    #[test]
    fn test_is_transient() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(CopyError::from(io_error).is_transient());
        assert!(CopyError::RegistryError {
            registry: "r".to_string(),
            message: "m".to_string()
        }
        .is_transient());
        assert!(!CopyError::PolicyError("bad".to_string()).is_transient());
        assert!(!CopyError::DigestMismatch {
            expected: "a".to_string(),
            actual: "b".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(CopyError::Other("test error".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
