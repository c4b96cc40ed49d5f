use thiserror::Error;

/// cainject error types
#[derive(Error, Debug)]
pub enum InjectError {
    /// Malformed tar, gzip, PEM, DER or keystore input
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Archive entry path escapes the target root
    #[error("Invalid archive path: {path}")]
    PathValidation { path: String },

    /// Requested path or symlink target is absent
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Archive entry type is not a file, directory, symlink or ignorable marker
    #[error("Unsupported entry type {kind} for {path}")]
    UnsupportedEntry { path: String, kind: String },

    /// Content does not match the format a handler expected
    #[error("Format mismatch: expected {format} - {message}")]
    FormatMismatch { format: String, message: String },

    /// A patch handler failed
    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: Box<InjectError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl InjectError {
    /// Build a `NotFound` error for a path.
    pub fn not_found(path: impl Into<String>) -> Self {
        InjectError::NotFound { path: path.into() }
    }

    /// Whether this error (or the handler error it wraps) is a `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            InjectError::NotFound { .. } => true,
            InjectError::Handler { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error is a `FormatMismatch`.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, InjectError::FormatMismatch { .. })
    }
}

impl From<serde_json::Error> for InjectError {
    fn from(err: serde_json::Error) -> Self {
        InjectError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for InjectError {
    fn from(err: serde_yaml::Error) -> Self {
        InjectError::SerializationError(err.to_string())
    }
}

/// Result type alias for cainject operations
pub type Result<T> = std::result::Result<T, InjectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let error = InjectError::DecodeError("unexpected EOF".to_string());
        assert_eq!(error.to_string(), "Decode error: unexpected EOF");
    }

    #[test]
    fn test_path_validation_display() {
        let error = InjectError::PathValidation {
            path: "../etc/passwd".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid archive path: ../etc/passwd");
    }

    #[test]
    fn test_unsupported_entry_display() {
        let error = InjectError::UnsupportedEntry {
            path: "dev/null".to_string(),
            kind: "char device".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Unsupported entry type char device for dev/null"
        );
    }

    #[test]
    fn test_format_mismatch_display() {
        let error = InjectError::FormatMismatch {
            format: "JKS".to_string(),
            message: "invalid magic".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Format mismatch: expected JKS - invalid magic"
        );
        assert!(error.is_format_mismatch());
    }

    #[test]
    fn test_handler_error_names_handler_and_cause() {
        let error = InjectError::Handler {
            handler: "java-keystore".to_string(),
            source: Box::new(InjectError::DecodeError(
                "/usr/lib/jvm/lib/security/cacerts: truncated".to_string(),
            )),
        };
        let message = error.to_string();
        assert!(message.contains("java-keystore"));
        assert!(message.contains("/usr/lib/jvm/lib/security/cacerts"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(InjectError::not_found("/etc/os-release").is_not_found());
        let wrapped = InjectError::Handler {
            handler: "pem-bundle".to_string(),
            source: Box::new(InjectError::not_found("/etc/ssl/cert.pem")),
        };
        assert!(wrapped.is_not_found());
        assert!(!InjectError::Other("x".to_string()).is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: InjectError = io_error.into();
        assert!(matches!(error, InjectError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ bad");
        let error: InjectError = result.unwrap_err().into();
        assert!(matches!(error, InjectError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: InjectError = result.unwrap_err().into();
        assert!(matches!(error, InjectError::SerializationError(_)));
    }

    #[test]
    fn test_registry_error_display() {
        let error = InjectError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Authentication failed"
        );
    }
}
