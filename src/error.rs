// file: src/error.rs
// version: 3.1.0
// guid: 57b83a63-07b6-4534-aa6c-51e8797254e0

use thiserror::Error;

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Maximum number of output bytes carried inside a command error
pub const MAX_ERROR_OUTPUT: usize = 1024;

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Semantic error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    Conflict,
    IntegrityViolation,
    TransportFailed,
    Cancelled,
    ConfigurationInvalid,
}

/// Error types for the provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Command `{command} {}` failed (exit code {exit_code:?}): {output}", .args.join(" "))]
    CommandFailed {
        command: String,
        args: Vec<String>,
        exit_code: Option<i64>,
        output: String,
        cause: Option<String>,
    },

    #[error("{op} failed for {target}: {source}")]
    Operation {
        op: String,
        target: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ProvisionError {
    /// Create a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::IntegrityViolation(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailed(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }

    /// Create a command failure, truncating the captured output
    pub fn command_failed(
        command: &str,
        args: &[String],
        exit_code: Option<i64>,
        output: &[u8],
        cause: Option<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            args: args.to_vec(),
            exit_code,
            output: truncate_output(output),
            cause,
        }
    }

    /// Wrap this error with the operation and target it occurred in
    pub fn wrap(self, op: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Operation {
            op: op.into(),
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Semantic kind, looking through operation wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            Self::TransportFailed(_) | Self::CommandFailed { .. } => ErrorKind::TransportFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::ConfigurationInvalid(_) | Self::Yaml(_) => ErrorKind::ConfigurationInvalid,
            Self::Serialization(_) => ErrorKind::IntegrityViolation,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::TransportFailed,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// Whether the root cause is a missing file, key or container
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Combined output of the innermost failed command, if any
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output),
            Self::Operation { source, .. } => source.command_output(),
            _ => None,
        }
    }

    /// Exit status of the failed command, through any wrapping
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::CommandFailed { exit_code, .. } => *exit_code,
            Self::Operation { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}

/// Truncate raw command output to [`MAX_ERROR_OUTPUT`] bytes with a marker
pub fn truncate_output(output: &[u8]) -> String {
    if output.len() <= MAX_ERROR_OUTPUT {
        return String::from_utf8_lossy(output).trim_end().to_string();
    }
    let mut text = String::from_utf8_lossy(&output[..MAX_ERROR_OUTPUT]).to_string();
    text.push_str(TRUNCATION_MARKER);
    text
}

impl From<bollard::errors::Error> for ProvisionError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as EngineError;
        match err {
            EngineError::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            EngineError::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::Conflict(message),
            other => Self::TransportFailed(format!("container engine: {}", other)),
        }
    }
}

impl From<ssh2::Error> for ProvisionError {
    fn from(err: ssh2::Error) -> Self {
        Self::TransportFailed(format!("ssh: {}", err))
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransportFailed(format!("http: {}", err))
    }
}

/// Attach "<op> failed for <target>" context to a result
pub trait ResultExt<T> {
    fn with_op(self, op: &str, target: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: Into<ProvisionError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_op(self, op: &str, target: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| e.into().wrap(op, target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_chain_renders_context() {
        let err = ProvisionError::not_found("k1.meta").wrap("stat", "k1");
        assert_eq!(err.to_string(), "stat failed for k1: Not found: k1.meta");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_nested_kind_lookup() {
        let err = ProvisionError::cancelled("token fired")
            .wrap("put", "a")
            .wrap("upload", "remote");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_command_output_truncation() {
        let output = vec![b'x'; 4096];
        let err = ProvisionError::command_failed("dd", &[], Some(1), &output, None);
        let text = err.command_output().unwrap();
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), MAX_ERROR_OUTPUT + TRUNCATION_MARKER.len());
        assert_eq!(err.kind(), ErrorKind::TransportFailed);
    }

    #[test]
    fn test_exit_code_through_wrapping() {
        let err = ProvisionError::command_failed("growpart", &[], Some(1), b"NOCHANGE", None)
            .wrap("grow partition", "/dev/sdb");
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(ProvisionError::not_found("x").exit_code(), None);
    }

    #[test]
    fn test_short_output_is_kept() {
        assert_eq!(truncate_output(b"NOCHANGE: partition 2\n"), "NOCHANGE: partition 2");
    }

    #[test]
    fn test_io_not_found_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let result: std::result::Result<(), std::io::Error> = Err(io);
        let err = result.with_op("read", "/tmp/x").unwrap_err();
        assert!(err.is_not_found());
    }
}
