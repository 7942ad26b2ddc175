//! Common error types for skiff.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SkiffError`].
pub type SkiffResult<T> = Result<T, SkiffError>;

/// Errors shared by every skiff crate.
#[derive(Error, Diagnostic, Debug)]
pub enum SkiffError {
    /// Container not found.
    #[error("Container not found: {reference}")]
    #[diagnostic(
        code(skiff::container::not_found),
        help("Run `skiff ps` to list known containers")
    )]
    ContainerNotFound {
        /// The id, id prefix or name that matched nothing.
        reference: String,
    },

    /// Image not found.
    #[error("Image not found: {reference}")]
    #[diagnostic(
        code(skiff::image::not_found),
        help("Run `skiff images` to list installed images")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// A name or id prefix matched more than one object.
    #[error("Ambiguous {kind} reference '{reference}' matches {count} entries")]
    #[diagnostic(
        code(skiff::ambiguous),
        help("Use a longer id prefix or the exact name")
    )]
    AmbiguousReference {
        /// Object kind ("container" or "image").
        kind: &'static str,
        /// The ambiguous reference.
        reference: String,
        /// Number of matches.
        count: usize,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(skiff::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// A container name is already taken.
    #[error("Container name already in use: {name}")]
    #[diagnostic(code(skiff::container::name_in_use))]
    NameInUse {
        /// The duplicate name.
        name: String,
    },

    /// Operation is not allowed in the container's current status.
    #[error("Container {id} is {status}; {operation} requires it to be {required}")]
    #[diagnostic(code(skiff::container::invalid_state), help("Stop the container first"))]
    InvalidState {
        /// Container ID.
        id: String,
        /// Current status.
        status: String,
        /// Attempted operation.
        operation: &'static str,
        /// Status the operation requires.
        required: &'static str,
    },

    /// Container setup failed before the user command could start.
    #[error("Container setup failed during {stage}: {message}")]
    #[diagnostic(code(skiff::setup))]
    Setup {
        /// Setup stage that failed.
        stage: &'static str,
        /// Error details.
        message: String,
    },

    /// Malformed volume specification.
    #[error("Invalid volume '{spec}'")]
    #[diagnostic(
        code(skiff::volume::invalid),
        help("Volumes are written as /host/path:/container/path")
    )]
    InvalidVolume {
        /// The rejected spec.
        spec: String,
    },

    /// Network not found.
    #[error("Network not found: {name}")]
    #[diagnostic(code(skiff::network::not_found))]
    NetworkNotFound {
        /// Network name.
        name: String,
    },

    /// Network already exists.
    #[error("Network already exists: {name}")]
    #[diagnostic(code(skiff::network::exists))]
    NetworkExists {
        /// Network name.
        name: String,
    },

    /// Unknown network driver.
    #[error("Unknown network driver: {driver}")]
    #[diagnostic(code(skiff::network::driver), help("The only available driver is 'bridge'"))]
    DriverNotFound {
        /// Driver name.
        driver: String,
    },

    /// Invalid IPv4 subnet.
    #[error("Invalid subnet: {value}")]
    #[diagnostic(code(skiff::ipam::subnet), help("Use CIDR notation such as 192.168.10.0/24"))]
    InvalidSubnet {
        /// The rejected value.
        value: String,
    },

    /// Every address of a subnet is allocated.
    #[error("No free address left in subnet {subnet}")]
    #[diagnostic(code(skiff::ipam::exhausted))]
    AddressExhausted {
        /// The exhausted subnet.
        subnet: String,
    },

    /// Address outside the subnet it is released into.
    #[error("Address {ip} does not belong to subnet {subnet}")]
    #[diagnostic(code(skiff::ipam::out_of_range))]
    AddressOutOfRange {
        /// The address.
        ip: String,
        /// The subnet.
        subnet: String,
    },

    /// Malformed port mapping.
    #[error("Invalid port mapping '{spec}'")]
    #[diagnostic(
        code(skiff::portmap::invalid),
        help("Port mappings are written as hostPort:containerPort")
    )]
    InvalidPortMapping {
        /// The rejected mapping.
        spec: String,
    },

    /// External command exited unsuccessfully.
    #[error("Command `{command}` failed: {message}")]
    #[diagnostic(code(skiff::command))]
    Command {
        /// Command line that was run.
        command: String,
        /// Exit status or stderr.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(skiff::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(skiff::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(skiff::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(skiff::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(skiff::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl SkiffError {
    /// Wrap an I/O error, mapping `EPERM`/`EACCES` to [`SkiffError::PermissionDenied`].
    #[must_use]
    pub fn from_io(err: std::io::Error, operation: impl Into<String>) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                operation: operation.into(),
            }
        } else {
            Self::Io(err)
        }
    }

    /// Build a [`SkiffError::Setup`] from any displayable cause.
    pub fn setup(stage: &'static str, cause: impl std::fmt::Display) -> Self {
        Self::Setup {
            stage,
            message: cause.to_string(),
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SkiffError::ContainerNotFound {
            reference: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: abc123");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SkiffError = io_err.into();
        assert!(matches!(err, SkiffError::Io(_)));
    }

    #[test]
    fn permission_denied_is_mapped() {
        let io_err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = SkiffError::from_io(io_err, "write tasks");
        assert!(matches!(err, SkiffError::PermissionDenied { .. }));
    }

    #[test]
    fn invalid_state_message() {
        let err = SkiffError::InvalidState {
            id: "abc".into(),
            status: "running".into(),
            operation: "remove",
            required: "stopped",
        };
        assert_eq!(
            err.to_string(),
            "Container abc is running; remove requires it to be stopped"
        );
    }
}
