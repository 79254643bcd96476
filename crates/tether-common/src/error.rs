//! Common error types for Tether.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`TetherError`].
pub type TetherResult<T> = Result<T, TetherError>;

/// Broad classification of a [`TetherError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect.
    Validation,
    /// The request collides with existing or concurrently modified state.
    Conflict,
    /// A referenced object or driver does not exist.
    NotFound,
    /// A driver refused the operation.
    Forbidden,
    /// Unexpected driver or store failure.
    Internal,
}

/// Errors across the Tether network controller.
#[derive(Error, Diagnostic, Debug)]
pub enum TetherError {
    /// Invalid network or endpoint name.
    #[error("Invalid name: {name:?}")]
    #[diagnostic(
        code(tether::invalid_name),
        help("Names must be non-blank and must not contain '.'")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Invalid object ID.
    #[error("Invalid id: {id:?}")]
    #[diagnostic(code(tether::invalid_id))]
    InvalidId {
        /// The rejected ID.
        id: String,
    },

    /// Malformed request (bad gateway, unparsable address, ...).
    #[error("Bad request: {message}")]
    #[diagnostic(code(tether::bad_request))]
    BadRequest {
        /// Description of what was malformed.
        message: String,
    },

    /// A network with this name already exists.
    #[error("Network with name {name} already exists")]
    #[diagnostic(code(tether::network::name_exists))]
    NetworkNameExists {
        /// The duplicated name.
        name: String,
    },

    /// An endpoint with this name already exists on the network.
    #[error("Service endpoint with name {name} already exists")]
    #[diagnostic(code(tether::endpoint::exists))]
    EndpointExists {
        /// The duplicated endpoint name.
        name: String,
    },

    /// The network still has endpoints attached.
    #[error("Network {name} has active endpoints")]
    #[diagnostic(
        code(tether::network::active_endpoints),
        help("Delete every endpoint on the network before deleting it")
    )]
    ActiveEndpoints {
        /// Network name.
        name: String,
        /// Network ID.
        id: String,
    },

    /// The endpoint is still joined to a sandbox.
    #[error("Endpoint {name} is still attached to sandbox {sandbox}")]
    #[diagnostic(code(tether::endpoint::in_use), help("Leave the sandbox first"))]
    EndpointInUse {
        /// Endpoint name.
        name: String,
        /// Sandbox ID.
        sandbox: String,
    },

    /// Optimistic-concurrency check failed on a store key.
    #[error("Key modified concurrently: {key}")]
    #[diagnostic(code(tether::store::key_modified))]
    KeyModified {
        /// Store key.
        key: String,
    },

    /// Another process modified the network while it was being deleted.
    #[error("Operation in progress. Delete failed for network {name}. Please try again.")]
    #[diagnostic(
        code(tether::network::retry),
        help("Re-read the network and retry the delete")
    )]
    OperationInProgress {
        /// Network name.
        name: String,
    },

    /// Every pool of the network is exhausted.
    #[error("No available addresses on network {network}")]
    #[diagnostic(code(tether::ipam::exhausted))]
    NoAvailableAddresses {
        /// Network name or pool ID.
        network: String,
    },

    /// Network not found.
    #[error("Network not found: {name} (id: {id})")]
    #[diagnostic(code(tether::network::not_found))]
    NetworkNotFound {
        /// Network name, if known.
        name: String,
        /// Network ID.
        id: String,
    },

    /// Endpoint not found.
    #[error("Endpoint not found: {name}")]
    #[diagnostic(code(tether::endpoint::not_found))]
    EndpointNotFound {
        /// Endpoint name or ID.
        name: String,
    },

    /// No network driver is available for the network type.
    #[error("Network driver not found: {network_type}")]
    #[diagnostic(
        code(tether::driver::not_found),
        help("Register the driver with the controller or configure a driver loader")
    )]
    DriverNotFound {
        /// Network type.
        network_type: String,
    },

    /// No IPAM driver is registered under the name.
    #[error("IPAM driver not found: {name}")]
    #[diagnostic(code(tether::ipam::driver_not_found))]
    IpamDriverNotFound {
        /// IPAM driver name.
        name: String,
    },

    /// Store key not found.
    #[error("Key not found in store: {key}")]
    #[diagnostic(code(tether::store::key_not_found))]
    KeyNotFound {
        /// Store key.
        key: String,
    },

    /// No store is configured for the scope.
    #[error("No datastore configured for scope {scope}")]
    #[diagnostic(code(tether::store::unavailable))]
    StoreUnavailable {
        /// Scope name.
        scope: String,
    },

    /// A driver refused the operation.
    #[error("Forbidden: {message}")]
    #[diagnostic(code(tether::forbidden))]
    Forbidden {
        /// The driver's reason.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(tether::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(tether::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(tether::serialization))]
    Serialization(String),

    /// Internal error wrapping an unexpected driver or store failure.
    #[error("Internal error: {message}")]
    #[diagnostic(code(tether::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl TetherError {
    /// Build an [`TetherError::Internal`] from anything printable.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Build a [`TetherError::BadRequest`] from anything printable.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Build a [`TetherError::Forbidden`] from anything printable.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. }
            | Self::InvalidId { .. }
            | Self::BadRequest { .. }
            | Self::Config { .. } => ErrorKind::Validation,
            Self::NetworkNameExists { .. }
            | Self::EndpointExists { .. }
            | Self::ActiveEndpoints { .. }
            | Self::EndpointInUse { .. }
            | Self::KeyModified { .. }
            | Self::OperationInProgress { .. }
            | Self::NoAvailableAddresses { .. } => ErrorKind::Conflict,
            Self::NetworkNotFound { .. }
            | Self::EndpointNotFound { .. }
            | Self::DriverNotFound { .. }
            | Self::IpamDriverNotFound { .. }
            | Self::KeyNotFound { .. }
            | Self::StoreUnavailable { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Io(_) | Self::Serialization(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if a driver refused the operation.
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self.kind(), ErrorKind::Forbidden)
    }

    /// Returns true for conflict errors.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict)
    }

    /// Returns true for not-found errors.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
