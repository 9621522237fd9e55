//! Failures the registry and request resolution surface to their callers.

use crate::credentials::AuthFailure;
use crate::properties::ClientKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// The merged configuration lacks properties without which no client can be built.
    /// The cluster is not registered.
    #[error("Missing configuration detected for connection to cluster {cluster_key}, no connection will be setup{details}")]
    ConfigurationInvalid { cluster_key: String, details: String },

    /// The configuration is usable but connection attempts may fail or need caller credentials.
    /// Only ever reported as a diagnostic, registration proceeds.
    #[error("Some configuration may be missing for connection to cluster {cluster_key}, connection attempts may fail{details}")]
    ConfigurationIncomplete { cluster_key: String, details: String },

    /// Neither the configuration nor the resource status provide an id for the cluster yet.
    #[error("Cluster id for {cluster_key} is not yet available and not provided via configuration")]
    ClusterIdUnavailable { cluster_key: String },

    #[error("Requested Kafka cluster {cluster_id} does not exist or is not configured")]
    ClusterNotFound { cluster_id: String },

    #[error(transparent)]
    AuthenticationRequired(#[from] AuthFailure),

    #[error("Ignoring duplicate Kafka cluster id: {cluster_id} for cluster {cluster_key}. Cluster id values in configuration must be unique and may not match id values of clusters discovered using Kafka resources (already registered by {existing_key})")]
    DuplicateClusterIdentifier {
        cluster_id: String,
        cluster_key: String,
        existing_key: String,
    },

    #[error("Failed to create {kind} client for cluster {cluster_id}")]
    HandleConstructionFailed {
        cluster_id: String,
        kind: ClientKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Timed out after {timeout:?} creating {kind} client for cluster {cluster_id}")]
    HandleConstructionTimeout {
        cluster_id: String,
        kind: ClientKind,
        timeout: Duration,
    },
}

/// How a failure is presented by the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCategory {
    pub code: &'static str,
    pub title: &'static str,
    pub status: u16,
}

impl ErrorCategory {
    pub const RESOURCE_NOT_FOUND: ErrorCategory = ErrorCategory {
        code: "4041",
        title: "Resource not found",
        status: 404,
    };
    pub const NOT_AUTHENTICATED: ErrorCategory = ErrorCategory {
        code: "4011",
        title: "Authentication required",
        status: 401,
    };
    pub const BACKEND_UNAVAILABLE: ErrorCategory = ErrorCategory {
        code: "5031",
        title: "Backend service unavailable",
        status: 503,
    };
    pub const BACKEND_TIMEOUT: ErrorCategory = ErrorCategory {
        code: "5041",
        title: "Timed out waiting for backend service",
        status: 504,
    };
    pub const SERVER_ERROR: ErrorCategory = ErrorCategory {
        code: "5001",
        title: "Unexpected error",
        status: 500,
    };
}

impl RegistryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::ClusterNotFound { .. } => ErrorCategory::RESOURCE_NOT_FOUND,
            RegistryError::AuthenticationRequired(_) => ErrorCategory::NOT_AUTHENTICATED,
            RegistryError::HandleConstructionFailed { .. } => ErrorCategory::BACKEND_UNAVAILABLE,
            RegistryError::HandleConstructionTimeout { .. } => ErrorCategory::BACKEND_TIMEOUT,
            RegistryError::ConfigurationInvalid { .. }
            | RegistryError::ConfigurationIncomplete { .. }
            | RegistryError::ClusterIdUnavailable { .. }
            | RegistryError::DuplicateClusterIdentifier { .. } => ErrorCategory::SERVER_ERROR,
        }
    }

    /// The `WWW-Authenticate` scheme to challenge the caller with, if any.
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            RegistryError::AuthenticationRequired(failure) => Some(failure.challenge()),
            _ => None,
        }
    }
}
