//! Error types for the tiered deployment reconciler.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation run: configuration, graph construction, planning,
//! provider calls, state management, and output resolution.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::graph::NodeId;

/// The main error type for the tiered deployment reconciler.
#[derive(Debug, Error)]
pub enum TieredError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Output resolution errors.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate output definition.
    #[error("Duplicate output name: {name}")]
    DuplicateOutput {
        /// The duplicated name.
        name: String,
    },
}

/// Errors raised while building the resource graph.
///
/// All of these abort a run before any provider call is made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share the same identifier.
    #[error("Duplicate node id: {node}")]
    DuplicateNode {
        /// The duplicated node id.
        node: NodeId,
    },

    /// A node references a node id that is not declared.
    #[error("Node {node} references undeclared node {reference}")]
    DanglingReference {
        /// The node holding the reference.
        node: NodeId,
        /// The missing target.
        reference: NodeId,
    },

    /// The dependency edges form a cycle.
    #[error("Dependency cycle detected: {}", format_path(.path))]
    Cycle {
        /// Nodes forming the cycle, first node repeated at the end.
        path: Vec<NodeId>,
    },
}

/// Planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Recorded dependencies of state entries could not be ordered.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Errors returned by a provider adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// A retryable failure: throttling, eventual consistency, network.
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// A non-retryable failure: invalid parameters, permission denied.
    #[error("Provider rejected the request: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("Resource not found: {provider_id}")]
    NotFound {
        /// Provider-assigned identifier that was not found.
        provider_id: String,
    },

    /// The resource was created but could not be finished.
    ///
    /// The resource exists at the provider and must be recorded so a later
    /// run can replace it.
    #[error("Resource {provider_id} created but left unfinished: {message}")]
    Incomplete {
        /// Provider-assigned identifier of the created resource.
        provider_id: String,
        /// Why the resource could not be finished.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Output resolution errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutputError {
    /// The referenced node has no created resource in state.
    #[error("Output '{output}' references {node}, which has not been reconciled")]
    NodeNotReconciled {
        /// Output name.
        output: String,
        /// Referenced node.
        node: NodeId,
    },

    /// The referenced attribute is absent on the reconciled resource.
    #[error("Output '{output}' references missing attribute '{attribute}' on {node}")]
    AttributeMissing {
        /// Output name.
        output: String,
        /// Referenced node.
        node: NodeId,
        /// Attribute path that was not found.
        attribute: String,
    },

    /// The output binding names a node the topology does not declare.
    #[error("Output '{output}' references undeclared node {node}")]
    UnknownNode {
        /// Output name.
        output: String,
        /// Referenced node.
        node: NodeId,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted before applying.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The run was cancelled.
    #[error("Reconciliation cancelled after {completed} completed actions")]
    Cancelled {
        /// Actions that reached a terminal state before cancellation.
        completed: usize,
    },

    /// Some nodes failed or were skipped.
    #[error("{failed} nodes failed and {skipped} were skipped")]
    PartialFailure {
        /// Number of failed nodes.
        failed: usize,
        /// Number of skipped nodes.
        skipped: usize,
    },
}

/// Why a single planned action did not succeed.
///
/// These are isolated to the action's node; dependents are skipped and
/// unrelated nodes continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The provider call failed fatally or ran out of attempts.
    #[error("{source} (after {attempts} attempts)")]
    Provider {
        /// The last provider error.
        source: ProviderError,
        /// Attempts made.
        attempts: u32,
    },

    /// The resource changed at the provider but the state write failed.
    #[error("State write failed: {message}")]
    StateWrite {
        /// Description of the store failure.
        message: String,
    },

    /// A reference could not be resolved against recorded state.
    #[error("Unresolved reference {reference}")]
    UnresolvedReference {
        /// The reference, as `node.attribute`.
        reference: String,
    },

    /// The node's lifecycle does not allow this action.
    #[error("Illegal transition for {node}: {from} -> {to}")]
    IllegalTransition {
        /// Node.
        node: NodeId,
        /// Current lifecycle state.
        from: String,
        /// Requested lifecycle state.
        to: String,
    },

    /// A retry wait was abandoned because the run was cancelled.
    #[error("Cancelled while waiting to retry (after {attempts} attempts)")]
    Abandoned {
        /// Attempts made.
        attempts: u32,
    },
}

impl ActionError {
    /// Returns the number of provider attempts made, if any.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Provider { attempts, .. } | Self::Abandoned { attempts } => *attempts,
            _ => 0,
        }
    }
}

/// Result type alias for tiered operations.
pub type Result<T> = std::result::Result<T, TieredError>;

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl TieredError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the identifier of a resource left behind by a failed create.
    #[must_use]
    pub fn orphaned_id(&self) -> Option<&str> {
        match self {
            Self::Incomplete { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }

    /// Returns the provider's retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
