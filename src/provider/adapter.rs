//! Provider adapter trait definition.
//!
//! Every operation must be safe to retry: creates carry a client token the
//! provider uses to deduplicate, deletes report a missing resource instead of
//! failing.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::ProviderError;
use crate::graph::{Attributes, NodeId, ResourceKind};

/// Desired state of one resource, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    /// Node being realized.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resolved attributes, sensitive values in plain text.
    pub attributes: Attributes,
    /// Idempotency token for this mutation.
    pub client_token: String,
}

/// Address of an existing resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle {
    /// Node the resource realizes.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Last recorded attributes.
    pub attributes: Attributes,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Attributes computed by the provider (ARNs, addresses, DNS names).
    pub attributes: Attributes,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The resource was deleted by this call.
    Deleted,
    /// The resource was already gone.
    NotFound,
}

/// Provider operations, used for logging, tokens and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOperation {
    /// Create a resource.
    Create,
    /// Read a resource.
    Read,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl ProviderOperation {
    /// Returns the lowercase operation name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ResourceHandle {
    /// Builds a handle from a recorded resource.
    #[must_use]
    pub fn from_observed(resource: &crate::state::ObservedResource) -> Self {
        Self {
            node_id: resource.node_id.clone(),
            kind: resource.kind,
            provider_id: resource.provider_id.clone(),
            attributes: resource.attributes.clone(),
        }
    }
}

/// Trait for cloud provider backends.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource, ProviderError>;

    /// Reads the provider-computed attributes of a resource.
    ///
    /// Returns `None` if the resource no longer exists.
    async fn read(&self, handle: &ResourceHandle) -> Result<Option<Attributes>, ProviderError>;

    /// Updates mutable attributes in place and returns the computed attributes.
    async fn update(
        &self,
        handle: &ResourceHandle,
        request: &ResourceRequest,
    ) -> Result<Attributes, ProviderError>;

    /// Deletes a resource.
    async fn delete(
        &self,
        handle: &ResourceHandle,
        client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError>;

    /// Gets the provider name.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: ProviderAdapter + ?Sized> ProviderAdapter for std::sync::Arc<T> {
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource, ProviderError> {
        (**self).create(request).await
    }

    async fn read(&self, handle: &ResourceHandle) -> Result<Option<Attributes>, ProviderError> {
        (**self).read(handle).await
    }

    async fn update(
        &self,
        handle: &ResourceHandle,
        request: &ResourceRequest,
    ) -> Result<Attributes, ProviderError> {
        (**self).update(handle, request).await
    }

    async fn delete(
        &self,
        handle: &ResourceHandle,
        client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        (**self).delete(handle, client_token).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
