//! Provider adapters.
//!
//! The reconciler reaches live cloud state only through [`ProviderAdapter`].
//! Two implementations exist: the AWS Cloud Control API and a deterministic
//! in-memory cloud used for rehearsals and tests.

mod adapter;
mod cloudcontrol;
mod schema;
mod simulated;

pub use adapter::{
    DeleteOutcome, ProviderAdapter, ProviderOperation, ProvisionedResource, ResourceHandle,
    ResourceRequest,
};
pub use cloudcontrol::CloudControlProvider;
pub use schema::{Companion, TargetRegistration, property_name, type_name};
pub use simulated::{CallRecord, Fault, SimulatedCloud};
