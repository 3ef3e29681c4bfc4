//! State management module for the tiered deployment reconciler.
//!
//! This module provides persistent state storage mapping every node to the
//! provider identity and attributes last observed for it, plus advisory
//! locking and a short run history.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    MAX_HISTORY, ObservedResource, ResourceStatus, RunOperation, RunRecord, STATE_VERSION,
    StackState,
};
