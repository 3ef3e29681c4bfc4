//! Resource graph model.
//!
//! This module defines the typed nodes of a topology, the attribute values
//! they carry (including cross-node references), and the dependency graph
//! derived from them. Edges are computed once at build time from attribute
//! references and explicit ordering hints.

mod build;
mod node;
mod value;

pub use build::Graph;
pub use node::{Node, NodeId, ResourceKind};
pub use value::{AttrValue, Attributes, Reference, Resolution, SecretValue, Unresolved};
