// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports
#![warn(unused_variables)]            // Unused variables
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Tiered Deploy
//!
//! A dependency-aware provisioning reconciler for a fixed two-tier AWS stack:
//! one VPC, two public web instances behind an application load balancer,
//! and a private relational database.
//!
//! ## Overview
//!
//! Every resource is a node in a dependency graph whose edges come from the
//! attribute references between nodes. A run then:
//!
//! 1. **Refreshes** recorded state against the provider
//! 2. **Plans** create, update, replace and delete actions from the diff
//! 3. **Executes** the plan in parallel, never starting a node before the
//!    nodes it references exist
//! 4. **Persists** each outcome as it lands, so a failed or interrupted run
//!    resumes where it stopped
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Nodes, attribute references and the dependency graph
//! - [`topology`]: The fixed two-tier node set
//! - [`provider`]: Provider adapters (Cloud Control, simulated)
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`planner`]: Diff computation, planning and plan execution
//! - [`outputs`]: Stack outputs and the load balancer probe
//! - [`reconciler`]: The refresh, plan and apply loop
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!   region: us-east-1
//!
//! state:
//!   backend: local
//!
//! network:
//!   vpc_cidr: 10.0.0.0/16
//!   public_subnets:
//!     - { cidr: 10.0.1.0/24, availability_zone: us-east-1a }
//!     - { cidr: 10.0.2.0/24, availability_zone: us-east-1b }
//!   private_subnets:
//!     - { cidr: 10.0.11.0/24, availability_zone: us-east-1a }
//!     - { cidr: 10.0.12.0/24, availability_zone: us-east-1b }
//!
//! web:
//!   image_id: ami-0123456789abcdef0
//!
//! database:
//!   db_name: shop
//!   username: shop_admin
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod outputs;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;
pub mod topology;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use error::{Result, TieredError};
pub use graph::{Graph, Node, NodeId};
pub use outputs::{EndpointProber, ProbeResult};
pub use planner::{Plan, PlanExecutor, Planner, ReconciliationResult};
pub use provider::{CloudControlProvider, ProviderAdapter, SimulatedCloud};
pub use reconciler::{ApplyReport, DriftReport, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StackState, StateStore};
pub use topology::TwoTierTopology;
