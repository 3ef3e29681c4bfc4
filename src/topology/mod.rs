//! Declared topology.
//!
//! Builds the fixed two-tier node set from the deployment configuration and
//! renders the bootstrap content of the web instances.

mod bootstrap;
pub(crate) mod two_tier;

pub use bootstrap::{BootstrapContext, render_user_data};
pub use two_tier::{TwoTierTopology, ids};
