//! Stack outputs.
//!
//! Outputs are named values read from recorded state once a run converges:
//! the load balancer DNS name, the public addresses of the web instances and
//! the database endpoint, plus any extras declared in the configuration.

mod probe;
mod resolver;

pub use probe::{EndpointProber, ProbeResult};
pub use resolver::{DEFAULT_OUTPUT_NAMES, OutputSpec, default_outputs, resolve_outputs, validate_outputs};
