//! Configuration module for the tiered deployment reconciler.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `tiered.deploy.yaml`
//! - Validation of configuration values
//! - Computing hashes for change detection and client tokens

mod hash;
pub(crate) mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DatabaseConfig, DeployConfig, ExecutionConfig, NetworkConfig, OutputConfig, ProjectConfig,
    StateBackend, StateConfig, SubnetConfig, WebConfig,
};
pub use validator::{Cidr, ConfigValidator, ValidationError, ValidationResult};
