//! Configuration specification types for the two-tier deployment.
//!
//! This module defines the structs that map to `tiered.deploy.yaml`. The
//! topology shape is fixed; the file only chooses addresses, sizes and names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The root configuration structure for a tiered deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    pub state: StateConfig,
    /// Network tier.
    pub network: NetworkConfig,
    /// Web tier.
    pub web: WebConfig,
    /// Database tier.
    pub database: DatabaseConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Extra outputs in addition to the default ones.
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    /// Tags applied to every taggable resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the stack.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// AWS region; falls back to the SDK's default chain when absent.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Network tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// VPC CIDR block.
    pub vpc_cidr: String,
    /// Exactly two public subnets, one per availability zone.
    pub public_subnets: Vec<SubnetConfig>,
    /// Exactly two private subnets, one per availability zone.
    pub private_subnets: Vec<SubnetConfig>,
    /// CIDR allowed to reach the load balancer.
    #[serde(default = "default_ingress_cidr")]
    pub ingress_cidr: String,
    /// Optional CIDR allowed to SSH into the web instances.
    #[serde(default)]
    pub ssh_cidr: Option<String>,
}

/// A single subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetConfig {
    /// Subnet CIDR block, inside the VPC block.
    pub cidr: String,
    /// Availability zone, e.g. `us-east-1a`.
    pub availability_zone: String,
}

/// Web tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebConfig {
    /// Machine image for both instances.
    pub image_id: String,
    /// Instance type.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Optional key pair name.
    #[serde(default)]
    pub key_name: Option<String>,
    /// HTTP port served by the instances and the load balancer.
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Health check path on the target group.
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    /// Heading rendered on the generated landing page.
    #[serde(default = "default_page_title")]
    pub page_title: String,
}

/// Database tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database engine.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Engine version.
    #[serde(default)]
    pub engine_version: Option<String>,
    /// Instance class.
    #[serde(default = "default_instance_class")]
    pub instance_class: String,
    /// Allocated storage in GiB.
    #[serde(default = "default_storage")]
    pub allocated_storage: u32,
    /// Initial database name.
    pub db_name: String,
    /// Master user name.
    pub username: String,
    /// Name of the environment variable holding the master password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Database port.
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Whether to run a standby in a second zone.
    #[serde(default)]
    pub multi_az: bool,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Attempts per action, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Interval between asynchronous request status polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single provider operation, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

/// A named output bound to a node attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    /// Output name.
    pub name: String,
    /// Node id, e.g. `load_balancer.web`.
    pub node: String,
    /// Attribute path on the node (`id` for the provider id).
    pub attribute: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl ExecutionConfig {
    /// Initial retry delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Retry delay cap.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Poll interval for asynchronous provider requests.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout for a single provider operation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_ingress_cidr() -> String {
    String::from("0.0.0.0/0")
}

fn default_instance_type() -> String {
    String::from("t3.micro")
}

const fn default_http_port() -> u16 {
    80
}

fn default_health_path() -> String {
    String::from("/")
}

fn default_page_title() -> String {
    String::from("Two-tier web application")
}

fn default_engine() -> String {
    String::from("mysql")
}

fn default_instance_class() -> String {
    String::from("db.t3.micro")
}

const fn default_storage() -> u32 {
    20
}

fn default_password_env() -> String {
    String::from("TIERED_DB_PASSWORD")
}

const fn default_db_port() -> u16 {
    3306
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}

const fn default_operation_timeout_secs() -> u64 {
    1_800
}

impl DeployConfig {
    /// Returns the fully qualified stack name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the tags applied to every resource, including the stack tags.
    #[must_use]
    pub fn resource_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(String::from("tiered:stack"), self.project.name.clone());
        tags.insert(
            String::from("tiered:environment"),
            self.project.environment.clone(),
        );
        tags
    }
}
