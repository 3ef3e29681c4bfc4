//! Configuration validation for deployment files.
//!
//! Every check runs and records its findings; the first error is returned
//! to the caller, warnings are kept on the result for display.

use crate::error::{ConfigError, Result, TieredError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeployConfig, NetworkConfig, StateBackend, SubnetConfig};
use crate::outputs::DEFAULT_OUTPUT_NAMES;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// An IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/n`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let addr: std::net::Ipv4Addr = addr.parse().ok()?;
        let mask = Self::mask(prefix);
        Some(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    const fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    /// Returns true if `other` lies entirely inside this block.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix && (other.network & Self::mask(self.prefix)) == self.network
    }

    /// Returns true if the two blocks share any address.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Collects every finding without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_network(&config.network, &mut result);
        Self::validate_web(config, &mut result);
        Self::validate_database(config, &mut result);
        Self::validate_execution(config, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first) = result.errors.first() {
            return Err(TieredError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    fn validate_project(config: &DeployConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }

        // Load balancer and target group names are capped at 32 characters.
        if config.qualified_name().len() > 28 {
            result.error(
                "project.name",
                "Project name and environment together must not exceed 28 characters",
            );
        }

        if project.region.is_none() {
            result
                .warnings
                .push(String::from("No region configured, using the AWS default chain"));
        }
    }

    fn validate_state(config: &DeployConfig, result: &mut ValidationResult) {
        match config.state.backend {
            StateBackend::S3 => {
                if config.state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {}
        }
    }

    fn validate_network(network: &NetworkConfig, result: &mut ValidationResult) {
        let Some(vpc) = Cidr::parse(&network.vpc_cidr) else {
            result.error(
                "network.vpc_cidr",
                format!("Invalid CIDR block: {}", network.vpc_cidr),
            );
            return;
        };

        if !(16..=28).contains(&vpc.prefix) {
            result.error("network.vpc_cidr", "VPC prefix length must be between /16 and /28");
        }

        let mut seen: Vec<(String, Cidr)> = Vec::new();
        for (tier, subnets) in [
            ("public_subnets", &network.public_subnets),
            ("private_subnets", &network.private_subnets),
        ] {
            Self::validate_subnets(tier, subnets, vpc, &mut seen, result);
        }

        if Cidr::parse(&network.ingress_cidr).is_none() {
            result.error(
                "network.ingress_cidr",
                format!("Invalid CIDR block: {}", network.ingress_cidr),
            );
        }

        if let Some(ssh) = &network.ssh_cidr {
            if Cidr::parse(ssh).is_none() {
                result.error("network.ssh_cidr", format!("Invalid CIDR block: {ssh}"));
            } else if ssh == "0.0.0.0/0" {
                result
                    .warnings
                    .push(String::from("SSH is open to the whole internet"));
            }
        }
    }

    fn validate_subnets(
        tier: &str,
        subnets: &[SubnetConfig],
        vpc: Cidr,
        seen: &mut Vec<(String, Cidr)>,
        result: &mut ValidationResult,
    ) {
        if subnets.len() != 2 {
            result.error(
                format!("network.{tier}"),
                format!("Exactly two {} are required, found {}", tier.replace('_', " "), subnets.len()),
            );
        }

        let zones: HashSet<&str> = subnets.iter().map(|s| s.availability_zone.as_str()).collect();
        if subnets.len() == 2 && zones.len() < 2 {
            result.error(
                format!("network.{tier}"),
                "Subnets of a tier must be in different availability zones",
            );
        }

        for (i, subnet) in subnets.iter().enumerate() {
            let field = format!("network.{tier}[{i}]");
            if subnet.availability_zone.is_empty() {
                result.error(format!("{field}.availability_zone"), "Availability zone cannot be empty");
            }

            let Some(cidr) = Cidr::parse(&subnet.cidr) else {
                result.error(format!("{field}.cidr"), format!("Invalid CIDR block: {}", subnet.cidr));
                continue;
            };

            if !vpc.contains(&cidr) {
                result.error(
                    format!("{field}.cidr"),
                    format!("Subnet {} is outside the VPC block", subnet.cidr),
                );
            }

            if let Some((other, _)) = seen.iter().find(|(_, c)| c.overlaps(&cidr)) {
                result.error(
                    format!("{field}.cidr"),
                    format!("Subnet {} overlaps {other}", subnet.cidr),
                );
            }
            seen.push((field, cidr));
        }
    }

    fn validate_web(config: &DeployConfig, result: &mut ValidationResult) {
        let web = &config.web;
        if !web.image_id.starts_with("ami-") {
            result.error("web.image_id", format!("Invalid image id: {}", web.image_id));
        }
        if web.instance_type.is_empty() {
            result.error("web.instance_type", "Instance type cannot be empty");
        }
        if web.port == 0 {
            result.error("web.port", "Port cannot be 0");
        }
        if !web.health_check_path.starts_with('/') {
            result.error("web.health_check_path", "Health check path must start with '/'");
        }
    }

    fn validate_database(config: &DeployConfig, result: &mut ValidationResult) {
        let db = &config.database;
        if !db.db_name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            || !db.db_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            result.error(
                "database.db_name",
                format!("Database name '{}' must be alphanumeric and start with a letter", db.db_name),
            );
        }
        if db.username.is_empty() {
            result.error("database.username", "Master username cannot be empty");
        }
        if db.password_env.is_empty() {
            result.error("database.password_env", "Password variable name cannot be empty");
        }
        if db.allocated_storage < 20 {
            result.error("database.allocated_storage", "Allocated storage must be at least 20 GiB");
        }
        if db.port == 0 {
            result.error("database.port", "Port cannot be 0");
        }
        if db.multi_az && config.project.environment == "dev" {
            result
                .warnings
                .push(String::from("Multi-AZ database in a dev environment doubles its cost"));
        }
    }

    fn validate_execution(config: &DeployConfig, result: &mut ValidationResult) {
        let exec = &config.execution;
        if exec.max_parallel == 0 {
            result.error("execution.max_parallel", "At least one worker is required");
        }
        if exec.max_attempts == 0 {
            result.error("execution.max_attempts", "At least one attempt is required");
        }
        if exec.base_delay_ms > exec.max_delay_ms {
            result.error("execution.base_delay_ms", "Base delay cannot exceed max delay");
        }
    }

    fn validate_outputs(config: &DeployConfig, result: &mut ValidationResult) {
        let mut names: HashSet<&str> = DEFAULT_OUTPUT_NAMES.iter().copied().collect();
        for (i, output) in config.outputs.iter().enumerate() {
            if !names.insert(output.name.as_str()) {
                result.error(
                    format!("outputs[{i}].name"),
                    ConfigError::DuplicateOutput {
                        name: output.name.clone(),
                    }
                    .to_string(),
                );
            }
            if output.attribute.is_empty() {
                result.error(format!("outputs[{i}].attribute"), "Attribute cannot be empty");
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::tests::sample_config;
    use crate::config::OutputConfig;

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("shop"));
        assert!(is_valid_name("my-stack-123"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Shop"));
        assert!(!is_valid_name("1shop"));
        assert!(!is_valid_name("shop_app"));
        assert!(!is_valid_name("shop-"));
        assert!(!is_valid_name("shop--app"));
    }

    #[test]
    fn test_cidr_containment() {
        let vpc = Cidr::parse("10.0.0.0/16").expect("valid");
        let inside = Cidr::parse("10.0.3.0/24").expect("valid");
        let outside = Cidr::parse("10.1.0.0/24").expect("valid");
        assert!(vpc.contains(&inside));
        assert!(!vpc.contains(&outside));
        assert!(inside.overlaps(&vpc));
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("10.0.0/24").is_none());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let result = ConfigValidator::new().validate(&sample_config()).expect("valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_subnet_count_is_enforced() {
        let mut config = sample_config();
        config.network.private_subnets.pop();
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "network.private_subnets"));
    }

    #[test]
    fn test_subnet_outside_vpc_and_overlap() {
        let mut config = sample_config();
        config.network.public_subnets[0].cidr = String::from("192.168.0.0/24");
        config.network.private_subnets[1].cidr = String::from("10.0.2.0/24");
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert!(result.errors[0].message.contains("outside the VPC"));
        assert!(result.errors[1].message.contains("overlaps"));
    }

    #[test]
    fn test_duplicate_output_name() {
        let mut config = sample_config();
        config.outputs.push(OutputConfig {
            name: String::from("database_endpoint"),
            node: String::from("db_instance.main"),
            attribute: String::from("address"),
        });
        let err = ConfigValidator::new().validate(&config).expect_err("duplicate");
        assert!(err.to_string().contains("database_endpoint"));
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let mut config = sample_config();
        config.state.backend = StateBackend::S3;
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "state.bucket"));
    }
}
