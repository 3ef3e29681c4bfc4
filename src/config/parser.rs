//! Configuration parser for loading deployment files.
//!
//! This module handles loading configuration from YAML files, `.env` files
//! and environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TieredError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TieredError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TieredError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            TieredError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!("Parsed configuration for stack: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Overrides use the form `TIERED_<SECTION>_<KEY>`, e.g. `TIERED_PROJECT_NAME`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies overrides from an environment lookup.
    pub fn apply_overrides<F>(config: &mut DeployConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("TIERED_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("TIERED_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(region) = lookup("TIERED_REGION") {
            debug!("Overriding project.region from environment");
            config.project.region = Some(region);
        }

        if let Some(bucket) = lookup("TIERED_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("TIERED_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TieredError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the database master password from the configured variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set or empty.
    pub fn database_password(config: &DeployConfig) -> Result<String> {
        let name = &config.database.password_env;
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(TieredError::Config(ConfigError::MissingEnvVar { name: name.clone() })),
        }
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "tiered.deploy.yaml",
    "tiered.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TieredError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::StateBackend;

    pub(crate) const SAMPLE: &str = r#"
project:
  name: shop
  environment: prod
  region: us-east-1
state:
  backend: local
network:
  vpc_cidr: 10.0.0.0/16
  public_subnets:
    - { cidr: 10.0.1.0/24, availability_zone: us-east-1a }
    - { cidr: 10.0.2.0/24, availability_zone: us-east-1b }
  private_subnets:
    - { cidr: 10.0.11.0/24, availability_zone: us-east-1a }
    - { cidr: 10.0.12.0/24, availability_zone: us-east-1b }
web:
  image_id: ami-0abcdef1234567890
database:
  db_name: shop
  username: admin
outputs:
  - name: vpc_id
    node: vpc.main
    attribute: id
"#;

    /// Parsed sample configuration shared by tests across modules.
    pub(crate) fn sample_config() -> DeployConfig {
        ConfigParser::new()
            .parse_yaml(SAMPLE, None)
            .expect("sample config parses")
    }

    #[test]
    fn test_parse_sample_config() {
        let config = sample_config();
        assert_eq!(config.project.name, "shop");
        assert_eq!(config.qualified_name(), "shop-prod");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.network.public_subnets.len(), 2);
        assert_eq!(config.web.port, 80);
        assert_eq!(config.database.password_env, "TIERED_DB_PASSWORD");
        assert_eq!(config.execution.max_parallel, 4);
        assert_eq!(config.outputs[0].node, "vpc.main");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", None)
            .expect_err("invalid yaml");
        assert!(matches!(err, TieredError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = sample_config();
        ConfigParser::apply_overrides(&mut config, |name| match name {
            "TIERED_PROJECT_ENVIRONMENT" => Some(String::from("staging")),
            "TIERED_STATE_BUCKET" => Some(String::from("shop-state")),
            _ => None,
        });
        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.state.bucket.as_deref(), Some("shop-state"));
        assert_eq!(config.project.name, "shop");
    }

    #[test]
    fn test_find_config_file_walks_upwards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("tiered.deploy.yaml"), SAMPLE).expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("tiered.deploy.yaml"));
    }

    #[test]
    fn test_missing_config_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/tiered.deploy.yaml")
            .expect_err("missing");
        assert!(matches!(err, TieredError::Config(ConfigError::FileNotFound { .. })));
    }
}
