//! Daemon and client configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQMODEL_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DAQMODEL_APPLICATION__LOG_LEVEL=debug
//! DAQMODEL_BACKEND__LISTEN=0.0.0.0:7410
//! DAQMODEL_REMOTE__CALL_TIMEOUT_MS=2000
//! DAQMODEL_REMOTE__BACKOFF__MAX_ATTEMPTS=20
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_model::config::DaqModelConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DaqModelConfig::load_from("config/daq-model.toml")?;
//!     println!("Listening on {}", config.backend.listen);
//!     println!("Components: {}", config.components.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::logging::LogFormat;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQMODEL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaqModelConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Backend endpoint settings
    #[serde(default)]
    pub backend: BackendConfig,
    /// Remote client settings
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Driver-backed components hosted by the daemon
    #[serde(default)]
    pub components: Vec<ComponentDefinition>,
    /// Composites built from the components above
    #[serde(default)]
    pub composites: Vec<CompositeDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Human-readable or JSON log lines
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Backend (daemon) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Socket address the component server binds to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-component terminate timeout in milliseconds
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            terminate_timeout_ms: default_terminate_timeout(),
        }
    }
}

impl BackendConfig {
    /// Terminate timeout as a `Duration`.
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Remote client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Timeout of one request/reply round trip in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Timeout of establishing the TCP connection in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Reconnection policy of the push channel
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Capacity of the outgoing frame queue of one connection
    #[serde(default = "default_push_buffer")]
    pub push_buffer: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            backoff: BackoffPolicy::default(),
            push_buffer: default_push_buffer(),
        }
    }
}

impl RemoteConfig {
    /// Call timeout as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Bounded exponential backoff used when the push channel reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first attempt, in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub initial_delay_ms: u64,
    /// Upper bound of a single delay, in milliseconds
    #[serde(default = "default_backoff_max")]
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Attempts before giving up (0 = never give up)
    #[serde(default = "default_backoff_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_backoff_initial(),
            max_delay_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
            max_attempts: default_backoff_attempts(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// True if another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

/// One driver-backed component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDefinition {
    /// Unique component name
    pub name: String,
    /// Driver type (see [`crate::sim::driver_types`])
    pub driver: String,
    /// Role tag; defaults to the driver's own role
    #[serde(default)]
    pub role: Option<String>,
    /// Hardware resource the component's actions are serialized on; defaults to `name`
    #[serde(default)]
    pub resource: Option<String>,
    /// Whether the component is created at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Components whose metadata this one affects
    #[serde(default)]
    pub affects: Vec<String>,
    /// Driver-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

impl ComponentDefinition {
    /// Resource name, falling back to the component name.
    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.name)
    }
}

/// One composite component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDefinition {
    /// Unique component name
    pub name: String,
    /// Role tag
    pub role: String,
    /// Dependencies in priority order (first wins on attribute name conflicts)
    #[serde(default)]
    pub dependencies: Vec<CompositeDependency>,
    /// Components whose metadata this one affects
    #[serde(default)]
    pub affects: Vec<String>,
}

/// A role inside a composite, bound to a configured component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDependency {
    /// Role of the dependency inside the composite
    pub role: String,
    /// Name of a configured component
    pub component: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "daq-model".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:7410".to_string()
}

fn default_terminate_timeout() -> u64 {
    5000
}

fn default_call_timeout() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_push_buffer() -> usize {
    256
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_attempts() -> u32 {
    10
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DaqModelConfig {
    /// Load configuration from a TOML file and `DAQMODEL_` environment variables.
    ///
    /// Environment variables take precedence over the file; fields missing from both use
    /// their defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// [`DaqError::Config`] if the file cannot be parsed, [`DaqError::Configuration`] if
    /// validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> DaqResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeouts are non-zero and the backoff multiplier is at least 1
    /// - Component and composite names are unique
    /// - Driver types are known
    /// - `affects` and composite dependencies name defined components
    /// - Composites have at least one dependency and no duplicate roles
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.backend.terminate_timeout_ms == 0
            || self.remote.call_timeout_ms == 0
            || self.remote.connect_timeout_ms == 0
        {
            return Err(DaqError::Configuration(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if !(self.remote.backoff.multiplier >= 1.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid backoff multiplier {}. Must be >= 1",
                self.remote.backoff.multiplier
            )));
        }
        if self.remote.push_buffer == 0 {
            return Err(DaqError::Configuration(
                "push_buffer must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let known = crate::sim::driver_types();
        for component in self.enabled_components() {
            if !names.insert(component.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate component name: '{}'",
                    component.name
                )));
            }
            if !known.contains(&component.driver.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Invalid driver '{}' for component '{}'. Must be one of: {}",
                    component.driver,
                    component.name,
                    known.join(", ")
                )));
            }
        }

        for composite in &self.composites {
            if composite.dependencies.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Composite '{}' needs at least one dependency",
                    composite.name
                )));
            }
            let mut roles = HashSet::new();
            for dependency in &composite.dependencies {
                if !roles.insert(dependency.role.as_str()) {
                    return Err(DaqError::Configuration(format!(
                        "Composite '{}' declares role '{}' twice",
                        composite.name, dependency.role
                    )));
                }
                if !names.contains(dependency.component.as_str()) {
                    return Err(DaqError::Configuration(format!(
                        "Composite '{}' depends on undefined component '{}'",
                        composite.name, dependency.component
                    )));
                }
            }
        }
        for composite in &self.composites {
            if !names.insert(composite.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate component name: '{}'",
                    composite.name
                )));
            }
        }

        let affects = self
            .enabled_components()
            .map(|c| (&c.name, &c.affects))
            .chain(self.composites.iter().map(|c| (&c.name, &c.affects)));
        for (name, targets) in affects {
            if let Some(missing) = targets.iter().find(|t| !names.contains(t.as_str())) {
                return Err(DaqError::Configuration(format!(
                    "Component '{name}' affects undefined component '{missing}'"
                )));
            }
        }

        Ok(())
    }

    /// Enabled component definitions, in file order.
    pub fn enabled_components(&self) -> impl Iterator<Item = &ComponentDefinition> {
        self.components.iter().filter(|c| c.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "bench"
        log_level = "debug"

        [[components]]
        name = "sensor"
        driver = "sim_sensor"
        affects = []

        [[components]]
        name = "lens"
        driver = "sim_lens"
        affects = ["ccd"]
        params = { magnification = 10.0 }

        [[composites]]
        name = "ccd"
        role = "camera"
        dependencies = [{ role = "sensor", component = "sensor" }]
    "#;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = DaqModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backend.listen, "127.0.0.1:7410");
        assert_eq!(config.remote.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_from_toml() {
        let config = DaqModelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.components.len(), 2);
        assert_eq!(config.components[1].resource(), "lens");
        assert_eq!(
            config.components[1].params.get("magnification"),
            Some(&toml::Value::Float(10.0))
        );
        assert_eq!(config.composites[0].dependencies[0].component, "sensor");
        // untouched sections keep their defaults
        assert_eq!(config.remote.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = DaqModelConfig::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_config_validation_unknown_driver() {
        let err = DaqModelConfig::from_toml_str(
            r#"
            [[components]]
            name = "x"
            driver = "teleporter"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_config_validation_dangling_references() {
        let err = DaqModelConfig::from_toml_str(
            r#"
            [[components]]
            name = "lens"
            driver = "sim_lens"
            affects = ["camera"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined component 'camera'"));

        let err = DaqModelConfig::from_toml_str(
            r#"
            [[composites]]
            name = "ccd"
            role = "camera"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one dependency"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = DaqModelConfig::load_from(&path).unwrap();
        assert_eq!(config.composites[0].name, "ccd");
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = BackoffPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            max_attempts: 3,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}
