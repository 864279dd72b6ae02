//! Configuration management for the test rig

use crate::error::{Result, RigError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub transport: TransportConfig,
    pub run_control: RunControlConfig,
    pub intercept: InterceptConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| RigError::InvalidConfig(format!("Failed to read config file: {}", e)))?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| RigError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.run_control.cont_retries == 0 {
            return Err(RigError::InvalidConfig("run_control.cont_retries must be > 0".to_string()));
        }
        if self.run_control.halt_retries == 0 {
            return Err(RigError::InvalidConfig("run_control.halt_retries must be > 0".to_string()));
        }
        if self.run_control.state_poll_ms == 0 {
            return Err(RigError::InvalidConfig("run_control.state_poll_ms must be > 0".to_string()));
        }
        if self.intercept.port == 0 {
            return Err(RigError::InvalidConfig("intercept.port must be > 0".to_string()));
        }
        if self.intercept.default_wait_timeout_ms == 0 {
            return Err(RigError::InvalidConfig(
                "intercept.default_wait_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RigError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }
}

/// MI transport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Default timeout for blocking commands; `None` waits indefinitely
    pub default_timeout_ms: Option<u64>,
    /// Log every command/response pair at debug level
    pub trace_commands: bool,
    /// Remote debug server to select on connect (e.g. "localhost:2331")
    pub remote_addr: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Some(10_000),
            trace_commands: false,
            remote_addr: None,
        }
    }
}

/// Run-state machine settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunControlConfig {
    /// Continue attempts before giving up
    pub cont_retries: u32,
    /// Interrupt attempts before giving up
    pub halt_retries: u32,
    /// Wait slice between run-state checks in milliseconds
    pub state_poll_ms: u64,
    /// Delay applied after a successful continue in milliseconds
    pub settle_delay_ms: u64,
    /// How long to poll until the debugger's internal state agrees with a
    /// stop notification, in milliseconds
    pub halted_probe_window_ms: u64,
    /// Upper bound on single-steps used to leave an IT block after halt
    pub it_block_step_limit: u32,
}

impl Default for RunControlConfig {
    fn default() -> Self {
        Self {
            cont_retries: 40,
            halt_retries: 20,
            state_poll_ms: 100,
            settle_delay_ms: 0,
            halted_probe_window_ms: 1000,
            it_block_step_limit: 16,
        }
    }
}

/// Intercept breakpoint channel settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InterceptConfig {
    /// Loopback port the companion script connects back to
    pub port: u16,
    /// How long to wait for the companion's TCP connection in milliseconds
    pub accept_timeout_ms: u64,
    /// Per-step timeout during intercept point teardown in milliseconds
    pub teardown_timeout_ms: u64,
    /// Override timeout for `wait_complete` without an explicit deadline,
    /// in milliseconds
    pub default_wait_timeout_ms: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            port: 20080,
            accept_timeout_ms: 5000,
            teardown_timeout_ms: 1000,
            default_wait_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Initialize the logging system from configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &config.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.intercept.port, 20080);
        assert_eq!(config.run_control.cont_retries, 40);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("[transport]"));
        assert!(toml_str.contains("[intercept]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.intercept.port, config.intercept.port);
        assert_eq!(parsed.run_control.halt_retries, config.run_control.halt_retries);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.run_control.cont_retries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.intercept.port = 0;
        assert!(config.validate().is_err());
    }
}
