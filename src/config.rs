// Configuration File Support
//
// TOML configuration for the emulator with environment variable overrides.
// Configuration files are loaded from the XDG config directory:
// ~/.config/slurm-emulator/config.toml

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::clock::parse_instant;
use crate::error::EmulatorError;
use crate::limits::fairshare::FairshareFormula;
use crate::limits::tres;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Clock and persistence settings
    pub engine: EngineConfig,

    /// Allocation policy defaults
    pub limits: LimitsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Simulated time a fresh engine starts at
    pub start_time: String,

    /// Earliest instant the clock accepts
    pub epoch_floor: String,

    /// Require users to be registered and associated before injecting usage
    pub strict_users: bool,

    /// Snapshot file used by the CLI between invocations
    pub state_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_time: "2024-01-01T00:00:00".to_string(),
            epoch_floor: "2000-01-01T00:00:00".to_string(),
            strict_users: false,
            state_file: "slurm-emulator-state.json".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn start_instant(&self) -> crate::error::Result<NaiveDateTime> {
        parse_instant(&self.start_time)
    }

    pub fn epoch_floor_instant(&self) -> crate::error::Result<NaiveDateTime> {
        parse_instant(&self.epoch_floor)
    }

    /// Check that both instants parse and the start is not before the floor
    pub fn validate(&self) -> crate::error::Result<()> {
        let start = self
            .start_instant()
            .map_err(|e| EmulatorError::InvalidConfiguration(format!("start_time: {}", e)))?;
        let floor = self
            .epoch_floor_instant()
            .map_err(|e| EmulatorError::InvalidConfiguration(format!("epoch_floor: {}", e)))?;
        if start < floor {
            return Err(EmulatorError::InvalidConfiguration(format!(
                "start_time {} is before epoch_floor {}",
                start, floor
            )));
        }
        Ok(())
    }
}

/// Allocation policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Grace fraction for accounts created without one
    pub default_grace_fraction: f64,

    /// Decay half-life for accounts created without one
    pub default_half_life_days: f64,

    /// Hard limit in node-hours for accounts created without one
    pub default_hard_limit: Option<f64>,

    /// Billing weight applied when converting node-hours to minutes
    pub billing_weight: f64,

    pub minutes_per_hour: f64,

    /// Roll unused allocation into the next period
    pub carryover_enabled: bool,

    pub fairshare: FairshareFormula,

    /// Billing weight per TRES, e.g. `"GRES/gpu" = 0.25`
    pub tres_billing_weights: BTreeMap<String, f64>,

    /// TRES of one node, used to break node-hours down into raw TRES
    pub node_tres: BTreeMap<String, u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_grace_fraction: 0.20,
            default_half_life_days: 15.0,
            default_hard_limit: None,
            billing_weight: 1.0,
            minutes_per_hour: 60.0,
            carryover_enabled: true,
            fairshare: FairshareFormula::default(),
            tres_billing_weights: tres::default_billing_weights(),
            node_tres: tres::default_node_tres(),
        }
    }
}

impl LimitsConfig {
    /// Reject values the calculator cannot work with
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: String| Err(EmulatorError::InvalidConfiguration(msg));

        if !self.default_grace_fraction.is_finite() || self.default_grace_fraction < 0.0 {
            return invalid(format!(
                "default_grace_fraction must be finite and >= 0, got {}",
                self.default_grace_fraction
            ));
        }
        if !self.default_half_life_days.is_finite() || self.default_half_life_days <= 0.0 {
            return invalid(format!(
                "default_half_life_days must be finite and > 0, got {}",
                self.default_half_life_days
            ));
        }
        if let Some(limit) = self.default_hard_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return invalid(format!("default_hard_limit must be finite and > 0, got {}", limit));
            }
        }
        if !self.billing_weight.is_finite() || self.billing_weight < 0.0 {
            return invalid(format!(
                "billing_weight must be finite and >= 0, got {}",
                self.billing_weight
            ));
        }
        if !self.minutes_per_hour.is_finite() || self.minutes_per_hour <= 0.0 {
            return invalid(format!(
                "minutes_per_hour must be finite and > 0, got {}",
                self.minutes_per_hour
            ));
        }
        if let Some(reason) = self.fairshare.validation_error() {
            return invalid(reason);
        }
        if let Some(reason) = tres::validation_error(&self.tres_billing_weights, &self.node_tres) {
            return invalid(reason);
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides()?;
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides()?;
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/slurm-emulator/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "slurm-emulator", "slurm-emulator") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("slurm-emulator")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - SLURM_EMULATOR_LOG_LEVEL
    /// - SLURM_EMULATOR_LOG_FORMAT
    /// - SLURM_EMULATOR_START_TIME
    /// - SLURM_EMULATOR_STATE_FILE
    /// - SLURM_EMULATOR_BILLING_WEIGHT
    /// - SLURM_EMULATOR_HALF_LIFE_DAYS
    /// - SLURM_EMULATOR_GRACE_FRACTION
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("SLURM_EMULATOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("SLURM_EMULATOR_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(start) = std::env::var("SLURM_EMULATOR_START_TIME") {
            self.engine.start_time = start;
        }
        if let Ok(path) = std::env::var("SLURM_EMULATOR_STATE_FILE") {
            self.engine.state_file = path;
        }

        if let Some(weight) = env_f64("SLURM_EMULATOR_BILLING_WEIGHT")? {
            self.limits.billing_weight = weight;
        }
        if let Some(half_life) = env_f64("SLURM_EMULATOR_HALF_LIFE_DAYS")? {
            self.limits.default_half_life_days = half_life;
        }
        if let Some(grace) = env_f64("SLURM_EMULATOR_GRACE_FRACTION")? {
            self.limits.default_grace_fraction = grace;
        }

        Ok(self)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.engine.state_file.trim().is_empty() {
            anyhow::bail!("State file path must not be empty");
        }

        self.engine.validate()?;
        self.limits.validate()?;

        Ok(())
    }

}

/// Numeric environment override; set but unparseable is an error
fn env_f64(var: &str) -> Result<Option<f64>> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .map(Some)
            .with_context(|| format!("{} must be a number, got '{}'", var, value)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::fairshare::SharePopulation;
    use tempfile::NamedTempFile;

    const ENV_VARS: [&str; 7] = [
        "SLURM_EMULATOR_LOG_LEVEL",
        "SLURM_EMULATOR_LOG_FORMAT",
        "SLURM_EMULATOR_START_TIME",
        "SLURM_EMULATOR_STATE_FILE",
        "SLURM_EMULATOR_BILLING_WEIGHT",
        "SLURM_EMULATOR_HALF_LIFE_DAYS",
        "SLURM_EMULATOR_GRACE_FRACTION",
    ];

    // Tests that read or write the process environment hold this lock
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn clear_env() -> std::sync::MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
        guard
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.engine.start_time, "2024-01-01T00:00:00");
        assert!(!config.engine.strict_users);
        assert_eq!(config.limits.default_grace_fraction, 0.20);
        assert_eq!(config.limits.default_half_life_days, 15.0);
        assert_eq!(config.limits.minutes_per_hour, 60.0);
        assert!(config.limits.carryover_enabled);
        assert_eq!(config.limits.default_hard_limit, None);
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_half_life() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.limits.default_half_life_days = bad;
            assert!(config.validate().is_err(), "half-life {} accepted", bad);
        }
    }

    #[test]
    fn test_config_validation_bad_weights() {
        let mut config = Config::default();
        config.limits.billing_weight = -0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.default_grace_fraction = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.fairshare = FairshareFormula::FixedDivisor { divisor: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_tres_weights() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let mut limits = LimitsConfig::default();
            limits.tres_billing_weights.insert("GRES/gpu".to_string(), bad);
            assert!(matches!(
                limits.validate(),
                Err(EmulatorError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_load_tres_weights_from_toml() {
        let _env = clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[limits.tres_billing_weights]
CPU = 0.03125
"GRES/gpu" = 0.5

[limits.node_tres]
CPU = 32
"GRES/gpu" = 2
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.limits.tres_billing_weights.len(), 2);
        assert_eq!(config.limits.tres_billing_weights["GRES/gpu"], 0.5);
        assert_eq!(config.limits.node_tres["CPU"], 32);
        assert!(!config.limits.node_tres.contains_key("Mem"));

        fs::write(temp_file.path(), "[limits.tres_billing_weights]\nCPU = -2.0\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_limits_validation_is_typed() {
        let limits = LimitsConfig {
            default_half_life_days: -3.0,
            ..LimitsConfig::default()
        };
        assert!(matches!(
            limits.validate(),
            Err(EmulatorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_config_validation_start_before_floor() {
        let mut config = Config::default();
        config.engine.start_time = "1999-06-01".to_string();
        assert!(config.validate().is_err());

        config.engine.start_time = "not a date".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _env = clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension(".nonexistent");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
        assert_eq!(config.unwrap(), Config::default());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _env = clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[engine]
start_time = "2025-04-01"
strict_users = true
state_file = "/tmp/emulator.json"

[limits]
default_grace_fraction = 0.1
default_half_life_days = 30
default_hard_limit = 5000.0
billing_weight = 2.0
carryover_enabled = false

[limits.fairshare]
formula = "fixed_divisor"
divisor = 3
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.engine.start_time, "2025-04-01");
        assert!(config.engine.strict_users);
        assert_eq!(config.engine.state_file, "/tmp/emulator.json");
        assert_eq!(config.limits.default_grace_fraction, 0.1);
        assert_eq!(config.limits.default_half_life_days, 30.0);
        assert_eq!(config.limits.default_hard_limit, Some(5000.0));
        assert_eq!(config.limits.billing_weight, 2.0);
        assert!(!config.limits.carryover_enabled);
        assert_eq!(config.limits.fairshare, FairshareFormula::FixedDivisor { divisor: 3 });
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging
level = "debug"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _env = clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[limits]\ndefault_half_life_days = -1\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _env = clear_env();

        std::env::set_var("SLURM_EMULATOR_LOG_LEVEL", "debug");
        std::env::set_var("SLURM_EMULATOR_LOG_FORMAT", "json");
        std::env::set_var("SLURM_EMULATOR_START_TIME", "2030-01-01");
        std::env::set_var("SLURM_EMULATOR_BILLING_WEIGHT", "1.5");
        std::env::set_var("SLURM_EMULATOR_HALF_LIFE_DAYS", "30");

        let config = Config::default().apply_env_overrides().unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.engine.start_time, "2030-01-01");
        assert_eq!(config.limits.billing_weight, 1.5);
        assert_eq!(config.limits.default_half_life_days, 30.0);

        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_unparseable_env_override_is_an_error() {
        let _env = clear_env();
        std::env::set_var("SLURM_EMULATOR_HALF_LIFE_DAYS", "not-a-number");

        let temp_file = NamedTempFile::new().unwrap();
        let missing = temp_file.path().with_extension("missing");
        let err = Config::load_from_path(&missing).unwrap_err();
        assert!(err.to_string().contains("SLURM_EMULATOR_HALF_LIFE_DAYS"));

        fs::write(temp_file.path(), "[limits]\nbilling_weight = 2.0\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());

        std::env::remove_var("SLURM_EMULATOR_HALF_LIFE_DAYS");
        assert!(Config::load_from_path(temp_file.path()).is_ok());
    }

    #[test]
    fn test_config_partial_toml() {
        let _env = clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[limits.fairshare]
formula = "proportional"
scale = 1000
population = "all"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(
            config.limits.fairshare,
            FairshareFormula::Proportional {
                scale: 1000,
                population: SharePopulation::All
            }
        );
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.limits.default_half_life_days, 15.0);
    }
}
