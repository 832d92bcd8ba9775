//! Configuration module for the script host.

use serde::Deserialize;
use std::path::Path;

use crate::script::{Bootstrap, HostSettings, ResourceLimits, DEFAULT_AUTOLOAD_FILE};
use crate::{Result, ScriptHostError};

/// Script discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    /// Directory all script paths are relative to.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Folder scanned for scripts, relative to `base_dir`.
    #[serde(default = "default_root")]
    pub root: String,
    /// Autoload list, relative to `base_dir`.
    #[serde(default = "default_autoload_file")]
    pub autoload_file: String,
    /// Replacement for the built-in bootstrap definitions, relative to `base_dir`.
    #[serde(default)]
    pub bootstrap_file: Option<String>,
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_root() -> String {
    "lua".to_string()
}

fn default_autoload_file() -> String {
    DEFAULT_AUTOLOAD_FILE.to_string()
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            root: default_root(),
            autoload_file: default_autoload_file(),
            bootstrap_file: None,
        }
    }
}

/// Interpreter resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Instructions per call into a script (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Memory per interpreter in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory_mb() -> usize {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty disables file logging.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/scripthost.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Script discovery configuration.
    #[serde(default)]
    pub scripts: ScriptsConfig,
    /// Interpreter limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ScriptHostError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ScriptHostError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `SCRIPTHOST_SCRIPT_ROOT`: Override the scanned script folder
    /// - `SCRIPTHOST_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("SCRIPTHOST_SCRIPT_ROOT") {
            if !root.is_empty() {
                self.scripts.root = root;
            }
        }
        if let Ok(level) = std::env::var("SCRIPTHOST_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - The script root is empty, absolute or escapes the base directory
    /// - The autoload file name is empty
    /// - The memory limit does not fit in bytes
    pub fn validate(&self) -> Result<()> {
        let root = &self.scripts.root;
        if root.is_empty() || root.starts_with('/') || root.split('/').any(|part| part == "..") {
            return Err(ScriptHostError::Validation(format!(
                "script root '{root}' must be a relative folder below base_dir"
            )));
        }
        if self.scripts.autoload_file.trim().is_empty() {
            return Err(ScriptHostError::Validation(
                "autoload_file must not be empty".to_string(),
            ));
        }
        self.resource_limits()?;
        Ok(())
    }

    /// Interpreter limits in runtime units.
    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        let max_memory = self
            .limits
            .max_memory_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                ScriptHostError::Validation(format!(
                    "max_memory_mb {} is too large",
                    self.limits.max_memory_mb
                ))
            })?;

        Ok(ResourceLimits {
            max_instructions: self.limits.max_instructions,
            max_memory,
        })
    }

    /// Settings for a script registry, reading the bootstrap file if one is set.
    pub fn host_settings(&self) -> Result<HostSettings> {
        let bootstrap = match &self.scripts.bootstrap_file {
            Some(path) => Bootstrap {
                name: format!("@{path}"),
                source: std::fs::read_to_string(Path::new(&self.scripts.base_dir).join(path))?,
            },
            None => Bootstrap::default(),
        };

        Ok(HostSettings {
            autoload_file: self.scripts.autoload_file.clone(),
            limits: self.resource_limits()?,
            bootstrap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.scripts.base_dir, ".");
        assert_eq!(config.scripts.root, "lua");
        assert_eq!(config.scripts.autoload_file, "luafiles.cfg");
        assert!(config.scripts.bootstrap_file.is_none());
        assert_eq!(config.limits.max_instructions, 1_000_000);
        assert_eq!(config.limits.max_memory_mb, 10);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/scripthost.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[scripts]
base_dir = "/srv/game"
root = "mods"
autoload_file = "mods.cfg"
bootstrap_file = "/srv/game/bootstrap.lua"

[limits]
max_instructions = 5000
max_memory_mb = 4

[logging]
level = "debug"
file = "logs/test.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.scripts.base_dir, "/srv/game");
        assert_eq!(config.scripts.root, "mods");
        assert_eq!(config.scripts.autoload_file, "mods.cfg");
        assert_eq!(
            config.scripts.bootstrap_file.as_deref(),
            Some("/srv/game/bootstrap.lua")
        );
        assert_eq!(config.limits.max_instructions, 5000);
        assert_eq!(config.limits.max_memory_mb, 4);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "logs/test.log");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[limits]
max_instructions = 0
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.limits.max_instructions, 0);
        assert_eq!(config.limits.max_memory_mb, 10);
        assert_eq!(config.scripts.root, "lua");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.scripts.root, "lua");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");

        assert!(result.is_err());
        if let Err(ScriptHostError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(ScriptHostError::Io(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scripts]\nroot = \"plugins\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.scripts.root, "plugins");
    }

    #[test]
    fn test_apply_env_overrides() {
        let original_root = std::env::var("SCRIPTHOST_SCRIPT_ROOT").ok();
        let original_level = std::env::var("SCRIPTHOST_LOG_LEVEL").ok();

        std::env::set_var("SCRIPTHOST_SCRIPT_ROOT", "custom");
        std::env::set_var("SCRIPTHOST_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.scripts.root, "custom");
        // Empty values do not override
        assert_eq!(config.logging.level, "info");

        match original_root {
            Some(val) => std::env::set_var("SCRIPTHOST_SCRIPT_ROOT", val),
            None => std::env::remove_var("SCRIPTHOST_SCRIPT_ROOT"),
        }
        match original_level {
            Some(val) => std::env::set_var("SCRIPTHOST_LOG_LEVEL", val),
            None => std::env::remove_var("SCRIPTHOST_LOG_LEVEL"),
        }
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        for root in ["", "/abs", "../up", "lua/../.."] {
            let mut config = Config::default();
            config.scripts.root = root.to_string();
            assert!(
                matches!(config.validate(), Err(ScriptHostError::Validation(_))),
                "root {root:?} should be rejected"
            );
        }

        let mut config = Config::default();
        config.scripts.autoload_file = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resource_limits() {
        let mut config = Config::default();
        config.limits.max_memory_mb = 2;
        config.limits.max_instructions = 42;

        let limits = config.resource_limits().unwrap();
        assert_eq!(limits.max_memory, 2 * 1024 * 1024);
        assert_eq!(limits.max_instructions, 42);
    }

    #[test]
    fn test_oversized_memory_limit_is_rejected() {
        let mut config = Config::default();
        config.limits.max_memory_mb = usize::MAX / 2;

        assert!(matches!(
            config.resource_limits(),
            Err(ScriptHostError::Validation(_))
        ));
        assert!(matches!(
            config.validate(),
            Err(ScriptHostError::Validation(_))
        ));
        assert!(config.host_settings().is_err());
    }

    #[test]
    fn test_host_settings_with_bootstrap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.lua");
        std::fs::write(&path, "Custom = true").unwrap();

        let mut config = Config::default();
        config.scripts.bootstrap_file = Some(path.to_string_lossy().into_owned());
        config.scripts.autoload_file = "auto.cfg".to_string();

        let settings = config.host_settings().unwrap();
        assert_eq!(settings.bootstrap.source, "Custom = true");
        assert_eq!(settings.autoload_file, "auto.cfg");
    }

    #[test]
    fn test_bootstrap_file_is_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        std::fs::write(dir.path().join("shared/boot.lua"), "Relative = true").unwrap();

        let mut config = Config::default();
        config.scripts.base_dir = dir.path().to_string_lossy().into_owned();
        config.scripts.bootstrap_file = Some("shared/boot.lua".to_string());

        let settings = config.host_settings().unwrap();
        assert_eq!(settings.bootstrap.source, "Relative = true");
        assert_eq!(settings.bootstrap.name, "@shared/boot.lua");
    }

    #[test]
    fn test_host_settings_missing_bootstrap_file() {
        let mut config = Config::default();
        config.scripts.bootstrap_file = Some("does/not/exist.lua".to_string());
        assert!(matches!(config.host_settings(), Err(ScriptHostError::Io(_))));
    }
}
