//! rvm Configuration
//!
//! Handles parsing and management of rvm.toml configuration files.

use crate::interp::memory::{DEFAULT_MAX_WORDS, DEFAULT_PAGE_WORDS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// File name searched for by [`RvmConfig::find_and_load`]
pub const CONFIG_FILE: &str = "rvm.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching rvm.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RvmConfig {
    /// Interpreter memory and budget
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Log filter used when RUST_LOG is unset
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RvmConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: RvmConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir()?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    ///
    /// Falls back to defaults when no rvm.toml exists.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Interpreter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// Words added each time the stack or heap grows
    #[serde(default = "default_page_words")]
    pub page_words: usize,

    /// Upper bound on each of the stack and heap, in words
    #[serde(default = "default_max_memory_words")]
    pub max_memory_words: usize,

    /// Stop with an error after this many steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instructions: Option<u64>,
}

fn default_page_words() -> usize {
    DEFAULT_PAGE_WORDS
}

fn default_max_memory_words() -> usize {
    DEFAULT_MAX_WORDS
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            page_words: DEFAULT_PAGE_WORDS,
            max_memory_words: DEFAULT_MAX_WORDS,
            max_instructions: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default directive for the tracing EnvFilter, e.g. "warn" or "rvm=debug"
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RvmConfig::default();
        assert_eq!(config.interpreter.page_words, 1024);
        assert_eq!(config.interpreter.max_memory_words, 16 * 1024 * 1024);
        assert_eq!(config.interpreter.max_instructions, None);
        assert_eq!(config.logging.filter, "warn");
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[interpreter]
page_words = 256
max_instructions = 5000

[logging]
filter = "rvm=debug"
"#;
        let config: RvmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.interpreter.page_words, 256);
        assert_eq!(config.interpreter.max_memory_words, DEFAULT_MAX_WORDS);
        assert_eq!(config.interpreter.max_instructions, Some(5000));
        assert_eq!(config.logging.filter, "rvm=debug");
    }

    #[test]
    fn test_empty_config() {
        let config: RvmConfig = toml::from_str("").unwrap();
        assert_eq!(config, RvmConfig::default());
    }

    #[test]
    fn test_save_and_find() {
        let dir = std::env::temp_dir().join(format!("rvm-config-{}", std::process::id()));
        let nested = dir.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = RvmConfig::default();
        config.interpreter.max_instructions = Some(42);
        config.save(&dir.join(CONFIG_FILE)).unwrap();

        let found = RvmConfig::find_and_load(&nested).unwrap();
        assert_eq!(found, config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = RvmConfig::load(Path::new("/nonexistent/rvm.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
