//! Configuration parsing.
//!
//! Loads a `key=value` config file merged over built-in defaults.
//! Precedence: CLI flags > config file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
}

/// Run configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory run output directories are created under.
    pub out_dir: PathBuf,

    /// Concurrent task runners. 1 means strictly sequential.
    pub workers: usize,

    /// Full pipeline cycles per task (1 initial + retries).
    pub task_attempts: u32,

    /// Full cycles of the inner compile pipeline per Compile invocation.
    pub compile_attempts: u32,

    /// Timeout per collaborator call in seconds (0 = no timeout).
    pub stage_timeout_sec: u32,

    /// Shell command producing a synthesis recipe from a sample stub.
    pub analyzer_cmd: Option<String>,

    /// Shell command producing DSP source from a recipe.
    pub generator_cmd: Option<String>,

    /// Shell command rendering DSP source into an audio file.
    pub executor_cmd: Option<String>,

    /// Optional shell command validating a rendered file. Absent means
    /// validation passes through.
    pub validator_cmd: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("output"),
            workers: 4,
            task_attempts: 11,
            compile_attempts: 10,
            stage_timeout_sec: 120,
            analyzer_cmd: None,
            generator_cmd: None,
            executor_cmd: None,
            validator_cmd: None,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply(key, value)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "out_dir" => self.out_dir = PathBuf::from(value),
            "workers" => self.workers = Self::parse_int(key, value)?,
            "task_attempts" => self.task_attempts = Self::parse_int(key, value)?,
            "compile_attempts" => self.compile_attempts = Self::parse_int(key, value)?,
            "stage_timeout_sec" => self.stage_timeout_sec = Self::parse_int(key, value)?,
            "analyzer_cmd" => self.analyzer_cmd = Some(value.to_string()),
            "generator_cmd" => self.generator_cmd = Some(value.to_string()),
            "executor_cmd" => self.executor_cmd = Some(value.to_string()),
            "validator_cmd" => self.validator_cmd = Some(value.to_string()),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Strip one layer of matching quotes.
    fn unquote(value: &str) -> &str {
        let bytes = value.as_bytes();
        if bytes.len() >= 2 {
            let first = bytes[0];
            let last = bytes[bytes.len() - 1];
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                return &value[1..value.len() - 1];
            }
        }
        value
    }

    /// Check that every command the pipeline needs is present.
    ///
    /// The validator command stays optional.
    pub fn require_commands(&self) -> Result<(), ConfigError> {
        if self.analyzer_cmd.is_none() {
            return Err(ConfigError::MissingKey("analyzer_cmd"));
        }
        if self.generator_cmd.is_none() {
            return Err(ConfigError::MissingKey("generator_cmd"));
        }
        if self.executor_cmd.is_none() {
            return Err(ConfigError::MissingKey("executor_cmd"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.task_attempts, 11);
        assert_eq!(config.compile_attempts, 10);
        assert_eq!(config.stage_timeout_sec, 120);
        assert_eq!(config.out_dir, PathBuf::from("output"));
        assert!(config.validator_cmd.is_none());
    }

    #[test]
    fn parses_key_value_content() {
        let mut config = Config::default();
        config
            .parse_content(
                r#"
# run settings
workers=2
task_attempts=5
out_dir="/tmp/sounds"
analyzer_cmd='python analyzer.py'
"#,
            )
            .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.task_attempts, 5);
        assert_eq!(config.out_dir, PathBuf::from("/tmp/sounds"));
        assert_eq!(config.analyzer_cmd.as_deref(), Some("python analyzer.py"));
        // Untouched keys keep defaults.
        assert_eq!(config.compile_attempts, 10);
    }

    #[test]
    fn rejects_unknown_key() {
        let mut config = Config::default();
        let err = config.parse_content("frobnicate=yes").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "frobnicate"));
    }

    #[test]
    fn rejects_invalid_int() {
        let mut config = Config::default();
        let err = config.parse_content("workers=many").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { .. }));
    }

    #[test]
    fn rejects_line_without_equals() {
        let mut config = Config::default();
        let err = config.parse_content("just some text").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn unquote_strips_matching_quotes_only() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'hello'"), "hello");
        assert_eq!(Config::unquote("\"hello'"), "\"hello'");
        assert_eq!(Config::unquote("plain"), "plain");
        assert_eq!(Config::unquote("\""), "\"");
    }

    #[test]
    fn require_commands_flags_missing_ones() {
        let mut config = Config::default();
        assert!(matches!(
            config.require_commands(),
            Err(ConfigError::MissingKey("analyzer_cmd"))
        ));

        config.analyzer_cmd = Some("a".to_string());
        config.generator_cmd = Some("g".to_string());
        assert!(matches!(
            config.require_commands(),
            Err(ConfigError::MissingKey("executor_cmd"))
        ));

        config.executor_cmd = Some("e".to_string());
        assert!(config.require_commands().is_ok());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "workers=1\nstage_timeout_sec=30\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.stage_timeout_sec, 30);
    }
}
