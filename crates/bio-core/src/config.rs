//! Configuration parsing for the run orchestrator.
//!
//! Uses a key=value format, read from `.bio/config` by default.
//! Precedence: CLI flags > `--config` file > `.bio/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".bio/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("empty value for {0}")]
    EmptyValue(String),
}

/// Daemon and run configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which `runs/<run_id>/` directories are created.
    pub base_path: PathBuf,
    /// SQLite database path; the daemon picks a data-dir default when unset.
    pub db_path: Option<PathBuf>,

    /// Default external tool for new runs.
    pub tool: String,
    /// Per-step timeout in seconds (0 = no timeout).
    pub step_timeout_sec: u32,

    // Workflow planner
    pub planner_endpoint: String,
    pub planner_model: String,
    /// Module metadata file (JSON or YAML); built-in catalog when unset.
    pub module_catalog: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("bio-runs"),
            db_path: None,
            tool: "fastqc".to_string(),
            step_timeout_sec: 0,
            planner_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            planner_model: "gpt-4o".to_string(),
            module_catalog: None,
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

    /// Load the explicit config file if given, else `.bio/config` when present.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
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

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "base_path" => self.base_path = PathBuf::from(value),
            "db_path" => {
                self.db_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "tool" => {
                if value.is_empty() {
                    return Err(ConfigError::EmptyValue(key.to_string()));
                }
                self.tool = value.to_string();
            }
            "step_timeout_sec" => {
                self.step_timeout_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "planner_endpoint" => self.planner_endpoint = value.to_string(),
            "planner_model" => self.planner_model = value.to_string(),
            "module_catalog" => {
                self.module_catalog = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            _ => {
                // Unknown keys are tolerated so older daemons can read newer files.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Resolve relative paths against a root directory.
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.base_path.is_relative() {
            self.base_path = root.join(&self.base_path);
        }
        if let Some(ref db_path) = self.db_path {
            if db_path.is_relative() {
                self.db_path = Some(root.join(db_path));
            }
        }
        if let Some(ref catalog) = self.module_catalog {
            if catalog.is_relative() {
                self.module_catalog = Some(root.join(catalog));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.base_path, PathBuf::from("bio-runs"));
        assert_eq!(config.tool, "fastqc");
        assert_eq!(config.step_timeout_sec, 0);
        assert_eq!(config.planner_model, "gpt-4o");
        assert!(config.db_path.is_none());
        assert!(config.module_catalog.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# runs live on the scratch volume
base_path="/scratch/bio"
tool=snakemake
step_timeout_sec=3600
planner_model='gpt-4o-mini'
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/scratch/bio"));
        assert_eq!(config.tool, "snakemake");
        assert_eq!(config.step_timeout_sec, 3600);
        assert_eq!(config.planner_model, "gpt-4o-mini");
    }

    #[test]
    fn parse_rejects_line_without_equals() {
        let mut config = Config::default();
        let err = config.parse_content("base_path /tmp").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn parse_rejects_non_numeric_timeout() {
        let mut config = Config::default();
        let err = config.parse_content("step_timeout_sec=soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { .. }));
    }

    #[test]
    fn parse_rejects_empty_tool() {
        let mut config = Config::default();
        let err = config.parse_content("tool=").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn empty_db_path_clears_value() {
        let mut config = Config::default();
        config.parse_content("db_path=/var/lib/bio.db").unwrap();
        assert_eq!(config.db_path, Some(PathBuf::from("/var/lib/bio.db")));
        config.parse_content("db_path=").unwrap();
        assert!(config.db_path.is_none());
    }

    #[test]
    fn resolve_paths_only_touches_relative() {
        let mut config = Config {
            base_path: PathBuf::from("runs"),
            db_path: Some(PathBuf::from("/abs/runs.db")),
            module_catalog: Some(PathBuf::from("modules.json")),
            ..Config::default()
        };
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.base_path, PathBuf::from("/work/runs"));
        assert_eq!(config.db_path, Some(PathBuf::from("/abs/runs.db")));
        assert_eq!(
            config.module_catalog,
            Some(PathBuf::from("/work/modules.json"))
        );
    }

    #[test]
    fn from_file_reads_and_merges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "tool=bwa\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.tool, "bwa");
        assert_eq!(config.planner_model, "gpt-4o");
    }

    #[test]
    fn discover_uses_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom");
        std::fs::write(&path, "step_timeout_sec=5\n").unwrap();

        let config = Config::discover(Some(&path)).unwrap();
        assert_eq!(config.step_timeout_sec, 5);
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::from_file(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
