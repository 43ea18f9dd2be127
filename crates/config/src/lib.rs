//! Configuration loading, validation, and logging setup for taskloop.
//!
//! Loads agent settings from `~/.taskloop/config.toml` with environment
//! variable overrides. Limits are stored as written and normalised through
//! accessor methods, so a config file round-trips unchanged.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Context budget used when none (or `0`) is configured.
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 131_072;

/// Smallest context budget the builder will work with.
pub const MIN_MAX_CONTEXT_TOKENS: usize = 2_000;

/// Consecutive failed tool batches tolerated when nothing is configured.
pub const DEFAULT_MAX_CONSECUTIVE_TOOL_ERRORS: usize = 5;

/// Instructions sent as the first system message of every request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Analyse the user's intent, the workspace context, and the available \
tools before responding. Call a tool only when the request needs data or an action the tools provide, \
and always pass valid JSON arguments matching the tool schema. Otherwise answer directly in natural \
language, in the language of the user's request. Never send an empty message. After receiving tool \
results, reply with a final answer unless more data is still required.";

/// The root configuration structure.
///
/// Maps directly to `~/.taskloop/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum model steps per run; unset or `<= 0` means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thought_steps: Option<i64>,

    /// Consecutive failed tool batches before aborting; unset means 5,
    /// `<= 0` disables the cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_tool_errors: Option<i64>,

    /// Token budget for the request context; unset or `0` means the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<i64>,

    /// Replacement for the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AgentSettings {
    /// Load configuration from the default path (~/.taskloop/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `TASKLOOP_MAX_THOUGHT_STEPS`
    /// - `TASKLOOP_MAX_CONSECUTIVE_TOOL_ERRORS`
    /// - `TASKLOOP_MAX_CONTEXT_TOKENS`
    /// - `TASKLOOP_LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let int_var = |key: &'static str| -> Result<Option<i64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|e| ConfigError::EnvError {
                        var: key,
                        reason: e.to_string(),
                    }),
            }
        };

        if let Some(v) = int_var("TASKLOOP_MAX_THOUGHT_STEPS")? {
            self.max_thought_steps = Some(v);
        }
        if let Some(v) = int_var("TASKLOOP_MAX_CONSECUTIVE_TOOL_ERRORS")? {
            self.max_consecutive_tool_errors = Some(v);
        }
        if let Some(v) = int_var("TASKLOOP_MAX_CONTEXT_TOKENS")? {
            self.max_context_tokens = Some(v);
        }
        if let Some(level) = lookup("TASKLOOP_LOG_LEVEL") {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    /// Step cap for a run, `None` when unlimited.
    pub fn thought_step_limit(&self) -> Option<usize> {
        positive(self.max_thought_steps)
    }

    /// Consecutive tool error cap, `None` when disabled.
    pub fn consecutive_tool_error_limit(&self) -> Option<usize> {
        match self.max_consecutive_tool_errors {
            None => Some(DEFAULT_MAX_CONSECUTIVE_TOOL_ERRORS),
            value => positive(value),
        }
    }

    /// Effective context token budget.
    pub fn context_token_budget(&self) -> usize {
        normalise_context_tokens(self.max_context_tokens.unwrap_or(0))
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(prompt) = &self.system_prompt {
            if prompt.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "system_prompt must not be empty when set".into(),
                ));
            }
        }

        if let Some(tokens) = self.max_context_tokens {
            if tokens < 0 {
                return Err(ConfigError::ValidationError(
                    "max_context_tokens must not be negative".into(),
                ));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Generate the default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Clamp a requested context budget: `<= 0` selects the default, anything
/// else is raised to at least [`MIN_MAX_CONTEXT_TOKENS`].
pub fn normalise_context_tokens(requested: i64) -> usize {
    if requested <= 0 {
        DEFAULT_MAX_CONTEXT_TOKENS
    } else {
        (requested as usize).max(MIN_MAX_CONTEXT_TOKENS)
    }
}

fn positive(value: Option<i64>) -> Option<usize> {
    value.filter(|v| *v > 0).map(|v| v as usize)
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid value in {var}: {reason}")]
    EnvError { var: &'static str, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to initialise logging: {0}")]
    LoggingError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AgentSettings::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thought_step_limit(), None);
        assert_eq!(config.consecutive_tool_error_limit(), Some(5));
        assert_eq!(config.context_token_budget(), DEFAULT_MAX_CONTEXT_TOKENS);
        assert_eq!(config.system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn limits_are_normalised() {
        let config = AgentSettings {
            max_thought_steps: Some(0),
            max_consecutive_tool_errors: Some(-1),
            max_context_tokens: Some(10),
            ..AgentSettings::default()
        };
        assert_eq!(config.thought_step_limit(), None);
        assert_eq!(config.consecutive_tool_error_limit(), None);
        assert_eq!(config.context_token_budget(), MIN_MAX_CONTEXT_TOKENS);

        assert_eq!(normalise_context_tokens(0), DEFAULT_MAX_CONTEXT_TOKENS);
        assert_eq!(normalise_context_tokens(50_000), 50_000);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AgentSettings {
            max_thought_steps: Some(12),
            ..AgentSettings::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentSettings = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn empty_system_prompt_rejected() {
        let config = AgentSettings {
            system_prompt: Some("   ".into()),
            ..AgentSettings::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn unknown_log_level_rejected() {
        let mut config = AgentSettings::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AgentSettings::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, AgentSettings::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "max_thought_steps = 8\nmax_consecutive_tool_errors = 2\n\n[logging]\nlevel = \"debug\"\njson = true\n",
        )
        .unwrap();
        let config = AgentSettings::load_from(&path).unwrap();
        assert_eq!(config.thought_step_limit(), Some(8));
        assert_eq!(config.consecutive_tool_error_limit(), Some(2));
        assert!(config.logging.json);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_thought_steps = \"many\"").unwrap();
        assert!(matches!(
            AgentSettings::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AgentSettings {
            max_thought_steps: Some(3),
            ..AgentSettings::default()
        };
        config
            .apply_env_overrides(env(&[
                ("TASKLOOP_MAX_THOUGHT_STEPS", "20"),
                ("TASKLOOP_MAX_CONTEXT_TOKENS", "4096"),
                ("TASKLOOP_LOG_LEVEL", "DEBUG"),
            ]))
            .unwrap();
        assert_eq!(config.thought_step_limit(), Some(20));
        assert_eq!(config.context_token_budget(), 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = AgentSettings::default();
        let err = config
            .apply_env_overrides(env(&[("TASKLOOP_MAX_CONSECUTIVE_TOOL_ERRORS", "five")]))
            .unwrap_err();
        assert!(err.to_string().contains("TASKLOOP_MAX_CONSECUTIVE_TOOL_ERRORS"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AgentSettings::default_toml();
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("info"));
    }
}
