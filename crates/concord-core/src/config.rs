//! Configuration management for Concord.
//!
//! Loads configuration from ${CONCORD_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::permissions::PermissionPolicy;
use crate::core::session::EngineKind;

pub mod paths {
    //! Path resolution for Concord configuration and data directories.
    //!
    //! CONCORD_HOME resolution order:
    //! 1. CONCORD_HOME environment variable (if set)
    //! 2. ~/.config/concord (default)

    use std::path::PathBuf;

    /// Returns the Concord home directory.
    pub fn concord_home() -> PathBuf {
        if let Ok(home) = std::env::var("CONCORD_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("concord"))
            .unwrap_or_else(|| PathBuf::from(".concord"))
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        concord_home().join("config.toml")
    }

    /// Returns the directory holding one sub-directory of session files per project.
    pub fn projects_dir() -> PathBuf {
        concord_home().join("projects")
    }

    /// Returns the directory for log files.
    pub fn logs_dir() -> PathBuf {
        concord_home().join("logs")
    }
}

/// How to launch one engine backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLaunchConfig {
    /// Executable name or path.
    pub binary: String,
    /// Extra arguments appended after the adapter's own flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Model used when a session does not pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EngineLaunchConfig {
    fn new(binary: &str, args: &[&str]) -> Self {
        Self {
            binary: binary.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            env: BTreeMap::new(),
            model: None,
        }
    }
}

impl Default for EngineLaunchConfig {
    fn default() -> Self {
        Self::new("", &[])
    }
}

/// Launch settings for every engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub claude: EngineLaunchConfig,
    pub acp: EngineLaunchConfig,
    pub codex: EngineLaunchConfig,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            claude: EngineLaunchConfig::new("claude", &[]),
            acp: EngineLaunchConfig::new("gemini", &["--experimental-acp"]),
            codex: EngineLaunchConfig::new("codex", &["app-server"]),
        }
    }
}

impl EnginesConfig {
    pub fn get(&self, kind: EngineKind) -> &EngineLaunchConfig {
        match kind {
            EngineKind::Claude => &self.claude,
            EngineKind::Acp => &self.acp,
            EngineKind::Codex => &self.codex,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine used by `concord chat` and new sessions when none is given.
    pub default_engine: EngineKind,

    /// Auto-response policy for tool approval requests.
    pub permission_policy: PermissionPolicy,

    /// Merge a reasoning-only assistant entry with the text-only entry that
    /// immediately follows it.
    pub merge_reasoning_passes: bool,

    /// Default log filter (overridden by CONCORD_LOG).
    pub log_level: String,

    /// Engine launch settings.
    pub engines: EnginesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::Claude,
            permission_policy: PermissionPolicy::Ask,
            merge_reasoning_passes: true,
            log_level: Self::DEFAULT_LOG_LEVEL.to_string(),
            engines: EnginesConfig::default(),
        }
    }
}

impl Config {
    const DEFAULT_LOG_LEVEL: &str = "info";

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        let contents =
            toml::to_string_pretty(&Config::default()).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engines.codex.args, vec!["app-server"]);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_engine = "codex"
permission_policy = "allow-everything"

[engines.claude]
binary = "/opt/claude/bin/claude"
model = "opus"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.default_engine, EngineKind::Codex);
        assert_eq!(config.permission_policy, PermissionPolicy::AllowEverything);
        assert_eq!(config.engines.claude.binary, "/opt/claude/bin/claude");
        assert_eq!(config.engines.claude.model.as_deref(), Some("opus"));
        assert_eq!(config.engines.acp, EnginesConfig::default().acp);
        assert!(config.merge_reasoning_passes);
    }

    #[test]
    fn init_writes_loadable_defaults_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::init(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
        assert!(Config::init(&path).is_err());
    }
}
