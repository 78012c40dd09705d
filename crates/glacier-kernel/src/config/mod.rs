//! Host configuration
//!
//! Layered configuration loading built on the `config` crate:
//!
//! - built-in defaults
//! - an optional file (format detected from its extension)
//! - `GLACIER_*` environment variables
//!
//! File contents go through `${VAR}` / `$VAR` substitution before parsing.

use crate::capability::DuplicatePolicy;
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Prefix of environment variables that override file values
pub const ENV_PREFIX: &str = "GLACIER";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced env regex"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("bare env regex"));

/// Detect configuration format from file extension
///
/// Supported: `.yaml`/`.yml`, `.toml`, `.json`.
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// `${VAR}` is replaced first, then bare `$VAR`. Unknown variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Load any deserializable configuration from a file
pub fn load_config<T>(path: &Path) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Parse configuration from a string with an explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Plugin host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginHostConfig {
    /// Directory watched for plugin binaries
    pub plugin_dir: PathBuf,
    /// Plugin binary extension, without the dot
    pub extension: String,
    /// Watch and enumerate subdirectories
    pub recursive: bool,
    /// Quiet period collapsing a burst of filesystem events
    pub debounce_ms: u64,
    /// File name patterns never treated as plugins (`*suffix`, `prefix*`, exact)
    pub ignore_patterns: Vec<String>,
    /// Prefix marking a chat message as a command
    pub command_prefix: String,
    /// Handling of two implementations bound to one contract
    pub duplicate_policy: DuplicatePolicy,
    /// Capacity of the plugin-set update channel
    pub update_channel_capacity: usize,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            extension: std::env::consts::DLL_EXTENSION.to_string(),
            recursive: true,
            debounce_ms: 500,
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
            command_prefix: "`".to_string(),
            duplicate_policy: DuplicatePolicy::FirstWins,
            update_channel_capacity: 16,
        }
    }
}

impl PluginHostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.plugin_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Glob-style plugin pattern, e.g. `*.so`
    pub fn pattern(&self) -> String {
        format!("*.{}", self.extension)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Load defaults, then `path` if given, then `GLACIER_*` process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`PluginHostConfig::load`] with an explicit environment map instead of the process one
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> ConfigResult<Self> {
        let mut builder = Cfg::builder();

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        let config: Self = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;

        config.validated()
    }

    /// Normalize and check field values
    pub fn validated(mut self) -> ConfigResult<Self> {
        self.extension = self.extension.trim_start_matches('.').to_string();
        if self.extension.is_empty() {
            return Err(ConfigError::Invalid("extension must not be empty".to_string()));
        }
        if !self.recursive {
            // Plugin folders are always enumerated recursively.
            tracing::warn!("recursive = false is not supported, watching recursively");
            self.recursive = true;
        }
        if self.update_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "update_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}
