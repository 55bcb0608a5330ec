//! Bridge configuration (TOML).

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global the proxy is published under when nothing else is configured.
pub const DEFAULT_GLOBAL_NAME: &str = "VisionCameraProxy";

/// Name of the worklet thread when nothing else is configured.
pub const DEFAULT_WORKLET_THREAD_NAME: &str = "vision-worklet";

/// Buffer wrappers kept per execution context.
pub const DEFAULT_BUFFER_CACHE_CAPACITY: usize = 64;

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Errors raised while loading or validating a [`BridgeConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Global identifier the proxy is installed under in every context
    pub global_name: String,
    pub worklet: WorkletConfig,
    pub buffer_cache: BufferCacheConfig,
    pub logging: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            global_name: DEFAULT_GLOBAL_NAME.to_string(),
            worklet: WorkletConfig::default(),
            buffer_cache: BufferCacheConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Worklet runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkletConfig {
    /// OS thread name of the worklet runtime
    pub thread_name: String,
}

impl Default for WorkletConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_WORKLET_THREAD_NAME.to_string(),
        }
    }
}

/// Buffer cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferCacheConfig {
    /// Maximum cached wrappers per execution context (LRU eviction)
    pub capacity_per_context: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            capacity_per_context: DEFAULT_BUFFER_CACHE_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(
            path = %path.display(),
            global = %config.global_name,
            "Loaded bridge config"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_lua_identifier(&self.global_name) {
            return Err(ConfigError::Invalid(format!(
                "global_name {:?} is not a valid Lua identifier",
                self.global_name
            )));
        }
        if self.worklet.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worklet.thread_name must not be empty".to_string(),
            ));
        }
        if self.buffer_cache.capacity_per_context == 0 {
            return Err(ConfigError::Invalid(
                "buffer_cache.capacity_per_context must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_lua_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !LUA_KEYWORDS.contains(&name)
}
