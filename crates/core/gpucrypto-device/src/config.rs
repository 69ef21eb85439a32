//! Device context configuration
//!
//! Pool sizing limits that the reference engine fixed at compile time are
//! plain configuration here, validated once when a context is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MAX_BLOCKS, MAX_STREAM};

/// Upper bound accepted for `max_stream`.
pub const STREAM_LIMIT: usize = 256;
/// Upper bound accepted for `max_blocks`.
pub const BLOCK_LIMIT: usize = 1 << 20;

/// 配置错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// 无效的配置
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// 解析错误
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// 序列化错误
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),
}

/// How a blocking `sync` waits for completion.
///
/// The wait spins, then yields, then sleeps `poll_interval_us` between
/// checks. It never calls into the runtime's stream synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Sleep between polls once spinning and yielding are exhausted; 0 keeps yielding.
    pub poll_interval_us: u64,
    /// Give up after this long. `None` polls until the device completes.
    pub timeout_ms: Option<u64>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            poll_interval_us: 50,
            timeout_ms: None,
        }
    }
}

impl SyncPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Device context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceContextConfig {
    /// Largest stream count `init` accepts.
    pub max_stream: usize,
    /// Checkbit capacity of every stream, i.e. the most blocks one launch may use.
    pub max_blocks: usize,
    /// Pinned staging pool per stream; defaults to the device pool size.
    pub pinned_memory_size_per_stream: Option<usize>,
    pub sync: SyncPolicy,
}

impl Default for DeviceContextConfig {
    fn default() -> Self {
        Self {
            max_stream: MAX_STREAM,
            max_blocks: MAX_BLOCKS,
            pinned_memory_size_per_stream: None,
            sync: SyncPolicy::default(),
        }
    }
}

impl DeviceContextConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stream == 0 || self.max_stream > STREAM_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_stream must be in 1..={}, got {}",
                STREAM_LIMIT, self.max_stream
            )));
        }
        if self.max_blocks == 0 || self.max_blocks > BLOCK_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_blocks must be in 1..={}, got {}",
                BLOCK_LIMIT, self.max_blocks
            )));
        }
        if self.pinned_memory_size_per_stream == Some(0) {
            return Err(ConfigError::Invalid(
                "pinned_memory_size_per_stream must be non-zero".to_string(),
            ));
        }
        if self.sync.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sync.timeout_ms must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 字符串加载配置
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    /// 将配置序列化为 TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// Pinned pool size for a device pool of `memory_size` bytes.
    pub fn pinned_size_for(&self, memory_size: usize) -> usize {
        self.pinned_memory_size_per_stream.unwrap_or(memory_size)
    }
}
