//! Replication source settings.
//!
//! All options have defaults, so an empty TOML document is a valid config:
//!
//! ```toml
//! chunk_size = 524288
//! chunk_timeout_ms = 900000
//! chunk_retry_attempts = 3
//! retry_delay_ms = 500
//! internal_action_retry_timeout_ms = 3600000
//! checkpoint_info_timeout_ms = 900000
//! max_concurrent_requests = 64
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SourceError};
use crate::transfer::protocol::MAX_CHUNK_CONTENT;

/// Default chunk size (512KB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_chunk_retry_attempts() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_internal_action_retry_timeout_ms() -> u64 {
    60 * 60 * 1000
}

fn default_checkpoint_info_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_concurrent_requests() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Bytes per file chunk request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Timeout for a single chunk round trip.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    /// Total attempts per chunk, the first send included.
    #[serde(default = "default_chunk_retry_attempts")]
    pub chunk_retry_attempts: usize,

    /// Pause between attempts of the same chunk.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Overall time budget for retrying one request.
    #[serde(default = "default_internal_action_retry_timeout_ms")]
    pub internal_action_retry_timeout_ms: u64,

    /// Deadline for preparing a checkpoint info response.
    #[serde(default = "default_checkpoint_info_timeout_ms")]
    pub checkpoint_info_timeout_ms: u64,

    /// Inbound requests handled at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            chunk_retry_attempts: default_chunk_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            internal_action_retry_timeout_ms: default_internal_action_retry_timeout_ms(),
            checkpoint_info_timeout_ms: default_checkpoint_info_timeout_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl ReplicationSettings {
    /// Small chunks and short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            chunk_size: 4,
            chunk_timeout_ms: 200,
            chunk_retry_attempts: 3,
            retry_delay_ms: 1,
            internal_action_retry_timeout_ms: 5_000,
            checkpoint_info_timeout_ms: 5_000,
            max_concurrent_requests: 8,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(s).map_err(|e| SourceError::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SourceError::Config("chunk_size must be positive".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_CONTENT {
            return Err(SourceError::Config(format!(
                "chunk_size {} exceeds the largest chunk a frame can carry ({MAX_CHUNK_CONTENT})",
                self.chunk_size
            )));
        }
        if self.chunk_retry_attempts == 0 {
            return Err(SourceError::Config(
                "chunk_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(SourceError::Config(
                "max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.chunk_timeout_ms == 0 {
            return Err(SourceError::Config("chunk_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn internal_action_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_action_retry_timeout_ms)
    }

    pub fn checkpoint_info_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_info_timeout_ms)
    }
}
