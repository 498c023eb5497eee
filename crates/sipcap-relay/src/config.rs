// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! Loaded from TOML, or built from defaults plus command-line overrides.

use crate::capture::{DEFAULT_CAPTURE_GROUP, DEFAULT_COPY_RANGE};
use crate::classify::{Classifier, DEFAULT_EXCLUDED_METHODS};
use crate::queue::resp::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
use crate::queue::{RedisTransport, DEFAULT_QUEUE_KEY};
use crate::record::{RecordEncoder, RecordHeader, DEFAULT_BUFFER_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Queue service host.
    #[serde(default = "default_queue_host")]
    pub queue_host: String,

    /// Queue service port.
    #[serde(default = "default_queue_port")]
    pub queue_port: u16,

    /// List key records are pushed to.
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// NFLOG group to bind.
    #[serde(default = "default_capture_group")]
    pub capture_group: u16,

    /// Bytes of each packet copied from the kernel.
    #[serde(default = "default_copy_range")]
    pub copy_range: u32,

    /// CSeq methods that make a packet uninteresting.
    #[serde(default = "default_excluded_methods")]
    pub excluded_methods: Vec<String>,

    /// Maximum record size (header + payload).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Queue connect and command timeout (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Progress reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_queue_host() -> String {
    "127.0.0.1".to_string()
}

fn default_queue_port() -> u16 {
    DEFAULT_PORT
}

fn default_queue_key() -> String {
    DEFAULT_QUEUE_KEY.to_string()
}

fn default_capture_group() -> u16 {
    DEFAULT_CAPTURE_GROUP
}

fn default_copy_range() -> u32 {
    DEFAULT_COPY_RANGE
}

fn default_excluded_methods() -> Vec<String> {
    DEFAULT_EXCLUDED_METHODS.iter().map(|m| m.to_string()).collect()
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_stats_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_host: default_queue_host(),
            queue_port: default_queue_port(),
            queue_key: default_queue_key(),
            capture_group: default_capture_group(),
            copy_range: default_copy_range(),
            excluded_methods: default_excluded_methods(),
            buffer_capacity: default_buffer_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stats_interval_secs: default_stats_interval(),
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (not validated).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_host.is_empty() {
            return Err(ConfigError::Invalid("queue_host is empty".into()));
        }
        if self.queue_host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "queue_host {:?} contains whitespace",
                self.queue_host
            )));
        }
        if self.queue_port == 0 {
            return Err(ConfigError::Invalid("queue_port must be non-zero".into()));
        }
        if self.queue_key.is_empty() {
            return Err(ConfigError::Invalid("queue_key is empty".into()));
        }
        if self.buffer_capacity <= RecordHeader::SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity must exceed the {}-byte record header",
                RecordHeader::SIZE
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be non-zero".into()));
        }

        for method in &self.excluded_methods {
            if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
                return Err(ConfigError::Invalid(format!(
                    "excluded method {:?} must be non-empty and alphabetic",
                    method
                )));
            }
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Record encoder for the configured buffer capacity.
    pub fn encoder(&self) -> RecordEncoder {
        RecordEncoder::new(self.buffer_capacity)
    }

    /// Classifier for the configured excluded methods.
    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.excluded_methods.iter().cloned())
    }

    /// Queue transport for the configured endpoint.
    pub fn transport(&self) -> RedisTransport {
        RedisTransport::new(self.queue_host.clone(), self.queue_port)
            .with_timeout(self.connect_timeout())
    }
}
