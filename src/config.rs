//! Ingestion configuration

use crate::error::{IngestError, Result};
use crate::session::context::DEFAULT_QUEUE_CAPACITY;
use crate::session::pack::DEFAULT_PACK_LIMIT;
use crate::session::remote::SessionCredentials;
use crate::upload::definition::SpoolerDefinition;
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default size of the chunks a file is cut into (8 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default size of the blocks a chunk is read in (256 KiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024;

/// Log level of the ingest tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Configuration of an ingestion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Log level (default: info)
    #[serde(rename = "log-level")]
    pub log_level: LogLevel,

    /// Spooler definition selecting the uploader backend (default: mem)
    #[serde(rename = "spooler", skip_serializing_if = "Option::is_none")]
    pub spooler: Option<String>,

    /// Size of the chunks files are cut into (default: 8 MiB)
    #[serde(rename = "chunk-size")]
    pub chunk_size: u64,

    /// Size of the blocks chunks are read in (default: 256 KiB)
    #[serde(rename = "block-size")]
    pub block_size: u64,

    /// Number of hash stage workers (default: 1)
    #[serde(rename = "hash-workers")]
    pub hash_workers: usize,

    /// Number of upload dispatch workers (default: 1)
    #[serde(rename = "write-workers")]
    pub write_workers: usize,

    /// Capacity of every bounded queue (default: 1000)
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,

    /// Upper bound on the payload of one session pack (default: 200 MiB)
    #[serde(rename = "max-pack-size")]
    pub max_pack_size: u64,

    /// Gateway session token
    #[serde(rename = "session-token", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// Gateway key id
    #[serde(rename = "key-id", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// Gateway key secret
    #[serde(rename = "secret", skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            spooler: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            hash_workers: 1,
            write_workers: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_pack_size: DEFAULT_PACK_LIMIT,
            session_token: None,
            key_id: None,
            secret: None,
        }
    }
}

impl IngestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set the spooler definition
    pub fn spooler(mut self, definition: impl Into<String>) -> Self {
        self.spooler = Some(definition.into());
        self
    }

    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Set the number of hash and upload dispatch workers
    pub fn workers(mut self, hash_workers: usize, write_workers: usize) -> Self {
        self.hash_workers = hash_workers;
        self.write_workers = write_workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn max_pack_size(mut self, size: u64) -> Self {
        self.max_pack_size = size;
        self
    }

    /// Set the gateway session credentials
    pub fn session(
        mut self,
        session_token: impl Into<String>,
        key_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.session_token = Some(session_token.into());
        self.key_id = Some(key_id.into());
        self.secret = Some(secret.into());
        self
    }

    /// The parsed spooler definition; `mem` when none is configured
    pub fn spooler_definition(&self) -> Result<SpoolerDefinition> {
        match &self.spooler {
            Some(definition) => definition.parse(),
            None => Ok(SpoolerDefinition::memory()),
        }
    }

    /// Session credentials for the gateway at `api_url`
    pub fn credentials(&self, api_url: &str) -> Result<SessionCredentials> {
        let session_token = self
            .session_token
            .clone()
            .ok_or_else(|| IngestError::config_error("session-token is required for gw"))?;
        let key_id = self
            .key_id
            .clone()
            .ok_or_else(|| IngestError::config_error("key-id is required for gw"))?;
        let credentials = SessionCredentials::new(
            api_url,
            session_token,
            key_id,
            self.secret.clone().unwrap_or_default(),
        );
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IngestError::invalid_parameter(
                "chunk-size",
                "Chunk size must be greater than 0",
            ));
        }
        if self.block_size == 0 || self.block_size > self.chunk_size {
            return Err(IngestError::invalid_parameter(
                "block-size",
                format!(
                    "Block size must be between 1 byte and the chunk size ({})",
                    ByteSize(self.chunk_size)
                ),
            ));
        }
        if self.hash_workers == 0 || self.write_workers == 0 {
            return Err(IngestError::invalid_parameter(
                "workers",
                "At least one worker per stage is required",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::invalid_parameter(
                "queue-capacity",
                "Queue capacity must be greater than 0",
            ));
        }
        if self.max_pack_size == 0 {
            return Err(IngestError::invalid_parameter(
                "max-pack-size",
                "Maximum pack size must be greater than 0",
            ));
        }
        self.spooler_definition()?;
        Ok(())
    }

    /// Convert the configuration to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(IngestError::from)
    }

    /// JSON for display, with the session token and secret masked
    pub fn to_redacted_json(&self) -> Result<String> {
        let mut shown = self.clone();
        for value in [&mut shown.session_token, &mut shown.secret]
            .into_iter()
            .flatten()
        {
            *value = "<redacted>".to_string();
        }
        shown.to_json()
    }

    /// Create a configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(IngestError::from)
    }

    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
