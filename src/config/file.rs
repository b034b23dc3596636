//! Optional `config.toml` tuning file.
//!
//! Only tuning knobs live here. Hosts, users and secrets always come from the
//! command line or the caller, never from disk.
//!
//! ```toml
//! [connection]
//! timeout_seconds = 120
//! max_retries = 5
//! chunk_size = "16 MiB"
//! host_key_check = "strict"
//! ```

use std::path::Path;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::config::types::{ConnectionParams, HostKeyCheck};
use crate::error::SshfsError;

/// Serialized tuning file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningFile {
    #[serde(default)]
    pub connection: ConnectionSection,
}

/// `[connection]` table. Every key is optional; missing keys keep defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    pub timeout_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub keepalive_interval: Option<u32>,
    /// Human-readable size such as `"50 MiB"` or a plain byte count.
    pub chunk_size: Option<String>,
    pub max_concurrent_uploads: Option<usize>,
    pub strict_crypto: Option<bool>,
    pub host_key_check: Option<HostKeyCheck>,
}

impl TuningFile {
    /// Load a tuning file, returning defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, SshfsError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No tuning file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, SshfsError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply every configured knob over `params`.
    pub fn apply(&self, mut params: ConnectionParams) -> Result<ConnectionParams, SshfsError> {
        let c = &self.connection;
        if let Some(secs) = c.timeout_seconds {
            params.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = c.connect_timeout_seconds {
            params.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = c.max_retries {
            params.retry.max_retries = retries;
        }
        if let Some(ms) = c.initial_retry_delay_ms {
            params.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(interval) = c.keepalive_interval {
            params.keepalive_interval = interval;
        }
        if let Some(size) = &c.chunk_size {
            params.chunk_size = parse_size(size)?;
        }
        if let Some(max) = c.max_concurrent_uploads {
            params.max_concurrent_uploads = max;
        }
        if let Some(strict) = c.strict_crypto {
            params.strict_crypto = strict;
        }
        if let Some(check) = c.host_key_check {
            params.host_key_check = check;
        }
        Ok(params)
    }
}

/// Parse a size like `"64MiB"`, `"1 GB"` or `"4096"` into bytes.
pub fn parse_size(input: &str) -> Result<usize, SshfsError> {
    let size: ByteSize = input
        .trim()
        .parse()
        .map_err(|e| SshfsError::Config(format!("Invalid size '{}': {}", input, e)))?;
    usize::try_from(size.as_u64())
        .map_err(|_| SshfsError::Config(format!("Size '{}' is too large", input)))
}
