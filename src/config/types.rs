use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::SshfsError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default upload chunk size (50 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024 * 1024;

/// Verbosity level controlling tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Suppress all output except errors
    Quiet,
    /// Normal output (info level)
    Normal,
    /// Verbose output (debug level)
    Verbose,
    /// Maximum output (trace level)
    Trace,
}

impl From<(bool, u8)> for Verbosity {
    /// Convert from (quiet_flag, verbose_count) to Verbosity.
    ///
    /// - quiet=true -> Quiet (regardless of verbose count)
    /// - verbose=0  -> Normal
    /// - verbose=1  -> Verbose
    /// - verbose=2+ -> Trace
    fn from((quiet, verbose_count): (bool, u8)) -> Self {
        if quiet {
            Verbosity::Quiet
        } else {
            match verbose_count {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

impl Verbosity {
    /// Return the tracing filter string for this verbosity level.
    ///
    /// Only this crate's targets are raised above `info` so that verbose runs
    /// are not flooded by dependency output.
    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "info,sshfs=debug",
            Verbosity::Trace => "info,sshfs=trace",
        }
    }
}

/// How the server's host key is checked against `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyCheck {
    /// Do not consult known_hosts at all.
    Off,
    /// Learn unknown hosts, refuse changed keys.
    #[default]
    AcceptNew,
    /// Refuse unknown hosts and changed keys.
    Strict,
}

/// Connection retry policy: attempt count and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `3` means up to four attempts total.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delays to wait before each retry, in order.
    ///
    /// Yields exactly `max_retries` items: `initial`, `initial * m`,
    /// `initial * m^2`, ... Saturates instead of overflowing.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let multiplier = self.multiplier.max(1);
        std::iter::successors(Some(self.initial_delay), move |d| {
            Some(d.saturating_mul(multiplier))
        })
        .take(self.max_retries as usize)
    }

    /// Maximum number of connection attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Credential set for one target.
///
/// Several fields may be filled in, but only one method is ever tried:
/// password, then key file, then explicit agent, then the legacy
/// `SSH_AUTH_SOCK` fallback. See `session::auth::plan_authentication`.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<Zeroizing<String>>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<Zeroizing<String>>,
    pub use_agent: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("use_agent", &self.use_agent)
            .finish()
    }
}

/// Immutable description of one remote target plus tuning knobs.
///
/// Built once before connecting and never mutated by a `Connection`.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    /// Session timeout applied to every blocking libssh2 call.
    pub timeout: Duration,
    /// TCP connect timeout per resolved address.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Keepalive interval in seconds; 0 disables keepalives.
    pub keepalive_interval: u32,
    pub chunk_size: usize,
    pub max_concurrent_uploads: usize,
    /// Number of SFTP sub-sessions per connection.
    pub pool_size: usize,
    /// Restrict key exchange and host key algorithms to non-NIST curves.
    pub strict_crypto: bool,
    pub host_key_check: HostKeyCheck,
}

impl ConnectionParams {
    /// Parameters for `user@host:22` with default tuning and no credentials.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            credentials: Credentials::default(),
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            keepalive_interval: 60,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_uploads: 2,
            pool_size: 1,
            strict_crypto: false,
            host_key_check: HostKeyCheck::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = if port == 0 { DEFAULT_SSH_PORT } else { port };
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credentials.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.credentials.key_path = Some(key_path.into());
        self.credentials.key_passphrase = passphrase.map(Zeroizing::new);
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.credentials.use_agent = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent_uploads(mut self, max: usize) -> Self {
        self.max_concurrent_uploads = max;
        self
    }

    pub fn with_strict_crypto(mut self, strict: bool) -> Self {
        self.strict_crypto = strict;
        self
    }

    pub fn with_host_key_check(mut self, check: HostKeyCheck) -> Self {
        self.host_key_check = check;
        self
    }

    /// Reject parameter sets that cannot possibly work.
    pub fn validate(&self) -> Result<(), SshfsError> {
        if self.host.trim().is_empty() {
            return Err(SshfsError::Config("host must not be empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(SshfsError::Config(format!(
                "username is required for {}",
                self.host
            )));
        }
        if self.chunk_size == 0 {
            return Err(SshfsError::Config("chunk_size must be greater than 0".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(SshfsError::Config(
                "max_concurrent_uploads must be at least 1".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(SshfsError::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Registry key identifying the remote account.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Identity of a remote account: `user@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_flags() {
        assert_eq!(Verbosity::from((true, 3)), Verbosity::Quiet);
        assert_eq!(Verbosity::from((false, 0)), Verbosity::Normal);
        assert_eq!(Verbosity::from((false, 1)), Verbosity::Verbose);
        assert_eq!(Verbosity::from((false, 5)), Verbosity::Trace);
        assert_eq!(Verbosity::Quiet.as_tracing_filter(), "error");
    }

    #[test]
    fn backoff_doubles_from_initial_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
        };
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn zero_retries_yields_no_delays() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delays().count(), 0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn defaults_match_documented_values() {
        let params = ConnectionParams::new("example.com", "alice");
        assert_eq!(params.port, 22);
        assert_eq!(params.timeout, Duration::from_secs(300));
        assert_eq!(params.retry, RetryPolicy::default());
        assert_eq!(params.keepalive_interval, 60);
        assert_eq!(params.chunk_size, 50 * 1024 * 1024);
        assert_eq!(params.max_concurrent_uploads, 2);
        assert_eq!(params.pool_size, 1);
        assert!(!params.strict_crypto);
        assert_eq!(params.host_key_check, HostKeyCheck::AcceptNew);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_user_and_zero_chunk() {
        let err = ConnectionParams::new("example.com", "").validate().unwrap_err();
        assert!(format!("{}", err).contains("username is required"));

        let err = ConnectionParams::new("example.com", "bob")
            .with_chunk_size(0)
            .validate()
            .unwrap_err();
        assert!(format!("{}", err).contains("chunk_size"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let params = ConnectionParams::new("example.com", "alice")
            .with_password("hunter2")
            .with_key("/home/alice/.ssh/id_ed25519", Some("sekrit".into()));
        let dbg = format!("{:?}", params);
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("sekrit"));
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("id_ed25519"));
    }

    #[test]
    fn key_formats_as_user_at_host_port() {
        let params = ConnectionParams::new("files.example.com", "deploy").with_port(2222);
        assert_eq!(params.key().to_string(), "deploy@files.example.com:2222");
        assert_eq!(ConnectionParams::new("h", "u").with_port(0).port, 22);
    }
}
