use std::sync::Arc;

use thiserror::Error;

/// SFTP status code for "no such file".
pub const SFTP_NO_SUCH_FILE: i32 = 2;

/// SFTP status code for "permission denied".
pub const SFTP_PERMISSION_DENIED: i32 = 3;

/// SFTP status code for "file already exists" (not all servers send it).
pub const SFTP_FILE_ALREADY_EXISTS: i32 = 11;

#[derive(Error, Debug)]
pub enum SshfsError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    Connectivity {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SSH handshake failed for {host}:{port}: {reason}")]
    Handshake {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SSH authentication failed for {user}@{host}:{port}: {reason}")]
    Authentication {
        user: String,
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Host key for {host}:{port} rejected: {reason}")]
    HostKeyRejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to {host}:{port} after {attempts} attempts. Last error: {last}")]
    RetriesExhausted {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        last: Box<SshfsError>,
    },

    #[error("Remote {operation} failed for {path}: {reason}")]
    RemoteOperation {
        operation: &'static str,
        path: String,
        reason: String,
        /// SFTP status code reported by the server, when there was one.
        code: Option<i32>,
    },

    #[error("Remote command `{command}` exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("Upload of chunk #{chunk} to {path} failed: {source}")]
    Upload {
        path: String,
        chunk: u64,
        source: Arc<SshfsError>,
    },

    #[error("Not connected to {host}:{port}")]
    NotConnected { host: String, port: u16 },

    #[error("Connection to {host}:{port} was closed and cannot be reused")]
    ConnectionClosed { host: String, port: u16 },

    #[error("File handle for {path} is closed")]
    HandleClosed { path: String },

    #[error("File {path} was not opened for writing")]
    NotWritable { path: String },

    #[error("File {path} was opened for writing and cannot be read")]
    NotReadable { path: String },

    #[error("Cannot seek {path} to offset {offset}: writes are sequential (current position {position})")]
    SeekUnsupported {
        path: String,
        offset: u64,
        position: u64,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SshfsError {
    /// Whether `Connection::connect` should try again after this error.
    ///
    /// Only transport-level failures are retried. Authentication failures are
    /// terminal because repeating them cannot succeed and may lock accounts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshfsError::Connectivity { .. } | SshfsError::Handshake { .. }
        )
    }

    /// Build a `RemoteOperation` error without an SFTP status code.
    pub fn remote(operation: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        SshfsError::RemoteOperation {
            operation,
            path: path.into(),
            reason: reason.into(),
            code: None,
        }
    }

    /// SFTP status code carried by a `RemoteOperation` error, if any.
    pub fn sftp_code(&self) -> Option<i32> {
        match self {
            SshfsError::RemoteOperation { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns a user-friendly suggestion for how to fix the error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            SshfsError::Connectivity { .. } => {
                Some("Check that the host is reachable, DNS resolves, and the SSH port is open.")
            }
            SshfsError::Handshake { .. } => Some(
                "The server and client may not share a key exchange algorithm. \
                 Try without --strict-crypto or check the server's sshd_config.",
            ),
            SshfsError::Authentication { .. } => Some(
                "Check the username and credentials. Key files need mode 600 and a \
                 matching entry in the server's authorized_keys.",
            ),
            SshfsError::HostKeyRejected { .. } => Some(
                "Compare the fingerprint with the server's key. If it legitimately changed, \
                 remove the old entry from ~/.ssh/known_hosts and reconnect.",
            ),
            SshfsError::RetriesExhausted { last, .. } => last
                .suggestion()
                .or(Some("Increase --retries or check server availability.")),
            SshfsError::RemoteOperation { code, .. } => match *code {
                Some(SFTP_NO_SUCH_FILE) => Some("Check that the remote path exists."),
                Some(SFTP_PERMISSION_DENIED) => {
                    Some("Check remote file permissions for the connecting user.")
                }
                _ => Some("Check the remote path and your permissions on the server."),
            },
            SshfsError::CommandFailed { .. } => {
                Some("The server may run a restricted shell that does not allow this command.")
            }
            SshfsError::Upload { source, .. } => source.suggestion(),
            SshfsError::NotConnected { .. } | SshfsError::ConnectionClosed { .. } => {
                Some("Open a new connection; a disconnected connection is not reconnected automatically.")
            }
            SshfsError::Config(_) => Some("Check command-line flags and config.toml values."),
            _ => None,
        }
    }
}

impl From<SshfsError> for std::io::Error {
    fn from(err: SshfsError) -> Self {
        match err {
            SshfsError::Io { source } => source,
            other => {
                let kind = match other.sftp_code() {
                    Some(SFTP_NO_SUCH_FILE) => std::io::ErrorKind::NotFound,
                    Some(SFTP_PERMISSION_DENIED) => std::io::ErrorKind::PermissionDenied,
                    _ => match other {
                        SshfsError::NotConnected { .. }
                        | SshfsError::ConnectionClosed { .. } => std::io::ErrorKind::NotConnected,
                        SshfsError::NotWritable { .. }
                        | SshfsError::NotReadable { .. }
                        | SshfsError::SeekUnsupported { .. } => std::io::ErrorKind::Unsupported,
                        _ => std::io::ErrorKind::Other,
                    },
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}

impl From<toml::de::Error> for SshfsError {
    fn from(err: toml::de::Error) -> Self {
        SshfsError::Config(format!("Invalid config.toml: {}", err))
    }
}

impl From<serde_json::Error> for SshfsError {
    fn from(err: serde_json::Error) -> Self {
        SshfsError::Config(err.to_string())
    }
}
