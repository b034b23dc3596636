//! Remote-session capability surface.
//!
//! The client core never touches libssh2 directly. It talks to these traits,
//! which `session::ssh2` implements on top of the `ssh2` crate and the test
//! suite implements in memory.
//!
//! # Thread safety
//!
//! Every trait object here is `Send` but not `Sync`. A `Connection` keeps its
//! `SshSession` behind a mutex and hands out `SftpSession`s through its pool,
//! so no two threads ever call into the same libssh2 handle at once.

pub mod auth;
pub mod ssh2;

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

use crate::config::types::ConnectionParams;
use crate::error::SshfsError;

/// Opens authenticated sessions. Called once per connect attempt.
pub trait Connector: Send + Sync {
    /// Resolve, open TCP, handshake, verify the host key and authenticate.
    ///
    /// Errors must be classified (`Connectivity`, `Handshake`,
    /// `HostKeyRejected`, `Authentication`) so the retry loop can tell
    /// transient failures from terminal ones.
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn SshSession>, SshfsError>;
}

/// Why a remote command could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecFailure {
    #[error("failed to open command channel: {0}")]
    ChannelOpen(String),
    #[error("failed to execute command: {0}")]
    Exec(String),
}

/// One authenticated SSH session.
pub trait SshSession: Send {
    /// Send a protocol keepalive. Used as a liveness probe.
    fn keepalive(&self) -> Result<(), SshfsError>;

    /// Open a channel and start `command` on it.
    fn exec(&self, command: &str) -> Result<Box<dyn CommandChannel>, ExecFailure>;

    /// Start a new SFTP sub-session.
    fn open_sftp(&self) -> Result<Box<dyn SftpSession>, SshfsError>;

    /// Send SSH_MSG_DISCONNECT. Errors are ignored; the session is unusable
    /// afterwards either way.
    fn disconnect(&self, reason: &str);
}

/// Output side of a running remote command.
pub trait CommandChannel: Send {
    /// Read stdout. `ErrorKind::WouldBlock` means no data yet, try again.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_eof(&mut self) -> Result<(), SshfsError>;

    /// Wait for the remote side to finish, close the channel and return the
    /// command's exit status.
    fn finish(&mut self) -> Result<i32, SshfsError>;
}

/// How a remote file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write, create if missing, truncate to zero.
    Truncate,
    /// Write at the current end of file.
    Append,
    /// Write without creating or truncating.
    Write,
}

/// An SFTP sub-session. Paths are remote, slash-separated strings.
pub trait SftpSession: Send {
    fn stat(&self, path: &str) -> Result<FileAttributes, SshfsError>;
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn RemoteFile>, SshfsError>;
    /// Create a single directory level.
    fn mkdir(&self, path: &str, mode: i32) -> Result<(), SshfsError>;
    fn rmdir(&self, path: &str) -> Result<(), SshfsError>;
    fn unlink(&self, path: &str) -> Result<(), SshfsError>;
    /// Rename, replacing `dst` if it exists.
    fn rename(&self, src: &str, dst: &str) -> Result<(), SshfsError>;
}

/// An open remote file.
pub trait RemoteFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SshfsError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, SshfsError>;
    fn seek(&mut self, offset: u64) -> Result<(), SshfsError>;
    fn set_len(&mut self, size: u64) -> Result<(), SshfsError>;
    fn close(&mut self) -> Result<(), SshfsError>;
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Attributes of a remote file, as reported by the server.
///
/// Owned and immutable: callers get a copy, never a view into session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

impl FileAttributes {
    /// Size in bytes, or 0 when the server did not report one.
    pub fn len(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dir(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFDIR)
    }

    pub fn is_file(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFREG)
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.mtime.map(|t| UNIX_EPOCH + Duration::from_secs(t))
    }
}
