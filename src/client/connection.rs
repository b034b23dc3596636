//! One authenticated SSH connection plus its SFTP sub-session pool.
//!
//! # Locking
//!
//! Three locks, always taken in this order and never in reverse:
//!
//! 1. `read_lock`: serializes range reads across every handle sharing the
//!    connection, for servers with tight concurrent-channel limits.
//! 2. the pool's internal lock, held only while taking or returning a
//!    sub-session.
//! 3. `state`: the session lock. Connection-level operations hold it for
//!    every call into the remote session. A sub-session borrowed directly
//!    through `borrow_session` is used without it.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::pool::{Pooled, SessionPool};
use crate::config::types::{ConnectionKey, ConnectionParams};
use crate::error::{SshfsError, SFTP_FILE_ALREADY_EXISTS};
use crate::handle::upload::ChunkSink;
use crate::session::ssh2::Ssh2Connector;
use crate::session::{
    CommandChannel, Connector, FileAttributes, OpenMode, RemoteFile, SftpSession, SshSession,
};

/// Host name fragments of providers whose servers allow so few concurrent
/// channels that command-streamed reads do more harm than good.
const RESTRICTED_PROVIDERS: &[&str] = &["storagebox.de", "your-storagebox.de"];

/// Probe used to detect whether the server runs commands at all.
const PROBE_COMMAND: &str = "pwd";

/// Whether `host` belongs to a provider with restrictive channel limits.
pub fn is_restricted_provider(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    RESTRICTED_PROVIDERS.iter().any(|p| host.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Connected,
    Closed,
}

struct SessionState {
    session: Option<Box<dyn SshSession>>,
    lifecycle: Lifecycle,
}

pub struct Connection {
    params: ConnectionParams,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    pool: SessionPool<Box<dyn SftpSession>>,
    read_lock: Mutex<()>,
    supports_commands: AtomicBool,
    /// Only ever goes from false to true.
    fast_path_disabled: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.params.key().to_string())
            .field("connected", &self.is_connected())
            .field("supports_commands", &self.supports_commands())
            .field("fast_path_disabled", &self.fast_path_disabled())
            .finish()
    }
}

impl Connection {
    /// A disconnected connection that will use libssh2.
    pub fn new(params: ConnectionParams) -> Self {
        Self::with_connector(params, Arc::new(Ssh2Connector))
    }

    pub fn with_connector(params: ConnectionParams, connector: Arc<dyn Connector>) -> Self {
        let restricted = is_restricted_provider(&params.host);
        if restricted {
            tracing::info!(
                host = %params.host,
                "Host has strict channel limits; range reads will use SFTP only"
            );
        }
        let pool = SessionPool::new(params.pool_size, params.host.clone(), params.port);
        Self {
            params,
            connector,
            state: Mutex::new(SessionState {
                session: None,
                lifecycle: Lifecycle::Idle,
            }),
            pool,
            read_lock: Mutex::new(()),
            supports_commands: AtomicBool::new(false),
            fast_path_disabled: AtomicBool::new(restricted),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn key(&self) -> ConnectionKey {
        self.params.key()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SessionState>, SshfsError> {
        self.state.lock().map_err(|_| SshfsError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "SSH session mutex was poisoned; a previous operation panicked",
            ),
        })
    }

    fn not_connected(&self) -> SshfsError {
        SshfsError::NotConnected {
            host: self.params.host.clone(),
            port: self.params.port,
        }
    }

    /// Connect, authenticate and detect capabilities.
    ///
    /// A no-op when already connected. Fails with `ConnectionClosed` after
    /// `disconnect`: a torn-down connection is never revived.
    pub fn connect(&self) -> Result<(), SshfsError> {
        self.params.validate()?;
        let mut state = self.lock_state()?;
        match state.lifecycle {
            Lifecycle::Connected => return Ok(()),
            Lifecycle::Closed => {
                return Err(SshfsError::ConnectionClosed {
                    host: self.params.host.clone(),
                    port: self.params.port,
                })
            }
            Lifecycle::Idle => {}
        }

        let started = Instant::now();
        let session = retry_with_backoff(&self.params, std::thread::sleep, |attempt| {
            tracing::debug!(
                host = %self.params.host,
                port = self.params.port,
                attempt,
                "Connecting"
            );
            self.connector.connect(&self.params)
        })?;

        let supports = detect_capabilities(session.as_ref());
        self.supports_commands.store(supports, Ordering::SeqCst);
        state.session = Some(session);
        state.lifecycle = Lifecycle::Connected;

        tracing::info!(
            key = %self.params.key(),
            supports_commands = supports,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connected"
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state()
            .map(|state| state.lifecycle == Lifecycle::Connected)
            .unwrap_or(false)
    }

    /// Send a keepalive and report whether the session still answers.
    pub fn validate_connection(&self) -> bool {
        match self.with_session(|session| session.keepalive()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(key = %self.params.key(), error = %e, "Connection failed validation");
                false
            }
        }
    }

    /// Tear down the pool and the session. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let session = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.lifecycle = Lifecycle::Closed;
            state.session.take()
        };
        self.pool.close();
        if let Some(session) = session {
            session.disconnect("Normal shutdown");
            tracing::debug!(key = %self.params.key(), "Disconnected");
        }
    }

    pub fn supports_commands(&self) -> bool {
        self.supports_commands.load(Ordering::SeqCst)
    }

    pub fn fast_path_disabled(&self) -> bool {
        self.fast_path_disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn fast_path_available(&self) -> bool {
        self.supports_commands() && !self.fast_path_disabled()
    }

    /// Permanently route range reads through SFTP.
    pub(crate) fn disable_fast_path(&self, reason: &dyn std::fmt::Display) {
        if !self.fast_path_disabled.swap(true, Ordering::SeqCst) {
            tracing::info!(
                key = %self.params.key(),
                reason = %reason,
                "Command-streamed reads unavailable; using SFTP for the rest of this connection"
            );
        }
    }

    pub(crate) fn lock_reads(&self) -> MutexGuard<'_, ()> {
        self.read_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run `f` against the live session with the session lock held.
    pub(crate) fn with_session<R>(
        &self,
        f: impl FnOnce(&dyn SshSession) -> Result<R, SshfsError>,
    ) -> Result<R, SshfsError> {
        let state = self.lock_state()?;
        match state.session.as_deref() {
            Some(session) if state.lifecycle == Lifecycle::Connected => f(session),
            _ => Err(self.not_connected()),
        }
    }

    /// Borrow an SFTP sub-session, creating it on first use.
    ///
    /// Dropping the returned guard gives the sub-session back.
    pub fn borrow_session(&self) -> Result<Pooled<'_, Box<dyn SftpSession>>, SshfsError> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        self.pool
            .borrow_with(|| self.with_session(|session| session.open_sftp()))
    }

    /// Give a borrowed sub-session back. Equivalent to dropping the guard.
    pub fn return_session(&self, session: Pooled<'_, Box<dyn SftpSession>>) {
        drop(session);
    }

    /// Run `f` on a pooled sub-session with the session lock held.
    pub(crate) fn with_sftp<R>(
        &self,
        f: impl FnOnce(&dyn SftpSession) -> Result<R, SshfsError>,
    ) -> Result<R, SshfsError> {
        let sftp = self.borrow_session()?;
        let state = self.lock_state()?;
        if state.lifecycle != Lifecycle::Connected {
            return Err(self.not_connected());
        }
        f(&**sftp)
    }

    /// Run a shell command and return its stdout.
    ///
    /// A non-zero exit status is an error.
    pub fn execute_command(&self, command: &str) -> Result<String, SshfsError> {
        self.with_session(|session| {
            let mut channel = session
                .exec(command)
                .map_err(|e| SshfsError::remote("exec", command, e.to_string()))?;
            let mut output = Vec::new();
            drain(channel.as_mut(), &mut output)
                .map_err(|e| SshfsError::remote("exec", command, e.to_string()))?;
            let _ = channel.send_eof();
            let status = channel.finish()?;
            if status != 0 {
                return Err(SshfsError::CommandFailed {
                    command: command.to_string(),
                    status,
                });
            }
            Ok(String::from_utf8_lossy(&output).into_owned())
        })
    }

    /// Write one chunk: create/truncate when `append` is false, else append.
    ///
    /// Missing parent directories are created first for the truncating
    /// chunk; failures there are ignored and surface at open instead.
    pub fn upload_chunk(&self, path: &str, data: &[u8], append: bool) -> Result<(), SshfsError> {
        let started = Instant::now();
        self.with_sftp(|sftp| {
            if !append {
                if let Some(parent) = parent_dir(path) {
                    if let Err(e) = create_dir_all(sftp, parent) {
                        tracing::debug!(path = parent, error = %e, "Could not create parent directories");
                    }
                }
            }
            let mode = if append { OpenMode::Append } else { OpenMode::Truncate };
            let mut file = sftp.open(path, mode)?;
            let written = write_all(file.as_mut(), path, data);
            let closed = file.close();
            written?;
            closed
        })?;

        let elapsed = started.elapsed();
        tracing::debug!(
            path,
            bytes = data.len(),
            append,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = throughput_mib(data.len(), elapsed),
            "Uploaded chunk"
        );
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<(), SshfsError> {
        self.with_sftp(|sftp| sftp.unlink(path))
    }

    /// Rename, replacing `dst` if it exists.
    pub fn rename_file(&self, src: &str, dst: &str) -> Result<(), SshfsError> {
        self.with_sftp(|sftp| sftp.rename(src, dst))
    }

    pub fn get_file_stats(&self, path: &str) -> Result<FileAttributes, SshfsError> {
        let started = Instant::now();
        let attrs = self.with_sftp(|sftp| sftp.stat(path))?;
        tracing::trace!(path, elapsed_ms = started.elapsed().as_millis() as u64, "stat");
        Ok(attrs)
    }

    /// Create `path` and any missing ancestors.
    pub fn create_directory(&self, path: &str) -> Result<(), SshfsError> {
        self.with_sftp(|sftp| create_dir_all(sftp, path))
    }

    pub fn remove_directory(&self, path: &str) -> Result<(), SshfsError> {
        self.with_sftp(|sftp| sftp.rmdir(path))
    }

    pub fn truncate_file(&self, path: &str, size: u64) -> Result<(), SshfsError> {
        self.with_sftp(|sftp| {
            let mut file = sftp.open(path, OpenMode::Write)?;
            let resized = file.set_len(size);
            let closed = file.close();
            resized?;
            closed
        })
    }

    /// Whether anything exists at `path`. Every error reads as "no".
    pub fn file_exists(&self, path: &str) -> bool {
        self.get_file_stats(path).is_ok()
    }

    /// Whether `path` is a directory. Every error reads as "no".
    pub fn directory_exists(&self, path: &str) -> bool {
        self.get_file_stats(path)
            .map(|attrs| attrs.is_dir())
            .unwrap_or(false)
    }
}

impl ChunkSink for Connection {
    fn upload_chunk(&self, path: &str, data: &[u8], append: bool) -> Result<(), SshfsError> {
        Connection::upload_chunk(self, path, data, append)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

/// Call `attempt` until it succeeds, fails terminally, or retries run out.
///
/// Sleeps `policy.delays()` between attempts. Non-retryable errors are
/// returned as-is; exhausting retries wraps the last error.
pub(crate) fn retry_with_backoff<T>(
    params: &ConnectionParams,
    mut sleep: impl FnMut(Duration),
    mut attempt: impl FnMut(u32) -> Result<T, SshfsError>,
) -> Result<T, SshfsError> {
    let mut delays = params.retry.delays();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt(attempts) {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        host = %params.host,
                        attempt = attempts,
                        max_attempts = params.retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    sleep(delay);
                }
                None => {
                    return Err(SshfsError::RetriesExhausted {
                        host: params.host.clone(),
                        port: params.port,
                        attempts,
                        last: Box::new(e),
                    })
                }
            },
        }
    }
}

/// Run the probe command and report whether the server executes commands.
fn detect_capabilities(session: &dyn SshSession) -> bool {
    let mut channel = match session.exec(PROBE_COMMAND) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::debug!(error = %e, "Command probe failed; SFTP-only mode");
            return false;
        }
    };
    let mut sink = Vec::new();
    if let Err(e) = drain(channel.as_mut(), &mut sink) {
        tracing::debug!(error = %e, "Command probe output unreadable");
    }
    let _ = channel.send_eof();
    match channel.finish() {
        Ok(0) => true,
        Ok(status) => {
            tracing::debug!(status, "Command probe exited non-zero; SFTP-only mode");
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "Command probe did not complete; SFTP-only mode");
            false
        }
    }
}

/// Read a channel to EOF, retrying on `WouldBlock`.
fn drain(channel: &mut dyn CommandChannel, out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_all(file: &mut dyn RemoteFile, path: &str, mut data: &[u8]) -> Result<(), SshfsError> {
    while !data.is_empty() {
        let n = file.write(data)?;
        if n == 0 {
            return Err(SshfsError::remote(
                "write",
                path,
                format!("server accepted 0 bytes with {} remaining", data.len()),
            ));
        }
        data = &data[n..];
    }
    Ok(())
}

/// Parent directory of a remote path, if it has a non-root one.
pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

/// Every ancestor of `path` plus `path` itself, root excluded.
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`; `a//b` yields `a`, `a/b`.
pub(crate) fn path_prefixes(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut prefixes = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}

/// SFTP mkdir one level at a time, tolerating levels that already exist.
fn create_dir_all(sftp: &dyn SftpSession, path: &str) -> Result<(), SshfsError> {
    for prefix in path_prefixes(path) {
        match sftp.mkdir(&prefix, 0o755) {
            Ok(()) => {}
            Err(e) if e.sftp_code() == Some(SFTP_FILE_ALREADY_EXISTS) => {}
            Err(e) => {
                // Many servers report an existing directory as a generic
                // failure rather than FILE_ALREADY_EXISTS.
                if sftp.stat(&prefix).map(|a| a.is_dir()).unwrap_or(false) {
                    continue;
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

pub(crate) fn throughput_mib(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / (1024.0 * 1024.0) / secs
    } else {
        0.0
    }
}
