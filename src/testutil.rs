//! In-memory SSH server used by unit tests.
//!
//! `MockRemote` holds a tiny filesystem plus knobs that inject the failures
//! real servers produce: refused connections, rejected credentials, channels
//! that will not open, writes that stall.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::Connection;
use crate::config::types::{ConnectionParams, RetryPolicy};
use crate::error::{SshfsError, SFTP_FILE_ALREADY_EXISTS, SFTP_NO_SUCH_FILE};
use crate::session::{
    CommandChannel, Connector, ExecFailure, FileAttributes, OpenMode, RemoteFile, SftpSession,
    SshSession,
};

pub fn mock_params() -> ConnectionParams {
    ConnectionParams::new("mock.example.com", "tester")
        .with_password("secret")
        .with_retry(RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2,
        })
}

#[derive(Default)]
struct Fs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Fs {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some(("", _)) | None => true,
            Some((parent, _)) => self.dirs.contains(parent),
        }
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }
}

#[derive(Default)]
pub struct MockRemote {
    fs: Mutex<Fs>,

    /// Connect attempts that fail with a connectivity error before one succeeds.
    pub transient_failures: AtomicU32,
    pub reject_auth: AtomicBool,
    pub commands_supported: AtomicBool,
    pub channel_open_fails: AtomicBool,
    pub exec_fails: AtomicBool,
    pub keepalive_fails: AtomicBool,
    /// Writes accept zero bytes.
    pub stall_writes: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Non-zero overrides the exit status of `dd`.
    pub dd_exit_status: AtomicI32,
    /// Command-channel reads that report `WouldBlock` before returning data.
    pub would_block_reads: AtomicU32,
    /// Milliseconds each data read stays in flight.
    pub read_delay_ms: AtomicU64,

    pub connect_attempts: AtomicU32,
    pub probe_runs: AtomicU32,
    pub channel_opens: AtomicU32,
    pub command_reads: AtomicU32,
    pub sftp_reads: AtomicU32,
    pub sftp_read_calls: AtomicU32,
    pub sftp_sessions: AtomicU32,
    pub disconnects: AtomicU32,
    pub active_reads: AtomicU32,
    /// Highest number of data reads seen in flight at once.
    pub peak_active_reads: AtomicU32,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.commands_supported.store(true, Ordering::SeqCst);
        remote.fs.lock().unwrap().dirs.insert("/".to_string());
        Arc::new(remote)
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut fs = self.fs.lock().unwrap();
        fs.add_parents(path);
        fs.files.insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.fs.lock().unwrap().dirs.contains(path)
    }

    fn begin_read(&self) -> ActiveRead<'_> {
        let now = self.active_reads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_reads.fetch_max(now, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        ActiveRead { remote: self }
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            remote: Arc::clone(self),
        })
    }

    pub fn connection(self: &Arc<Self>, params: ConnectionParams) -> Connection {
        Connection::with_connector(params, self.connector())
    }
}

struct ActiveRead<'a> {
    remote: &'a MockRemote,
}

impl Drop for ActiveRead<'_> {
    fn drop(&mut self) {
        self.remote.active_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

fn sftp_error(operation: &'static str, path: &str, code: i32) -> SshfsError {
    SshfsError::RemoteOperation {
        operation,
        path: path.to_string(),
        reason: format!("SFTP status {}", code),
        code: Some(code),
    }
}

struct MockConnector {
    remote: Arc<MockRemote>,
}

impl Connector for MockConnector {
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn SshSession>, SshfsError> {
        let remote = &self.remote;
        remote.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let pending = remote.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            remote.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SshfsError::Connectivity {
                host: params.host.clone(),
                port: params.port,
                reason: "Connection refused".into(),
            });
        }
        if remote.reject_auth.load(Ordering::SeqCst) {
            return Err(SshfsError::Authentication {
                user: params.user.clone(),
                host: params.host.clone(),
                port: params.port,
                reason: "password rejected".into(),
            });
        }
        Ok(Box::new(MockSession {
            remote: Arc::clone(remote),
        }))
    }
}

struct MockSession {
    remote: Arc<MockRemote>,
}

/// Extract `if=`, `skip=` and `count=` from a `dd` command line.
fn parse_dd(command: &str) -> Option<(String, u64, usize)> {
    let rest = command.strip_prefix("dd if='")?;
    let end = rest.find("' bs=")?;
    let path = rest[..end].replace(r"'\''", "'");
    let field = |name: &str| -> Option<&str> {
        command
            .split_whitespace()
            .find_map(|part| part.strip_prefix(name))
    };
    let skip = field("skip=")?.parse().ok()?;
    let count = field("count=")?.parse().ok()?;
    Some((path, skip, count))
}

impl SshSession for MockSession {
    fn keepalive(&self) -> Result<(), SshfsError> {
        if self.remote.keepalive_fails.load(Ordering::SeqCst) {
            return Err(SshfsError::Io {
                source: io::Error::new(io::ErrorKind::BrokenPipe, "keepalive failed"),
            });
        }
        Ok(())
    }

    fn exec(&self, command: &str) -> Result<Box<dyn CommandChannel>, ExecFailure> {
        let remote = &self.remote;
        remote.channel_opens.fetch_add(1, Ordering::SeqCst);
        if remote.channel_open_fails.load(Ordering::SeqCst) {
            return Err(ExecFailure::ChannelOpen("administratively prohibited".into()));
        }
        if remote.exec_fails.load(Ordering::SeqCst) {
            return Err(ExecFailure::Exec("exec request denied".into()));
        }

        let supported = remote.commands_supported.load(Ordering::SeqCst);
        let (output, status) = if command == "pwd" {
            remote.probe_runs.fetch_add(1, Ordering::SeqCst);
            if supported {
                (b"/home/tester\n".to_vec(), 0)
            } else {
                (Vec::new(), 127)
            }
        } else if !supported {
            (Vec::new(), 127)
        } else if let Some((path, skip, count)) = parse_dd(command) {
            remote.command_reads.fetch_add(1, Ordering::SeqCst);
            let (data, mut status) = match remote.file(&path) {
                Some(content) => {
                    let start = (skip as usize).min(content.len());
                    let end = start.saturating_add(count).min(content.len());
                    (content[start..end].to_vec(), 0)
                }
                None => (Vec::new(), 1),
            };
            let forced = remote.dd_exit_status.load(Ordering::SeqCst);
            if forced != 0 {
                status = forced;
            }
            (data, status)
        } else if let Some(text) = command.strip_prefix("echo ") {
            (format!("{}\n", text).into_bytes(), 0)
        } else {
            (Vec::new(), 127)
        };

        Ok(Box::new(MockChannel {
            remote: Arc::clone(remote),
            output,
            pos: 0,
            status,
        }))
    }

    fn open_sftp(&self) -> Result<Box<dyn SftpSession>, SshfsError> {
        self.remote.sftp_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSftp {
            remote: Arc::clone(&self.remote),
        }))
    }

    fn disconnect(&self, _reason: &str) {
        self.remote.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockChannel {
    remote: Arc<MockRemote>,
    output: Vec<u8>,
    pos: usize,
    status: i32,
}

impl CommandChannel for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.remote.would_block_reads.load(Ordering::SeqCst);
        if pending > 0 {
            self.remote
                .would_block_reads
                .store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data yet"));
        }
        let _active = self.remote.begin_read();
        let remaining = &self.output[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn send_eof(&mut self) -> Result<(), SshfsError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<i32, SshfsError> {
        Ok(self.status)
    }
}

struct MockSftp {
    remote: Arc<MockRemote>,
}

impl SftpSession for MockSftp {
    fn stat(&self, path: &str) -> Result<FileAttributes, SshfsError> {
        let fs = self.remote.fs.lock().unwrap();
        if let Some(data) = fs.files.get(path) {
            return Ok(FileAttributes {
                size: Some(data.len() as u64),
                permissions: Some(0o100644),
                mtime: Some(1_700_000_000),
                ..Default::default()
            });
        }
        if fs.dirs.contains(path) {
            return Ok(FileAttributes {
                size: Some(4096),
                permissions: Some(0o040755),
                mtime: Some(1_700_000_000),
                ..Default::default()
            });
        }
        Err(sftp_error("stat", path, SFTP_NO_SUCH_FILE))
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn RemoteFile>, SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        let pos = match mode {
            OpenMode::Read => {
                self.remote.sftp_reads.fetch_add(1, Ordering::SeqCst);
                if !fs.files.contains_key(path) {
                    return Err(sftp_error("open", path, SFTP_NO_SUCH_FILE));
                }
                0
            }
            OpenMode::Truncate => {
                if !fs.parent_exists(path) {
                    return Err(sftp_error("open", path, SFTP_NO_SUCH_FILE));
                }
                fs.files.insert(path.to_string(), Vec::new());
                0
            }
            OpenMode::Append => match fs.files.get(path) {
                Some(data) => data.len(),
                None => return Err(sftp_error("open", path, SFTP_NO_SUCH_FILE)),
            },
            OpenMode::Write => {
                if !fs.files.contains_key(path) {
                    return Err(sftp_error("open", path, SFTP_NO_SUCH_FILE));
                }
                0
            }
        };
        Ok(Box::new(MockFile {
            remote: Arc::clone(&self.remote),
            path: path.to_string(),
            pos,
        }))
    }

    fn mkdir(&self, path: &str, _mode: i32) -> Result<(), SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        if fs.exists(path) {
            return Err(sftp_error("mkdir", path, SFTP_FILE_ALREADY_EXISTS));
        }
        if !fs.parent_exists(path) {
            return Err(sftp_error("mkdir", path, SFTP_NO_SUCH_FILE));
        }
        fs.dirs.insert(path.to_string());
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<(), SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        if !fs.dirs.remove(path) {
            return Err(sftp_error("rmdir", path, SFTP_NO_SUCH_FILE));
        }
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<(), SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        match fs.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(sftp_error("unlink", path, SFTP_NO_SUCH_FILE)),
        }
    }

    fn rename(&self, src: &str, dst: &str) -> Result<(), SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        if let Some(data) = fs.files.remove(src) {
            fs.files.insert(dst.to_string(), data);
            return Ok(());
        }
        if fs.dirs.remove(src) {
            fs.dirs.insert(dst.to_string());
            return Ok(());
        }
        Err(sftp_error("rename", src, SFTP_NO_SUCH_FILE))
    }
}

struct MockFile {
    remote: Arc<MockRemote>,
    path: String,
    pos: usize,
}

impl RemoteFile for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SshfsError> {
        self.remote.sftp_read_calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.remote.begin_read();
        let fs = self.remote.fs.lock().unwrap();
        let data = fs
            .files
            .get(&self.path)
            .ok_or_else(|| sftp_error("read", &self.path, SFTP_NO_SUCH_FILE))?;
        let start = self.pos.min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SshfsError> {
        if self.remote.stall_writes.load(Ordering::SeqCst) {
            return Ok(0);
        }
        if self.remote.fail_writes.load(Ordering::SeqCst) {
            return Err(SshfsError::remote("write", self.path.as_str(), "No space left on device"));
        }
        let mut fs = self.remote.fs.lock().unwrap();
        let data = fs
            .files
            .get_mut(&self.path)
            .ok_or_else(|| sftp_error("write", &self.path, SFTP_NO_SUCH_FILE))?;
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> Result<(), SshfsError> {
        self.pos = offset as usize;
        Ok(())
    }

    fn set_len(&mut self, size: u64) -> Result<(), SshfsError> {
        let mut fs = self.remote.fs.lock().unwrap();
        let data = fs
            .files
            .get_mut(&self.path)
            .ok_or_else(|| sftp_error("setstat", &self.path, SFTP_NO_SUCH_FILE))?;
        data.resize(size as usize, 0);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SshfsError> {
        Ok(())
    }
}
