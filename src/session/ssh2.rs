//! libssh2-backed sessions using the `ssh2` crate.
//!
//! `Ssh2Connector` performs TCP connect, algorithm negotiation, host key
//! verification and authentication. The resulting handles implement the
//! traits in `session`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;

use ::ssh2::{
    CheckResult, ErrorCode, HashType, KnownHostFileKind, MethodType, OpenFlags, OpenType,
    RenameFlags, Session,
};
use base64::Engine;

use crate::config::paths::known_hosts_file;
use crate::config::types::{ConnectionParams, HostKeyCheck};
use crate::error::SshfsError;
use crate::session::auth::{self, AuthSession};
use crate::session::{
    CommandChannel, Connector, ExecFailure, FileAttributes, OpenMode, RemoteFile, SftpSession,
    SshSession,
};

/// Key exchange algorithms, most preferred first.
const KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group18-sha512",
    "diffie-hellman-group14-sha1",
];

/// Host key algorithms, most preferred first.
const HOST_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "ssh-rsa",
];

/// Build a comma-separated preference list, dropping NIST curves when strict.
pub(crate) fn preference_list(algorithms: &[&str], strict: bool) -> String {
    algorithms
        .iter()
        .filter(|a| !strict || !a.contains("nistp"))
        .copied()
        .collect::<Vec<_>>()
        .join(",")
}

/// Opens real SSH sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Connector for Ssh2Connector {
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn SshSession>, SshfsError> {
        let connectivity = |reason: String| SshfsError::Connectivity {
            host: params.host.clone(),
            port: params.port,
            reason,
        };
        let handshake = |reason: String| SshfsError::Handshake {
            host: params.host.clone(),
            port: params.port,
            reason,
        };

        let tcp = open_tcp(params).map_err(connectivity)?;

        let mut session =
            Session::new().map_err(|e| connectivity(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(params.timeout.as_millis()).unwrap_or(u32::MAX));

        session
            .method_pref(
                MethodType::Kex,
                &preference_list(KEX_ALGORITHMS, params.strict_crypto),
            )
            .map_err(|e| handshake(format!("Failed to set key exchange preferences: {}", e)))?;
        session
            .method_pref(
                MethodType::HostKey,
                &preference_list(HOST_KEY_ALGORITHMS, params.strict_crypto),
            )
            .map_err(|e| handshake(format!("Failed to set host key preferences: {}", e)))?;

        session.handshake().map_err(|e| handshake(e.to_string()))?;

        verify_host_key(&session, params)?;

        if params.keepalive_interval > 0 {
            session.set_keepalive(false, params.keepalive_interval);
        }

        auth::authenticate(
            &session,
            &params.user,
            &params.credentials,
            auth::agent_socket_present(),
        )
        .map_err(|reason| SshfsError::Authentication {
            user: params.user.clone(),
            host: params.host.clone(),
            port: params.port,
            reason,
        })?;

        Ok(Box::new(Ssh2Session {
            session,
            host: params.host.clone(),
            port: params.port,
        }))
    }
}

/// Resolve the target and connect to the first address that answers.
fn open_tcp(params: &ConnectionParams) -> Result<TcpStream, String> {
    let addrs: Vec<SocketAddr> = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| format!("Failed to resolve '{}': {}", params.host, e))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("'{}' resolved to no addresses", params.host));
    }

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, params.connect_timeout) {
            Ok(stream) => {
                tracing::trace!(%addr, "TCP connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "TCP connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => format!("TCP connection failed: {}", e),
        None => "TCP connection failed".to_string(),
    })
}

impl AuthSession for Session {
    fn auth_password(&self, user: &str, password: &str) -> Result<(), String> {
        self.userauth_password(user, password)
            .map_err(|e| e.message().to_string())?;
        authenticated_or(self, "password was not accepted")
    }

    fn auth_key_file(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), String> {
        self.userauth_pubkey_file(user, public_key, private_key, passphrase)
            .map_err(|e| format!("key {}: {}", private_key.display(), e.message()))?;
        authenticated_or(self, "key was not accepted")
    }

    fn auth_agent(&self, user: &str) -> Result<(), String> {
        let mut agent = self
            .agent()
            .map_err(|e| format!("failed to initialise agent: {}", e.message()))?;
        agent
            .connect()
            .map_err(|e| format!("failed to connect to agent: {}", e.message()))?;
        agent
            .list_identities()
            .map_err(|e| format!("failed to list agent identities: {}", e.message()))?;
        let identities = agent
            .identities()
            .map_err(|e| format!("failed to read agent identities: {}", e.message()))?;

        for identity in &identities {
            if agent.userauth(user, identity).is_ok() && self.authenticated() {
                tracing::debug!(comment = identity.comment(), "Agent identity accepted");
                let _ = agent.disconnect();
                return Ok(());
            }
        }
        let _ = agent.disconnect();
        Err(format!(
            "none of the {} agent identities were accepted",
            identities.len()
        ))
    }
}

fn authenticated_or(session: &Session, reason: &str) -> Result<(), String> {
    if session.authenticated() {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

/// Check the server's host key against `~/.ssh/known_hosts`.
///
/// - `Match`    proceed.
/// - `Mismatch` always refused: the stored key differs from the one offered.
/// - `NotFound` learned under `AcceptNew`, refused under `Strict`.
/// - `Failure`  the check itself could not run; refused under `Strict`,
///              logged and allowed otherwise.
///
/// Never prompts: the client runs inside non-interactive callers.
fn verify_host_key(session: &Session, params: &ConnectionParams) -> Result<(), SshfsError> {
    if params.host_key_check == HostKeyCheck::Off {
        return Ok(());
    }
    let host = params.host.as_str();
    let port = params.port;
    let rejected = |reason: String| SshfsError::HostKeyRejected {
        host: host.to_string(),
        port,
        reason,
    };

    let (key_bytes, key_type) = session
        .host_key()
        .ok_or_else(|| rejected("server did not provide a host key".to_string()))?;
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| rejected(format!("failed to initialise known-hosts store: {}", e)))?;
    let known_hosts_path = known_hosts_file()
        .ok_or_else(|| rejected("cannot determine home directory".to_string()))?;

    let file_loaded = known_hosts
        .read_file(&known_hosts_path, KnownHostFileKind::OpenSSH)
        .is_ok();

    match known_hosts.check_port(host, port, key_bytes) {
        CheckResult::Match => {
            tracing::debug!(host, port, "Host key verified");
            Ok(())
        }
        CheckResult::Mismatch => Err(rejected(format!(
            "the key offered ({}) does not match the one stored in {}",
            fingerprint(session),
            known_hosts_path.display()
        ))),
        CheckResult::NotFound if params.host_key_check == HostKeyCheck::Strict => Err(rejected(
            format!(
                "host is not in {} and strict checking is on (fingerprint {})",
                known_hosts_path.display(),
                fingerprint(session)
            ),
        )),
        CheckResult::NotFound => {
            let entry_name = known_hosts_entry(host, port);
            if let Err(e) = known_hosts.add(&entry_name, key_bytes, host, key_type.into()) {
                tracing::warn!(host, error = %e, "Could not add host key to known-hosts store");
                return Ok(());
            }
            if let Some(parent) = known_hosts_path.parent() {
                if !parent.exists() {
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::DirBuilderExt;
                        std::fs::DirBuilder::new()
                            .recursive(true)
                            .mode(0o700)
                            .create(parent)
                            .ok();
                    }
                    #[cfg(not(unix))]
                    {
                        std::fs::create_dir_all(parent).ok();
                    }
                }
            }
            match known_hosts.write_file(&known_hosts_path, KnownHostFileKind::OpenSSH) {
                Ok(()) => tracing::info!(
                    host = %entry_name,
                    fingerprint = %fingerprint(session),
                    "Permanently added host to the list of known hosts"
                ),
                Err(e) => tracing::warn!(
                    path = %known_hosts_path.display(),
                    error = %e,
                    "Could not save host key"
                ),
            }
            Ok(())
        }
        CheckResult::Failure if params.host_key_check == HostKeyCheck::Strict => Err(rejected(
            format!("could not check {}", known_hosts_path.display()),
        )),
        CheckResult::Failure => {
            tracing::warn!(
                host,
                file_loaded,
                path = %known_hosts_path.display(),
                "Host key check could not complete; proceeding without verification"
            );
            Ok(())
        }
    }
}

/// Host name as OpenSSH writes it: bare for port 22, `[host]:port` otherwise.
pub(crate) fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// OpenSSH-style `SHA256:...` fingerprint of the server's host key.
fn fingerprint(session: &Session) -> String {
    if let Some(hash) = session.host_key_hash(HashType::Sha256) {
        format_sha256_fingerprint(hash)
    } else if let Some(hash) = session.host_key_hash(HashType::Md5) {
        let hex: Vec<String> = hash.iter().map(|b| format!("{:02x}", b)).collect();
        format!("MD5:{}", hex.join(":"))
    } else {
        "(fingerprint unavailable)".to_string()
    }
}

pub(crate) fn format_sha256_fingerprint(hash: &[u8]) -> String {
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

/// SFTP status code of an ssh2 error, if it came from the SFTP layer.
fn sftp_status(err: &::ssh2::Error) -> Option<i32> {
    match err.code() {
        ErrorCode::SFTP(code) => Some(code),
        _ => None,
    }
}

fn remote_err(operation: &'static str, path: &str, err: ::ssh2::Error) -> SshfsError {
    SshfsError::RemoteOperation {
        operation,
        path: path.to_string(),
        reason: err.message().to_string(),
        code: sftp_status(&err),
    }
}

fn remote_io_err(operation: &'static str, path: &str, err: std::io::Error) -> SshfsError {
    SshfsError::remote(operation, path, err.to_string())
}

struct Ssh2Session {
    session: Session,
    host: String,
    port: u16,
}

// SAFETY: the `ssh2` crate keeps the raw libssh2 session behind its own
// internal mutex, and `Channel`, `Sftp` and `File` each hold a handle to that
// shared session and lock it for every libssh2 call they make, including the
// frees in their `Drop` impls. Moving one of these wrappers to another thread
// therefore never lets two threads inside libssh2 on the same session at
// once, whether or not the caller holds the `Connection`'s session lock: pooled
// sub-sessions handed out by `Connection::borrow_session`, and `Sftp` values
// dropped by the pool, run without it.
unsafe impl Send for Ssh2Session {}

impl SshSession for Ssh2Session {
    fn keepalive(&self) -> Result<(), SshfsError> {
        self.session
            .keepalive_send()
            .map(|_| ())
            .map_err(|e| SshfsError::Connectivity {
                host: self.host.clone(),
                port: self.port,
                reason: format!("keepalive failed: {}", e),
            })
    }

    fn exec(&self, command: &str) -> Result<Box<dyn CommandChannel>, ExecFailure> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ExecFailure::ChannelOpen(e.to_string()))?;
        channel
            .exec(command)
            .map_err(|e| ExecFailure::Exec(e.to_string()))?;
        Ok(Box::new(Ssh2Channel { channel }))
    }

    fn open_sftp(&self) -> Result<Box<dyn SftpSession>, SshfsError> {
        let sftp = self.session.sftp().map_err(|e| SshfsError::RemoteOperation {
            operation: "start sftp subsystem",
            path: self.host.clone(),
            reason: e.message().to_string(),
            code: sftp_status(&e),
        })?;
        Ok(Box::new(Ssh2Sftp { sftp }))
    }

    fn disconnect(&self, reason: &str) {
        if let Err(e) = self.session.disconnect(None, reason, None) {
            tracing::debug!(host = %self.host, error = %e, "Disconnect message not delivered");
        }
    }
}

struct Ssh2Channel {
    channel: ::ssh2::Channel,
}

// SAFETY: see `Ssh2Session`.
unsafe impl Send for Ssh2Channel {}

impl CommandChannel for Ssh2Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.channel.read(buf)
    }

    fn send_eof(&mut self) -> Result<(), SshfsError> {
        self.channel
            .send_eof()
            .map_err(|e| SshfsError::remote("send eof", "<channel>", e.to_string()))
    }

    fn finish(&mut self) -> Result<i32, SshfsError> {
        let fail = |op: &'static str, e: ::ssh2::Error| SshfsError::remote(op, "<channel>", e.to_string());
        self.channel.wait_eof().map_err(|e| fail("wait eof", e))?;
        self.channel.close().map_err(|e| fail("close channel", e))?;
        self.channel.wait_close().map_err(|e| fail("wait close", e))?;
        self.channel.exit_status().map_err(|e| fail("exit status", e))
    }
}

struct Ssh2Sftp {
    sftp: ::ssh2::Sftp,
}

// SAFETY: see `Ssh2Session`.
unsafe impl Send for Ssh2Sftp {}

impl SftpSession for Ssh2Sftp {
    fn stat(&self, path: &str) -> Result<FileAttributes, SshfsError> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| remote_err("stat", path, e))?;
        Ok(FileAttributes {
            size: stat.size,
            permissions: stat.perm,
            uid: stat.uid,
            gid: stat.gid,
            atime: stat.atime,
            mtime: stat.mtime,
        })
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn RemoteFile>, SshfsError> {
        let (flags, perm) = match mode {
            OpenMode::Read => (OpenFlags::READ, 0),
            OpenMode::Truncate => (
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
            ),
            OpenMode::Append => (OpenFlags::WRITE | OpenFlags::APPEND, 0o644),
            OpenMode::Write => (OpenFlags::WRITE, 0o644),
        };
        let mut file = self
            .sftp
            .open_mode(Path::new(path), flags, perm, OpenType::File)
            .map_err(|e| remote_err("open", path, e))?;

        // Servers differ in how they treat SSH_FXF_APPEND, so position the
        // handle at the current end explicitly.
        if mode == OpenMode::Append {
            let end = file
                .stat()
                .map_err(|e| remote_err("stat", path, e))?
                .size
                .unwrap_or(0);
            file.seek(SeekFrom::Start(end))
                .map_err(|e| remote_io_err("seek", path, e))?;
        }

        Ok(Box::new(Ssh2File {
            file,
            path: path.to_string(),
        }))
    }

    fn mkdir(&self, path: &str, mode: i32) -> Result<(), SshfsError> {
        self.sftp
            .mkdir(Path::new(path), mode)
            .map_err(|e| remote_err("mkdir", path, e))
    }

    fn rmdir(&self, path: &str) -> Result<(), SshfsError> {
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| remote_err("rmdir", path, e))
    }

    fn unlink(&self, path: &str) -> Result<(), SshfsError> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| remote_err("unlink", path, e))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<(), SshfsError> {
        self.sftp
            .rename(
                Path::new(src),
                Path::new(dst),
                Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
            )
            .map_err(|e| remote_err("rename", src, e))
    }
}

struct Ssh2File {
    file: ::ssh2::File,
    path: String,
}

// SAFETY: see `Ssh2Session`.
unsafe impl Send for Ssh2File {}

impl RemoteFile for Ssh2File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SshfsError> {
        self.file
            .read(buf)
            .map_err(|e| remote_io_err("read", &self.path, e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SshfsError> {
        self.file
            .write(buf)
            .map_err(|e| remote_io_err("write", &self.path, e))
    }

    fn seek(&mut self, offset: u64) -> Result<(), SshfsError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| remote_io_err("seek", &self.path, e))
    }

    fn set_len(&mut self, size: u64) -> Result<(), SshfsError> {
        let stat = ::ssh2::FileStat {
            size: Some(size),
            uid: None,
            gid: None,
            perm: None,
            atime: None,
            mtime: None,
        };
        self.file
            .setstat(stat)
            .map_err(|e| remote_err("truncate", &self.path, e))
    }

    fn close(&mut self) -> Result<(), SshfsError> {
        self.file
            .close()
            .map_err(|e| remote_err("close", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preferences_start_with_curve25519() {
        let kex = preference_list(KEX_ALGORITHMS, false);
        assert!(kex.starts_with("curve25519-sha256,"));
        assert!(kex.contains("ecdh-sha2-nistp256"));
        assert!(kex.ends_with("diffie-hellman-group14-sha1"));
    }

    #[test]
    fn strict_crypto_drops_nist_curves() {
        let kex = preference_list(KEX_ALGORITHMS, true);
        assert!(!kex.contains("nistp"));
        assert!(kex.contains("curve25519-sha256@libssh.org"));

        let host_keys = preference_list(HOST_KEY_ALGORITHMS, true);
        assert_eq!(host_keys, "ssh-ed25519,rsa-sha2-256,rsa-sha2-512,ssh-rsa");
    }

    #[test]
    fn known_hosts_entry_brackets_non_default_port() {
        assert_eq!(known_hosts_entry("example.com", 22), "example.com");
        assert_eq!(known_hosts_entry("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn sha256_fingerprint_is_unpadded_base64() {
        // "Man" -> "TWFu"; 32 zero bytes -> 43 characters without padding
        assert_eq!(format_sha256_fingerprint(b"Man"), "SHA256:TWFu");
        let fp = format_sha256_fingerprint(&[0u8; 32]);
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn sftp_status_is_extracted_from_sftp_errors() {
        let err = ::ssh2::Error::new(ErrorCode::SFTP(2), "no such file");
        let mapped = remote_err("stat", "/missing", err);
        assert_eq!(mapped.sftp_code(), Some(crate::error::SFTP_NO_SUCH_FILE));
        assert!(mapped.to_string().contains("/missing"));

        let err = ::ssh2::Error::new(ErrorCode::Session(-7), "socket send");
        assert_eq!(remote_err("write", "/x", err).sftp_code(), None);
    }

    #[test]
    #[ignore = "requires a reachable SSH server"]
    fn connect_to_localhost_with_agent() {
        let user = std::env::var("USER").unwrap_or_default();
        let params = ConnectionParams::new("localhost", user).with_agent();
        let session = Ssh2Connector.connect(&params).unwrap();
        session.keepalive().unwrap();
        session.disconnect("test done");
    }
}
