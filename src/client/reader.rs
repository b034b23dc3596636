//! Range reads: `dd` streamed over a command channel when the server allows
//! it, SFTP seek + read otherwise.
//!
//! A failure to open or start the command channel downgrades the connection
//! to SFTP reads for good. A command that starts but then fails is a read
//! error, not a downgrade.

use std::io::ErrorKind;
use std::time::Instant;

use crate::client::connection::{throughput_mib, Connection};
use crate::error::SshfsError;
use crate::session::{ExecFailure, OpenMode};

/// Block size passed to `dd`.
const DD_BLOCK_SIZE: usize = 4096;

/// Size of each SFTP read request.
pub const SFTP_READ_CHUNK: usize = 32 * 1024;

/// Why the command-streamed read did not produce data.
#[derive(Debug)]
enum FastPathError {
    /// The channel could not be opened or the command could not start.
    Unavailable(ExecFailure),
    /// The command ran and failed.
    Failed(SshfsError),
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `dd` invocation that streams `length` bytes of `path` from `offset`.
pub fn dd_command(path: &str, offset: u64, length: usize) -> String {
    format!(
        "dd if={} bs={} iflag=skip_bytes,count_bytes skip={} count={} status=none 2>/dev/null",
        shell_quote(path),
        DD_BLOCK_SIZE,
        offset,
        length
    )
}

impl Connection {
    /// Read up to `length` bytes of `path` starting at `offset`.
    ///
    /// Returns fewer bytes when the file ends first.
    pub fn read_bytes(&self, path: &str, offset: u64, length: usize) -> Result<Vec<u8>, SshfsError> {
        let mut buf = vec![0u8; length];
        let n = self.read_into(path, offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Fill `buf` from `path` at `offset`; returns the number of bytes read.
    pub fn read_into(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, SshfsError> {
        if !self.is_connected() {
            return Err(SshfsError::NotConnected {
                host: self.params().host.clone(),
                port: self.params().port,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let _serialized = self.lock_reads();

        if self.fast_path_available() {
            match self.read_via_command(path, offset, buf) {
                Ok(n) => return Ok(n),
                Err(FastPathError::Unavailable(reason)) => self.disable_fast_path(&reason),
                Err(FastPathError::Failed(e)) => return Err(e),
            }
        }
        self.read_via_sftp(path, offset, buf)
    }

    fn read_via_command(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FastPathError> {
        let command = dd_command(path, offset, buf.len());
        let started = Instant::now();

        self.with_session(|session| {
            let mut channel = match session.exec(&command) {
                Ok(channel) => channel,
                Err(e) => return Ok(Err(e)),
            };
            let exec_ms = started.elapsed().as_millis() as u64;

            let mut total = 0;
            while total < buf.len() {
                match channel.read(&mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                        std::thread::yield_now();
                    }
                    Err(e) => {
                        let _ = channel.finish();
                        return Err(SshfsError::remote("read", path, format!("command channel: {}", e)));
                    }
                }
            }

            let status = match channel.finish() {
                Ok(status) => status,
                Err(e) if total > 0 => {
                    tracing::debug!(path, error = %e, "Channel close failed after data was read");
                    0
                }
                Err(e) => return Err(e),
            };
            if status != 0 && total == 0 {
                return Err(SshfsError::CommandFailed { command, status });
            }
            if status != 0 {
                tracing::debug!(path, status, bytes = total, "dd exited non-zero; keeping partial read");
            }

            let elapsed = started.elapsed();
            tracing::debug!(
                path,
                offset,
                length = buf.len(),
                bytes = total,
                exec_ms,
                elapsed_ms = elapsed.as_millis() as u64,
                mib_per_sec = throughput_mib(total, elapsed),
                "Read via command channel"
            );
            Ok(Ok(total))
        })
        .map_err(FastPathError::Failed)?
        .map_err(FastPathError::Unavailable)
    }

    fn read_via_sftp(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, SshfsError> {
        let started = Instant::now();
        let total = self.with_sftp(|sftp| {
            let mut file = sftp.open(path, OpenMode::Read)?;
            let read = (|| -> Result<usize, SshfsError> {
                file.seek(offset)?;
                let mut total = 0;
                while total < buf.len() {
                    let end = (total + SFTP_READ_CHUNK).min(buf.len());
                    let n = file.read(&mut buf[total..end])?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                Ok(total)
            })();
            if let Err(e) = file.close() {
                tracing::debug!(path, error = %e, "Closing read handle failed");
            }
            read
        })?;

        let elapsed = started.elapsed();
        tracing::debug!(
            path,
            offset,
            length = buf.len(),
            bytes = total,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = throughput_mib(total, elapsed),
            "Read via SFTP"
        );
        Ok(total)
    }
}
