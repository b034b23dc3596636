//! File handles: a read cursor or an upload pipeline bound to a shared
//! connection.
//!
//! Write handles are sequential. Bytes go through an `UploadPipeline`, so a
//! successful `write` only means the data was buffered or dispatched; call
//! `sync` or `close` to learn whether it reached the server.

pub mod upload;

use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::SystemTime;

use crate::client::Connection;
use crate::error::SshfsError;
use crate::session::FileAttributes;

use self::upload::{ChunkSink, UploadPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    Read,
    Write,
}

pub struct FileHandle {
    conn: Arc<Connection>,
    path: String,
    mode: HandleMode,
    position: u64,
    upload: Option<UploadPipeline>,
    stats: Option<FileAttributes>,
    closed: bool,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FileHandle {
    /// Open `path` for range reads. The file must exist.
    pub fn open_read(conn: Arc<Connection>, path: impl Into<String>) -> Result<Self, SshfsError> {
        let path = path.into();
        let stats = conn.get_file_stats(&path)?;
        tracing::debug!(path = %path, size = stats.len(), "Opened for reading");
        Ok(Self {
            conn,
            path,
            mode: HandleMode::Read,
            position: 0,
            upload: None,
            stats: Some(stats),
            closed: false,
        })
    }

    /// Open `path` for sequential writing. The remote file is created or
    /// truncated by the first chunk, at the latest on `close`.
    pub fn open_write(conn: Arc<Connection>, path: impl Into<String>) -> Result<Self, SshfsError> {
        let path = path.into();
        if !conn.is_connected() {
            return Err(SshfsError::NotConnected {
                host: conn.params().host.clone(),
                port: conn.params().port,
            });
        }
        let params = conn.params();
        let sink: Arc<dyn ChunkSink> = Arc::clone(&conn) as Arc<dyn ChunkSink>;
        let upload = UploadPipeline::new(
            path.clone(),
            sink,
            params.chunk_size,
            params.max_concurrent_uploads,
        );
        tracing::debug!(
            path = %path,
            chunk_size = params.chunk_size,
            max_concurrent_uploads = params.max_concurrent_uploads,
            "Opened for writing"
        );
        Ok(Self {
            conn,
            path,
            mode: HandleMode::Write,
            position: 0,
            upload: Some(upload),
            stats: None,
            closed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn ensure_open(&self) -> Result<(), SshfsError> {
        if self.closed {
            return Err(SshfsError::HandleClosed {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    fn pipeline(&mut self) -> Result<&mut UploadPipeline, SshfsError> {
        self.ensure_open()?;
        match self.upload.as_mut() {
            Some(upload) => Ok(upload),
            None => Err(SshfsError::NotWritable {
                path: self.path.clone(),
            }),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, SshfsError> {
        let n = self.pipeline()?.write(data)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read at the cursor and advance it. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SshfsError> {
        self.ensure_open()?;
        if self.mode == HandleMode::Write {
            return Err(SshfsError::NotReadable {
                path: self.path.clone(),
            });
        }
        let n = self.conn.read_into(&self.path, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Move the cursor to `offset`.
    ///
    /// Write handles only accept their current position.
    pub fn seek(&mut self, offset: u64) -> Result<u64, SshfsError> {
        self.ensure_open()?;
        if self.mode == HandleMode::Write && offset != self.position {
            return Err(SshfsError::SeekUnsupported {
                path: self.path.clone(),
                offset,
                position: self.position,
            });
        }
        self.position = offset;
        Ok(offset)
    }

    /// Dispatch buffered bytes without waiting. A no-op for read handles.
    pub fn flush(&mut self) -> Result<(), SshfsError> {
        self.ensure_open()?;
        match self.upload.as_mut() {
            Some(upload) => upload.flush(),
            None => Ok(()),
        }
    }

    /// Flush and wait until every dispatched chunk has been written.
    pub fn sync(&mut self) -> Result<(), SshfsError> {
        self.ensure_open()?;
        match self.upload.as_mut() {
            Some(upload) => {
                upload.sync()?;
                self.stats = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Finish all uploads and release the handle.
    ///
    /// The handle is closed even when this returns an error; closing twice
    /// is a no-op.
    pub fn close(&mut self) -> Result<(), SshfsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stats = None;
        let result = match self.upload.as_mut() {
            Some(upload) => upload.close(),
            None => Ok(()),
        };
        match &result {
            Ok(()) => tracing::debug!(path = %self.path, bytes = self.progress(), "Closed"),
            Err(e) => tracing::warn!(path = %self.path, error = %e, "Close failed"),
        }
        result
    }

    /// Bytes written so far (write handles) or the read cursor (read handles).
    pub fn progress(&self) -> u64 {
        match &self.upload {
            Some(upload) => upload.progress(),
            None => self.position,
        }
    }

    /// Remote attributes, fetched on first use and cached until the handle
    /// changes the file.
    pub fn cached_stats(&mut self) -> Result<FileAttributes, SshfsError> {
        if let Some(stats) = self.stats {
            return Ok(stats);
        }
        let stats = self.conn.get_file_stats(&self.path)?;
        self.stats = Some(stats);
        Ok(stats)
    }

    /// Current size of the file.
    ///
    /// For write handles this is at least the bytes written so far, and falls
    /// back to that when the remote file does not exist yet.
    pub fn file_size(&mut self) -> Result<u64, SshfsError> {
        match self.mode {
            HandleMode::Read => Ok(self.cached_stats()?.len()),
            HandleMode::Write => {
                let written = self.progress();
                match self.conn.get_file_stats(&self.path) {
                    Ok(stats) => Ok(stats.len().max(written)),
                    Err(e) => {
                        tracing::trace!(path = %self.path, error = %e, "No remote size yet");
                        Ok(written)
                    }
                }
            }
        }
    }

    pub fn last_modified(&mut self) -> Result<Option<SystemTime>, SshfsError> {
        Ok(self.cached_stats()?.modified())
    }

    /// Resize the remote file. Pending uploads are synced first.
    ///
    /// The cursor moves to `size`; later writes append from there.
    pub fn truncate(&mut self, size: u64) -> Result<(), SshfsError> {
        self.pipeline()?.sync()?;
        self.conn.truncate_file(&self.path, size)?;
        self.pipeline()?.rebase(size);
        self.position = size;
        self.stats = None;
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!(path = %self.path, error = %e, "Handle dropped with failed uploads");
            }
        }
    }
}

impl io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileHandle::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileHandle::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        FileHandle::flush(self).map_err(io::Error::from)
    }
}

impl io::Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.file_size().map_err(io::Error::from)?;
                size.checked_add_signed(delta)
            }
        };
        match target {
            Some(offset) => FileHandle::seek(self, offset).map_err(io::Error::from),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
