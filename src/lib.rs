//! Seekable read/write access to files on SSH servers.
//!
//! A [`Connection`] owns one authenticated SSH session. [`FileHandle`]s bound
//! to it read byte ranges (streamed through `dd` when the server allows
//! commands, SFTP otherwise) or write through a chunked background upload
//! pipeline. A [`Registry`] shares connections by `user@host:port`.
//!
//! ```no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use sshfs::{ConnectionParams, FileHandle, Registry};
//!
//! # fn main() -> Result<(), sshfs::SshfsError> {
//! let registry = Registry::new();
//! let conn = registry.get_or_connect(
//!     ConnectionParams::new("files.example.com", "alice").with_agent(),
//! )?;
//! let mut handle = FileHandle::open_read(Arc::clone(&conn), "/data/report.csv")?;
//! let mut text = String::new();
//! handle.read_to_string(&mut text)?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod progress;
pub mod session;

#[cfg(test)]
mod testutil;

pub use client::{Connection, Registry};
pub use config::types::{ConnectionKey, ConnectionParams, HostKeyCheck, RetryPolicy};
pub use error::SshfsError;
pub use handle::FileHandle;
pub use session::FileAttributes;
