//! Command dispatch for the `sshfs` binary.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use zeroize::Zeroizing;

use crate::cli::args::{Cli, Commands, RemoteArgs};
use crate::client::{Connection, Registry};
use crate::config::file::{parse_size, TuningFile};
use crate::config::paths::default_config_file;
use crate::config::types::ConnectionParams;
use crate::error::SshfsError;
use crate::handle::FileHandle;
use crate::progress::bar::{create_transfer_progress, transfer_summary, ProgressWriter};
use crate::session::FileAttributes;

/// Bytes requested per range read. Each read is one remote round trip.
const READ_BUFFER: usize = 4 * 1024 * 1024;

/// Local read size when uploading.
const UPLOAD_BUFFER: usize = 1024 * 1024;

/// Environment variable consulted for the password before prompting.
const PASSWORD_ENV: &str = "SSHFS_PASSWORD";

/// Build connection parameters from flags, the tuning file and prompts.
///
/// Precedence: command-line flags, then the tuning file, then defaults.
pub fn build_params(args: &RemoteArgs) -> Result<ConnectionParams, SshfsError> {
    let config_path = match &args.config {
        Some(path) => {
            if !path.exists() {
                return Err(SshfsError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            path.clone()
        }
        None => default_config_file()?,
    };
    let tuning = TuningFile::load(&config_path)?;

    let mut params = tuning.apply(ConnectionParams::new(&args.host, &args.user).with_port(args.port))?;

    if let Some(retries) = args.retries {
        params.retry.max_retries = retries;
    }
    if let Some(size) = &args.chunk_size {
        params.chunk_size = parse_size(size)?;
    }
    if let Some(max) = args.max_uploads {
        params.max_concurrent_uploads = max;
    }
    if args.strict_crypto {
        params.strict_crypto = true;
    }
    if let Some(check) = args.host_key_check {
        params.host_key_check = check;
    }

    if args.password {
        let password = read_password(&args.user, &args.host)?;
        params = params.with_password(password.as_str());
    } else if let Some(identity) = &args.identity {
        let passphrase = if args.passphrase {
            let prompt = format!("Passphrase for {}: ", identity.display());
            Some(prompt_secret(&prompt)?.as_str().to_string())
        } else {
            None
        };
        params = params.with_key(identity.clone(), passphrase);
    } else if args.agent {
        params = params.with_agent();
    } else if let Ok(password) = std::env::var(PASSWORD_ENV) {
        params = params.with_password(password);
    }

    params.validate()?;
    tracing::debug!(?params, config = %config_path.display(), "Connection parameters");
    Ok(params)
}

fn read_password(user: &str, host: &str) -> Result<Zeroizing<String>, SshfsError> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password));
    }
    prompt_secret(&format!("Password for {}@{}: ", user, host))
}

fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>, SshfsError> {
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .map_err(|e| SshfsError::Config(format!("could not read secret from terminal: {}", e)))
}

/// Execute the parsed command line. Returns the process exit code.
pub fn run(cli: Cli) -> Result<i32, SshfsError> {
    let params = build_params(&cli.remote)?;
    let registry = Registry::new();
    let conn = registry.get_or_connect(params)?;

    let result = dispatch(&conn, cli.command, cli.quiet);
    drop(conn);
    registry.clear();
    result
}

fn dispatch(conn: &Arc<Connection>, command: Commands, quiet: bool) -> Result<i32, SshfsError> {
    match command {
        Commands::Get(args) => {
            let local = match args.local {
                Some(path) => path,
                None => default_local_name(&args.remote)?,
            };
            download(conn, &args.remote, &local, quiet)?;
            Ok(0)
        }
        Commands::Put(args) => {
            upload(conn, &args.local, &args.remote, quiet)?;
            Ok(0)
        }
        Commands::Cat(args) => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            cat(conn, &args.remote, args.offset, args.length, &mut out)?;
            out.flush()?;
            Ok(0)
        }
        Commands::Stat(args) => {
            let attrs = conn.get_file_stats(&args.remote)?;
            let report = StatReport::new(&args.remote, &attrs);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.to_text());
            }
            Ok(0)
        }
        Commands::Exists(args) => {
            if conn.file_exists(&args.remote) {
                if !quiet {
                    println!("{}", args.remote);
                }
                Ok(0)
            } else {
                Ok(1)
            }
        }
        Commands::Rm(args) => {
            conn.remove_file(&args.remote)?;
            tracing::info!(path = %args.remote, "Removed");
            Ok(0)
        }
        Commands::Mv(args) => {
            conn.rename_file(&args.src, &args.dst)?;
            tracing::info!(src = %args.src, dst = %args.dst, "Renamed");
            Ok(0)
        }
        Commands::Mkdir(args) => {
            conn.create_directory(&args.remote)?;
            Ok(0)
        }
        Commands::Rmdir(args) => {
            conn.remove_directory(&args.remote)?;
            Ok(0)
        }
        Commands::Truncate(args) => {
            let size = parse_size(&args.size)? as u64;
            conn.truncate_file(&args.remote, size)?;
            Ok(0)
        }
        Commands::Exec(args) => {
            let output = conn.execute_command(&args.command.join(" "))?;
            print!("{}", output);
            io::stdout().flush()?;
            Ok(0)
        }
    }
}

/// Local file name for `get` without an explicit destination.
fn default_local_name(remote: &str) -> Result<PathBuf, SshfsError> {
    match remote.trim_end_matches('/').rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(PathBuf::from(name)),
        _ => Err(SshfsError::Config(format!(
            "cannot derive a local file name from '{}'; pass one explicitly",
            remote
        ))),
    }
}

fn download(conn: &Arc<Connection>, remote: &str, local: &Path, quiet: bool) -> Result<u64, SshfsError> {
    let started = Instant::now();
    let mut handle = FileHandle::open_read(Arc::clone(conn), remote)?;
    let total = handle.file_size()?;
    let progress = create_transfer_progress(total, quiet);

    let mut writer = BufWriter::new(File::create(local)?);
    let mut buf = vec![0u8; READ_BUFFER];
    let mut copied = 0u64;
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        progress.set_position(copied);
    }
    writer.flush()?;
    handle.close()?;
    progress.finish_and_clear();

    if !quiet {
        eprintln!("{}", transfer_summary(remote, copied, started.elapsed()));
    }
    Ok(copied)
}

fn upload(conn: &Arc<Connection>, local: &Path, remote: &str, quiet: bool) -> Result<u64, SshfsError> {
    let started = Instant::now();
    let mut source = File::open(local)?;
    let total = source.metadata()?.len();
    let progress = create_transfer_progress(total, quiet);

    let handle = FileHandle::open_write(Arc::clone(conn), remote)?;
    let mut writer = ProgressWriter::new(handle, progress.clone(), |h: &FileHandle| h.progress());
    let mut buf = vec![0u8; UPLOAD_BUFFER];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    let mut handle = writer.into_inner();
    progress.set_message("finishing uploads");
    handle.close()?;
    progress.finish_and_clear();

    let sent = handle.progress();
    if !quiet {
        eprintln!("{}", transfer_summary(remote, sent, started.elapsed()));
    }
    Ok(sent)
}

/// Copy `length` bytes of `remote` from `offset` (or to end of file) to `out`.
fn cat(
    conn: &Arc<Connection>,
    remote: &str,
    offset: u64,
    length: Option<u64>,
    out: &mut dyn Write,
) -> Result<u64, SshfsError> {
    let mut handle = FileHandle::open_read(Arc::clone(conn), remote)?;
    let end = match length {
        Some(len) => offset.saturating_add(len),
        None => handle.file_size()?,
    };
    handle.seek(offset)?;

    let mut buf = vec![0u8; READ_BUFFER];
    let mut written = 0u64;
    while handle.position() < end {
        let want = (end - handle.position()).min(READ_BUFFER as u64) as usize;
        let n = handle.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    handle.close()?;
    Ok(written)
}

/// Printable view of `FileAttributes`.
#[derive(Debug, Serialize)]
struct StatReport {
    path: String,
    kind: &'static str,
    size: Option<u64>,
    permissions: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    modified: Option<DateTime<Utc>>,
    accessed: Option<DateTime<Utc>>,
}

impl StatReport {
    fn new(path: &str, attrs: &FileAttributes) -> Self {
        let kind = if attrs.is_dir() {
            "directory"
        } else if attrs.is_file() {
            "file"
        } else {
            "other"
        };
        let timestamp = |secs: u64| DateTime::<Utc>::from_timestamp(secs as i64, 0);
        Self {
            path: path.to_string(),
            kind,
            size: attrs.size,
            permissions: attrs.permissions.map(|p| format!("{:o}", p & 0o7777)),
            uid: attrs.uid,
            gid: attrs.gid,
            modified: attrs.mtime.and_then(timestamp),
            accessed: attrs.atime.and_then(timestamp),
        }
    }

    fn to_text(&self) -> String {
        let dash = || "-".to_string();
        let mut text = format!("path:        {}\n", self.path);
        text.push_str(&format!("type:        {}\n", self.kind));
        text.push_str(&format!(
            "size:        {}\n",
            self.size
                .map(|s| format!("{} ({})", s, bytesize::ByteSize(s)))
                .unwrap_or_else(dash)
        ));
        text.push_str(&format!(
            "permissions: {}\n",
            self.permissions.clone().unwrap_or_else(dash)
        ));
        text.push_str(&format!(
            "owner:       {}:{}\n",
            self.uid.map(|u| u.to_string()).unwrap_or_else(dash),
            self.gid.map(|g| g.to_string()).unwrap_or_else(dash)
        ));
        text.push_str(&format!(
            "modified:    {}\n",
            self.modified.map(|t| t.to_rfc3339()).unwrap_or_else(dash)
        ));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mock_params, MockRemote};

    fn remote_args(config: Option<PathBuf>) -> RemoteArgs {
        RemoteArgs {
            host: "files.example.com".into(),
            port: 2222,
            user: "alice".into(),
            password: false,
            identity: Some(PathBuf::from("/keys/id_ed25519")),
            passphrase: false,
            agent: false,
            config,
            retries: Some(0),
            chunk_size: Some("1MiB".into()),
            max_uploads: Some(3),
            strict_crypto: true,
            host_key_check: None,
        }
    }

    #[test]
    fn flags_override_tuning_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[connection]\nmax_retries = 9\nchunk_size = \"8 MiB\"\nkeepalive_interval = 15\n",
        )
        .unwrap();

        let params = build_params(&remote_args(Some(path))).unwrap();
        assert_eq!(params.port, 2222);
        assert_eq!(params.retry.max_retries, 0);
        assert_eq!(params.chunk_size, 1024 * 1024);
        assert_eq!(params.max_concurrent_uploads, 3);
        assert_eq!(params.keepalive_interval, 15, "file value kept when no flag");
        assert!(params.strict_crypto);
        assert_eq!(
            params.credentials.key_path.as_deref(),
            Some(Path::new("/keys/id_ed25519"))
        );
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = build_params(&remote_args(Some(PathBuf::from("/nonexistent/sshfs.toml")))).unwrap_err();
        assert!(matches!(err, SshfsError::Config(_)));
    }

    #[test]
    fn local_name_comes_from_remote_path() {
        assert_eq!(default_local_name("/data/report.csv").unwrap(), PathBuf::from("report.csv"));
        assert_eq!(default_local_name("report.csv").unwrap(), PathBuf::from("report.csv"));
        assert!(default_local_name("/").is_err());
    }

    #[test]
    fn upload_then_download_and_cat() {
        let remote = MockRemote::new();
        let conn = Arc::new(remote.connection(mock_params().with_chunk_size(5)));
        conn.connect().unwrap();

        let tmp = tempfile::TempDir::new().unwrap();
        let local = tmp.path().join("in.txt");
        std::fs::write(&local, b"the quick brown fox").unwrap();

        let sent = upload(&conn, &local, "/up/fox.txt", true).unwrap();
        assert_eq!(sent, 19);
        assert_eq!(remote.file("/up/fox.txt").unwrap(), b"the quick brown fox");

        let back = tmp.path().join("out.txt");
        assert_eq!(download(&conn, "/up/fox.txt", &back, true).unwrap(), 19);
        assert_eq!(std::fs::read(&back).unwrap(), b"the quick brown fox");

        let mut out = Vec::new();
        cat(&conn, "/up/fox.txt", 4, Some(5), &mut out).unwrap();
        assert_eq!(out, b"quick");

        let mut tail = Vec::new();
        cat(&conn, "/up/fox.txt", 16, None, &mut tail).unwrap();
        assert_eq!(tail, b"fox");
    }

    #[test]
    fn stat_report_formats() {
        let attrs = FileAttributes {
            size: Some(2048),
            permissions: Some(0o100640),
            uid: Some(1000),
            gid: Some(100),
            atime: None,
            mtime: Some(0),
        };
        let report = StatReport::new("/x", &attrs);
        assert_eq!(report.kind, "file");
        assert_eq!(report.permissions.as_deref(), Some("640"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["size"], 2048);
        assert_eq!(json["modified"], "1970-01-01T00:00:00Z");

        let text = report.to_text();
        assert!(text.contains("owner:       1000:100"));
    }
}
