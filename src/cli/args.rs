use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::types::HostKeyCheck;

#[derive(Parser, Debug)]
#[command(
    name = "sshfs",
    version,
    about = "Read and write files on SSH servers as if they were local"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Increase verbosity (-v for verbose, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode: suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Where to connect and how to authenticate.
#[derive(clap::Args, Debug)]
pub struct RemoteArgs {
    /// SSH server host name or address
    #[arg(long)]
    pub host: String,

    /// SSH server port
    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    /// Remote user name
    #[arg(short = 'l', long)]
    pub user: String,

    /// Prompt for a password (or read SSHFS_PASSWORD)
    #[arg(long, conflicts_with_all = ["identity", "agent"])]
    pub password: bool,

    /// Private key file for public-key authentication
    #[arg(short, long, conflicts_with = "agent")]
    pub identity: Option<PathBuf>,

    /// Prompt for the private key's passphrase
    #[arg(long, requires = "identity")]
    pub passphrase: bool,

    /// Authenticate with the running SSH agent
    #[arg(long)]
    pub agent: bool,

    /// Tuning file (default: <config dir>/sshfs/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Connection retries after the first attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// Upload chunk size (e.g. 8MiB, 50MB, 1048576)
    #[arg(long)]
    pub chunk_size: Option<String>,

    /// Maximum chunks uploaded concurrently
    #[arg(long)]
    pub max_uploads: Option<usize>,

    /// Refuse NIST-curve key exchange and host key algorithms
    #[arg(long)]
    pub strict_crypto: bool,

    /// How to check the server's host key against known_hosts
    #[arg(long, value_enum)]
    pub host_key_check: Option<HostKeyCheck>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a remote file
    Get(GetArgs),

    /// Upload a local file
    Put(PutArgs),

    /// Print a remote file, or a byte range of it, to stdout
    Cat(CatArgs),

    /// Show remote file attributes
    Stat(StatArgs),

    /// Exit 0 if the remote path exists, 1 otherwise
    Exists(PathArg),

    /// Remove a remote file
    Rm(PathArg),

    /// Rename a remote file, replacing the destination
    Mv(MvArgs),

    /// Create a remote directory and any missing parents
    Mkdir(PathArg),

    /// Remove an empty remote directory
    Rmdir(PathArg),

    /// Resize a remote file
    Truncate(TruncateArgs),

    /// Run a command on the server and print its output
    Exec(ExecArgs),
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    /// Remote file to download
    pub remote: String,

    /// Local destination (default: the remote file name in the current directory)
    pub local: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct PutArgs {
    /// Local file to upload
    pub local: PathBuf,

    /// Remote destination path
    pub remote: String,
}

#[derive(clap::Args, Debug)]
pub struct CatArgs {
    /// Remote file to print
    pub remote: String,

    /// Byte offset to start at
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Number of bytes to print (default: to end of file)
    #[arg(long)]
    pub length: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct StatArgs {
    /// Remote path
    pub remote: String,

    /// Print attributes as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct PathArg {
    /// Remote path
    pub remote: String,
}

#[derive(clap::Args, Debug)]
pub struct MvArgs {
    /// Existing remote path
    pub src: String,

    /// New remote path
    pub dst: String,
}

#[derive(clap::Args, Debug)]
pub struct TruncateArgs {
    /// Remote file
    pub remote: String,

    /// New size (e.g. 0, 4096, 10MiB)
    pub size: String,
}

#[derive(clap::Args, Debug)]
pub struct ExecArgs {
    /// Command line to run in the remote shell
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}
