use clap::Parser;
use tracing_subscriber::EnvFilter;

use sshfs::cli::args::Cli;
use sshfs::cli::commands;
use sshfs::config::types::Verbosity;
use sshfs::SshfsError;

fn main() {
    let cli = Cli::parse();

    // Convert CLI flags to verbosity level
    let verbosity = Verbosity::from((cli.quiet, cli.verbose));

    // RUST_LOG env var overrides CLI flags
    let filter = verbosity.as_tracing_filter();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr) // Keep stdout clean for output
        .init();

    tracing::debug!("Verbosity level: {:?}", verbosity);

    match commands::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            display_error(&err);
            std::process::exit(1);
        }
    }
}

/// Display an SshfsError with optional suggestion hint to stderr.
fn display_error(err: &SshfsError) {
    eprintln!("error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("  hint: {}", suggestion);
    }
}
