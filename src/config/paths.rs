//! Platform-specific config directory helpers.
//!
//! Uses the `dirs` crate to resolve platform-appropriate directories:
//! - Linux:   `~/.config/sshfs/`
//! - Windows: `%APPDATA%\sshfs\`
//! - macOS:   `~/Library/Application Support/sshfs/`

use std::path::PathBuf;

use crate::error::SshfsError;

/// Name of the tuning file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the sshfs config directory without creating it.
///
/// Reading configuration never needs the directory to exist, so unlike a
/// data directory this is not created eagerly.
pub fn sshfs_config_dir() -> Result<PathBuf, SshfsError> {
    let base = dirs::config_dir()
        .ok_or_else(|| SshfsError::Config("Could not determine config directory".into()))?;
    Ok(base.join("sshfs"))
}

/// Default location of `config.toml`.
pub fn default_config_file() -> Result<PathBuf, SshfsError> {
    Ok(sshfs_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Default OpenSSH known_hosts file, `~/.ssh/known_hosts`.
pub fn known_hosts_file() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_ends_with_sshfs() {
        if let Ok(dir) = sshfs_config_dir() {
            assert!(dir.ends_with("sshfs"));
        }
    }

    #[test]
    fn default_config_file_is_config_toml() {
        if let Ok(file) = default_config_file() {
            assert_eq!(file.file_name().unwrap(), CONFIG_FILE_NAME);
            assert!(file.parent().unwrap().ends_with("sshfs"));
        }
    }

    #[test]
    fn known_hosts_lives_under_dot_ssh() {
        if let Some(path) = known_hosts_file() {
            assert!(path.ends_with(".ssh/known_hosts"));
        }
    }
}
