//! Authentication method selection.
//!
//! Exactly one method is attempted per connect. The first explicitly
//! configured method wins and a failure is final; there is no cascade from
//! password to key to agent. Only when nothing is configured do we probe the
//! ambient agent advertised by `SSH_AUTH_SOCK`.

use std::path::{Path, PathBuf};

use crate::config::types::Credentials;

/// The method chosen for a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    PublicKey,
    /// Agent requested explicitly by the caller.
    Agent,
    /// Agent found via `SSH_AUTH_SOCK` with nothing else configured.
    AmbientAgent,
}

/// The subset of session operations authentication needs.
///
/// Each call returns `Err(reason)` if the server did not accept it.
pub trait AuthSession {
    fn auth_password(&self, user: &str, password: &str) -> Result<(), String>;
    fn auth_key_file(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), String>;
    fn auth_agent(&self, user: &str) -> Result<(), String>;
}

/// Whether an SSH agent socket is advertised in the environment.
pub fn agent_socket_present() -> bool {
    std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty())
}

/// Pick the single method to try.
pub fn plan_authentication(creds: &Credentials, agent_available: bool) -> Result<AuthMethod, String> {
    if creds.password.as_ref().is_some_and(|p| !p.is_empty()) {
        return Ok(AuthMethod::Password);
    }
    if creds
        .key_path
        .as_ref()
        .is_some_and(|p| !p.as_os_str().is_empty())
    {
        return Ok(AuthMethod::PublicKey);
    }
    if creds.use_agent {
        if agent_available {
            return Ok(AuthMethod::Agent);
        }
        return Err("SSH agent requested but SSH_AUTH_SOCK is not set".to_string());
    }
    if agent_available {
        return Ok(AuthMethod::AmbientAgent);
    }
    Err("no authentication method configured (password, key file or agent)".to_string())
}

/// The `.pub` file next to a private key, if there is one.
pub fn public_key_for(private_key: &Path) -> Option<PathBuf> {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    let public = PathBuf::from(name);
    public.is_file().then_some(public)
}

/// Authenticate `user` with the planned method.
pub fn authenticate<S: AuthSession + ?Sized>(
    session: &S,
    user: &str,
    creds: &Credentials,
    agent_available: bool,
) -> Result<AuthMethod, String> {
    let method = plan_authentication(creds, agent_available)?;
    match method {
        AuthMethod::Password => {
            let password = creds.password.as_deref().map(String::as_str).unwrap_or_default();
            session.auth_password(user, password)?;
        }
        AuthMethod::PublicKey => {
            let private_key = creds.key_path.as_deref().unwrap_or(Path::new(""));
            let public_key = public_key_for(private_key);
            tracing::debug!(
                key = %private_key.display(),
                public_key = public_key.is_some(),
                "Trying public key authentication"
            );
            session.auth_key_file(
                user,
                public_key.as_deref(),
                private_key,
                creds.key_passphrase.as_deref().map(String::as_str),
            )?;
        }
        AuthMethod::Agent => session.auth_agent(user)?,
        AuthMethod::AmbientAgent => {
            tracing::warn!(
                "No credentials configured; falling back to the agent at SSH_AUTH_SOCK. \
                 Pass --agent to make this explicit."
            );
            session.auth_agent(user)?;
        }
    }
    tracing::debug!(user, method = ?method, "Authenticated");
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    /// Records every attempt and rejects according to its flags.
    #[derive(Default)]
    struct RecordingSession {
        attempts: RefCell<Vec<&'static str>>,
        reject: bool,
        seen_public_key: RefCell<Option<PathBuf>>,
    }

    impl AuthSession for RecordingSession {
        fn auth_password(&self, _user: &str, _password: &str) -> Result<(), String> {
            self.attempts.borrow_mut().push("password");
            if self.reject {
                Err("password rejected".into())
            } else {
                Ok(())
            }
        }

        fn auth_key_file(
            &self,
            _user: &str,
            public_key: Option<&Path>,
            _private_key: &Path,
            _passphrase: Option<&str>,
        ) -> Result<(), String> {
            self.attempts.borrow_mut().push("key");
            *self.seen_public_key.borrow_mut() = public_key.map(Path::to_path_buf);
            if self.reject {
                Err("key rejected".into())
            } else {
                Ok(())
            }
        }

        fn auth_agent(&self, _user: &str) -> Result<(), String> {
            self.attempts.borrow_mut().push("agent");
            if self.reject {
                Err("agent rejected".into())
            } else {
                Ok(())
            }
        }
    }

    fn creds(password: Option<&str>, key: Option<&str>, agent: bool) -> Credentials {
        Credentials {
            password: password.map(|p| Zeroizing::new(p.to_string())),
            key_path: key.map(PathBuf::from),
            key_passphrase: None,
            use_agent: agent,
        }
    }

    #[test]
    fn password_beats_key_and_agent() {
        let c = creds(Some("pw"), Some("/k/id_ed25519"), true);
        assert_eq!(plan_authentication(&c, true), Ok(AuthMethod::Password));
    }

    #[test]
    fn wrong_password_does_not_fall_through_to_key() {
        let session = RecordingSession {
            reject: true,
            ..Default::default()
        };
        let c = creds(Some("wrong"), Some("/k/id_ed25519"), false);
        let err = authenticate(&session, "alice", &c, true).unwrap_err();
        assert!(err.contains("password rejected"));
        assert_eq!(*session.attempts.borrow(), vec!["password"]);
    }

    #[test]
    fn empty_password_is_ignored() {
        let c = creds(Some(""), Some("/k/id_rsa"), false);
        assert_eq!(plan_authentication(&c, false), Ok(AuthMethod::PublicKey));
    }

    #[test]
    fn explicit_agent_needs_socket() {
        let c = creds(None, None, true);
        assert_eq!(plan_authentication(&c, true), Ok(AuthMethod::Agent));
        assert!(plan_authentication(&c, false).unwrap_err().contains("SSH_AUTH_SOCK"));
    }

    #[test]
    fn ambient_agent_only_without_explicit_methods() {
        let c = creds(None, None, false);
        assert_eq!(plan_authentication(&c, true), Ok(AuthMethod::AmbientAgent));
        assert!(plan_authentication(&c, false)
            .unwrap_err()
            .contains("no authentication method"));
    }

    #[test]
    fn key_auth_passes_sibling_public_key() {
        let tmp = TempDir::new().unwrap();
        let private = tmp.path().join("id_ed25519");
        std::fs::write(&private, "private").unwrap();
        std::fs::write(tmp.path().join("id_ed25519.pub"), "public").unwrap();

        let session = RecordingSession::default();
        let c = creds(None, Some(private.to_str().unwrap()), false);
        let method = authenticate(&session, "alice", &c, false).unwrap();
        assert_eq!(method, AuthMethod::PublicKey);
        assert_eq!(
            session.seen_public_key.borrow().as_deref(),
            Some(tmp.path().join("id_ed25519.pub").as_path())
        );
    }

    #[test]
    fn key_without_public_file_passes_none() {
        let tmp = TempDir::new().unwrap();
        let private = tmp.path().join("id_rsa");
        std::fs::write(&private, "private").unwrap();
        assert!(public_key_for(&private).is_none());
    }
}
