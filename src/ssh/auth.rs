//! Credential resolution: turns a profile's SSH settings into the ordered
//! list of authentication methods offered to the bastion.
//!
//! Order of preference is agent, then key file, then password. Every
//! applicable method is returned; the handshake tries them in turn.

use russh_keys::decode_secret_key;
use russh_keys::key::KeyPair;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::error::{Result, TunnelError};
use crate::models::profile::SshSettings;

/// One way of proving identity to the bastion
#[derive(Clone)]
pub enum AuthMethod {
    /// Keys held by an ssh-agent listening on this socket
    Agent(PathBuf),
    /// A decoded private key loaded from `path`
    PrivateKey { path: String, key: Arc<KeyPair> },
    Password(String),
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Agent(_) => "agent",
            AuthMethod::PrivateKey { .. } => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthMethod::Agent(socket) => f.debug_tuple("Agent").field(socket).finish(),
            AuthMethod::PrivateKey { path, .. } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("key", &"[REDACTED]")
                .finish(),
            AuthMethod::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
        }
    }
}

/// Builds `AuthMethod` lists. The agent socket is captured when the resolver
/// is created so resolution itself never touches process-wide state.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    agent_socket: Option<PathBuf>,
}

impl CredentialResolver {
    /// Discover the agent through `SSH_AUTH_SOCK`
    pub fn from_env() -> Self {
        let agent_socket = std::env::var_os("SSH_AUTH_SOCK")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self { agent_socket }
    }

    pub fn with_agent_socket(agent_socket: Option<PathBuf>) -> Self {
        Self { agent_socket }
    }

    pub fn agent_socket(&self) -> Option<&Path> {
        self.agent_socket.as_deref()
    }

    /// Resolve the ordered method list for one connection attempt.
    ///
    /// An explicitly configured key that cannot be read or decoded is a hard
    /// `InvalidKeyMaterial` failure, never skipped.
    pub fn resolve(&self, ssh: &SshSettings) -> Result<Vec<AuthMethod>> {
        if ssh.host.trim().is_empty() || ssh.user.trim().is_empty() {
            return Err(TunnelError::NoAuthMethodAvailable(
                "SSH host and user are required".to_string(),
            ));
        }

        let mut methods = Vec::new();

        if let Some(socket) = self.discover_agent() {
            tracing::debug!("Offering ssh-agent at {}", socket.display());
            methods.push(AuthMethod::Agent(socket));
        }

        if !ssh.key_path.trim().is_empty() {
            let key = load_private_key(&ssh.key_path, &ssh.passphrase)?;
            tracing::debug!("Offering private key {}", ssh.key_path);
            methods.push(AuthMethod::PrivateKey {
                path: ssh.key_path.clone(),
                key: Arc::new(key),
            });
        }

        if !ssh.password.is_empty() {
            tracing::debug!("Offering password authentication");
            methods.push(AuthMethod::Password(ssh.password.clone()));
        }

        if methods.is_empty() {
            return Err(TunnelError::NoAuthMethodAvailable(format!(
                "no ssh-agent, key or password configured for {}@{}",
                ssh.user, ssh.host
            )));
        }

        Ok(methods)
    }

    fn discover_agent(&self) -> Option<PathBuf> {
        let socket = self.agent_socket.as_ref()?;
        if socket.exists() {
            Some(socket.clone())
        } else {
            tracing::debug!(
                "Ignoring ssh-agent socket {}: no such file",
                socket.display()
            );
            None
        }
    }
}

/// Read and decode a private key, using the passphrase when one is given.
pub fn load_private_key(path: &str, passphrase: &str) -> Result<KeyPair> {
    let expanded = expand_path(path);

    let content = std::fs::read_to_string(&expanded).map_err(|e| {
        TunnelError::InvalidKeyMaterial {
            path: expanded.clone(),
            reason: format!("failed to read key: {}", e),
        }
    })?;

    let passphrase = (!passphrase.is_empty()).then_some(passphrase);
    decode_secret_key(&content, passphrase).map_err(|e| TunnelError::InvalidKeyMaterial {
        path: expanded,
        reason: format!("failed to decode key: {}", e),
    })
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references. Unset variables
/// are left as written so the read error names them.
fn expand_path(path: &str) -> String {
    shellexpand::full_with_context_no_errors(
        path,
        || dirs::home_dir().map(|home| home.to_string_lossy().into_owned()),
        |var| std::env::var(var).ok(),
    )
    .into_owned()
}
