use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum TunnelError {
    #[error("No usable SSH authentication method: {0}")]
    NoAuthMethodAvailable(String),

    #[error("Invalid SSH key material at {path}: {reason}")]
    InvalidKeyMaterial { path: String, reason: String },

    #[error("SSH handshake with {0} failed: {1}")]
    HandshakeFailed(String, String),

    #[error("SSH authentication rejected by {host} for user {user}")]
    AuthRejected { host: String, user: String },

    #[error("Host key verification failed for {hostname}: {reason}")]
    HostKeyRejected { hostname: String, reason: String },

    #[error("Dial to {target} timed out after {timeout_ms}ms")]
    DialTimeout { target: String, timeout_ms: u64 },

    #[error("Dial to {0} failed: {1}")]
    DialFailed(String, String),

    #[error("Tunnel session to {0} is closed")]
    SessionClosed(String),

    #[error("Failed to bind local listener: {0}")]
    ListenerBindFailed(String),

    #[error("Relay I/O error: {0}")]
    RelayIo(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Database error: {message}")]
    Database { message: String },
}

impl TunnelError {
    /// Check if the next logical connection attempt may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::DialTimeout { .. } | TunnelError::DialFailed(_, _)
        )
    }

    /// Get a suggestion for recovering from this error
    pub fn recovery_suggestion(&self) -> &str {
        match self {
            TunnelError::NoAuthMethodAvailable(_) => {
                "Configure an SSH key, a password, or start an ssh-agent"
            }
            TunnelError::InvalidKeyMaterial { .. } => {
                "Check the key path and passphrase in the profile"
            }
            TunnelError::HandshakeFailed(_, _) => "Check that the bastion host is reachable",
            TunnelError::AuthRejected { .. } => "Verify your SSH credentials",
            TunnelError::HostKeyRejected { .. } => {
                "Verify the bastion host key and update known_hosts"
            }
            TunnelError::DialTimeout { .. } => "Check that the database is reachable from the bastion",
            TunnelError::DialFailed(_, _) => "Check the database host and port in the profile",
            TunnelError::SessionClosed(_) => "Reconnect to open a new tunnel",
            TunnelError::ListenerBindFailed(_) => "Free a local port or choose another one",
            TunnelError::RelayIo(_) => "Retry the operation",
            TunnelError::InvalidConfiguration(_) => "Review your connection profile",
            TunnelError::Database { .. } => "Check the database credentials and server logs",
        }
    }
}

impl From<tokio_postgres::Error> for TunnelError {
    fn from(err: tokio_postgres::Error) -> Self {
        TunnelError::Database {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
