use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::models::address::RemoteAddr;
use crate::models::error::{Result, TunnelError};

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_SSH_PORT: u16 = 22;

/// PostgreSQL `sslmode` values understood by the driver connector
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(TunnelError::InvalidConfiguration(format!(
                "Unsupported sslmode '{}'",
                other
            ))),
        }
    }
}

/// SSH bastion settings nested in a profile
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub enabled: bool,
    pub user: String,
    pub host: String,
    /// 0 means the default SSH port
    pub port: u16,
    pub key_path: String,
    pub passphrase: String,
    pub password: String,
    /// Handshake timeout in seconds; 0 falls back to `ConnectOptions`
    pub timeout: u64,
}

impl SshSettings {
    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.port
        }
    }

    pub fn bastion_address(&self) -> RemoteAddr {
        RemoteAddr::new(self.host.clone(), self.port())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// A database endpoint, optionally behind an SSH bastion.
///
/// Field names follow the on-disk profile format owned by the configuration
/// layer; this crate only reads profiles.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    /// 0 means the default PostgreSQL port
    pub port: u16,
    pub database: String,
    #[serde(rename = "sslmode")]
    pub ssl_mode: SslMode,
    /// Full connection string; overrides the discrete fields when set
    #[serde(rename = "dburl")]
    pub db_url: String,
    pub ssh: SshSettings,
}

fn redacted(secret: &str) -> Option<&'static str> {
    (!secret.is_empty()).then_some("[REDACTED]")
}

impl std::fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SshSettings")
            .field("enabled", &self.enabled)
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("passphrase", &redacted(&self.passphrase))
            .field("password", &redacted(&self.password))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &redacted(&self.password))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("db_url", &redacted(&self.db_url))
            .field("ssh", &self.ssh)
            .finish()
    }
}

impl Profile {
    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_DB_PORT
        } else {
            self.port
        }
    }

    pub fn has_db_url(&self) -> bool {
        !self.db_url.trim().is_empty()
    }

    /// Connection URL for the profile's own address.
    pub fn dsn(&self) -> Result<String> {
        if self.has_db_url() {
            return Ok(self.db_url.clone());
        }
        self.dsn_for(&self.host, self.port())
    }

    /// Connection URL with the host and port replaced, e.g. to point an
    /// external tool at a forwarded local port.
    pub fn dsn_for(&self, host: &str, port: u16) -> Result<String> {
        let mut url = if self.has_db_url() {
            Url::parse(&self.db_url).map_err(|e| {
                TunnelError::InvalidConfiguration(format!("Invalid database URL: {}", e))
            })?
        } else {
            self.build_url()?
        };

        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        url.set_host(Some(&host)).map_err(|e| {
            TunnelError::InvalidConfiguration(format!("Invalid host '{}': {}", host, e))
        })?;
        url.set_port(Some(port)).map_err(|_| {
            TunnelError::InvalidConfiguration("Database URL cannot carry a port".to_string())
        })?;

        Ok(url.into())
    }

    fn build_url(&self) -> Result<Url> {
        let invalid = |what: &str| {
            TunnelError::InvalidConfiguration(format!("Cannot encode {} into database URL", what))
        };

        let mut url = Url::parse("postgres://localhost")
            .map_err(|e| TunnelError::InvalidConfiguration(e.to_string()))?;
        url.set_username(&self.user).map_err(|_| invalid("user"))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&self.database);
        url.query_pairs_mut()
            .append_pair("sslmode", self.ssl_mode.as_str());
        Ok(url)
    }
}
