use std::sync::Arc;
use std::time::Duration;

use native_tls::TlsConnector as NativeTlsConnector;
use postgres_native_tls::TlsConnector;
use tokio_postgres::config::{Host, SslMode as DriverSslMode};
use tokio_postgres::{Config, NoTls};
use url::Url;

use crate::database::Database;
use crate::models::address::RemoteAddr;
use crate::models::error::{Result, TunnelError};
use crate::models::profile::{Profile, SslMode, DEFAULT_DB_PORT};
use crate::transport::Dialer;

/// Where and how to start a PostgreSQL session, resolved from a profile.
#[derive(Clone)]
pub struct PgTarget {
    config: Config,
    address: RemoteAddr,
    ssl_mode: SslMode,
}

impl PgTarget {
    /// Build the driver configuration from `db_url` when set, otherwise from
    /// the discrete profile fields.
    pub fn from_profile(profile: &Profile, application_name: &str) -> Result<Self> {
        let (mut config, ssl_mode) = if profile.has_db_url() {
            parse_db_url(&profile.db_url)?
        } else {
            let mut config = Config::new();
            config
                .user(&profile.user)
                .dbname(&profile.database)
                .host(if profile.host.is_empty() {
                    "localhost"
                } else {
                    &profile.host
                })
                .port(profile.port());
            if !profile.password.is_empty() {
                config.password(&profile.password);
            }
            (config, profile.ssl_mode)
        };

        config.application_name(application_name);
        config.ssl_mode(match ssl_mode {
            SslMode::Disable => DriverSslMode::Disable,
            SslMode::Prefer => DriverSslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => DriverSslMode::Require,
        });

        let address = target_address(&config)?;
        Ok(Self {
            config,
            address,
            ssl_mode,
        })
    }

    /// The database server as seen from the dialer
    pub fn address(&self) -> &RemoteAddr {
        &self.address
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// TLS connector for this target; the server name is always the
    /// database host, never the dialer's endpoint.
    fn tls_connector(&self) -> Result<TlsConnector> {
        let mut builder = NativeTlsConnector::builder();
        match self.ssl_mode {
            SslMode::Disable | SslMode::Prefer | SslMode::Require => {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyFull => {}
        }
        let connector = builder.build().map_err(|e| TunnelError::Database {
            message: format!("Failed to initialise TLS: {}", e),
        })?;
        Ok(TlsConnector::new(connector, &self.address.host))
    }
}

impl std::fmt::Debug for PgTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PgTarget")
            .field("address", &self.address)
            .field("ssl_mode", &self.ssl_mode)
            .field("user", &self.config.get_user())
            .finish()
    }
}

/// `tokio_postgres` rejects the verify-* sslmodes, so the mode is lifted
/// out of the URL before the driver parses it.
fn parse_db_url(db_url: &str) -> Result<(Config, SslMode)> {
    let mut url = Url::parse(db_url)
        .map_err(|e| TunnelError::InvalidConfiguration(format!("Invalid database URL: {}", e)))?;

    let mut ssl_mode = SslMode::Disable;
    let mut kept = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslmode" {
            ssl_mode = value.parse()?;
        } else {
            kept.push((key.into_owned(), value.into_owned()));
        }
    }

    url.set_query(None);
    if !kept.is_empty() {
        url.query_pairs_mut().extend_pairs(kept);
    }

    let config = url
        .as_str()
        .parse::<Config>()
        .map_err(|e| TunnelError::InvalidConfiguration(format!("Invalid database URL: {}", e)))?;
    Ok((config, ssl_mode))
}

fn target_address(config: &Config) -> Result<RemoteAddr> {
    let host = match config.get_hosts().first() {
        Some(Host::Tcp(host)) => host.clone(),
        None => "localhost".to_string(),
        #[allow(unreachable_patterns)]
        Some(_) => {
            return Err(TunnelError::InvalidConfiguration(
                "Unix socket hosts cannot be reached through a dialer".to_string(),
            ))
        }
    };
    let port = config.get_ports().first().copied().unwrap_or(DEFAULT_DB_PORT);
    Ok(RemoteAddr::new(host, port))
}

/// Opens driver connections over streams produced by a `Dialer`.
///
/// Every `connect` dials once with a bounded timeout and runs the startup
/// handshake over the returned stream. Errors are returned as-is; retrying
/// is the caller's decision.
#[derive(Clone)]
pub struct DriverConnector {
    dialer: Arc<dyn Dialer>,
    target: PgTarget,
    dial_address: RemoteAddr,
    dial_timeout: Duration,
}

impl DriverConnector {
    pub fn new(dialer: Arc<dyn Dialer>, target: PgTarget, dial_timeout: Duration) -> Self {
        let dial_address = target.address.clone();
        Self {
            dialer,
            target,
            dial_address,
            dial_timeout,
        }
    }

    /// Dial `address` instead of the database's own address while keeping
    /// the database host for TLS, e.g. a forwarded local port.
    pub fn with_dial_address(mut self, address: RemoteAddr) -> Self {
        self.dial_address = address;
        self
    }

    pub fn target(&self) -> &PgTarget {
        &self.target
    }

    pub fn dial_address(&self) -> &RemoteAddr {
        &self.dial_address
    }

    pub async fn connect(&self) -> Result<Database> {
        let stream = self
            .dialer
            .dial_timeout(&self.dial_address, self.dial_timeout)
            .await?;

        let label = self.target.address.to_string();
        tracing::debug!(
            "Starting PostgreSQL session with {} over {} (sslmode={})",
            label,
            self.dial_address,
            self.target.ssl_mode.as_str()
        );

        match self.target.ssl_mode {
            SslMode::Disable => {
                let connect: std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send + '_>> =
                    Box::pin(self.target.config.connect_raw(stream, NoTls));
                let (client, connection) = connect.await?;
                Ok(Database::spawn(client, connection, label))
            }
            _ => {
                let tls = self.target.tls_connector()?;
                let connect: std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send + '_>> =
                    Box::pin(self.target.config.connect_raw(stream, tls));
                let (client, connection) = connect.await?;
                Ok(Database::spawn(client, connection, label))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DirectDialer;

    fn profile() -> Profile {
        Profile {
            user: "postgres".into(),
            password: "secret".into(),
            host: "10.0.0.5".into(),
            port: 6543,
            database: "app".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_from_fields() {
        let target = PgTarget::from_profile(&profile(), "pgtunnel").unwrap();
        assert_eq!(target.address(), &RemoteAddr::new("10.0.0.5", 6543));
        assert_eq!(target.ssl_mode(), SslMode::Disable);
        assert_eq!(target.config().get_dbname(), Some("app"));
        assert_eq!(target.config().get_application_name(), Some("pgtunnel"));
        assert_eq!(target.config().get_password(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_target_from_db_url_with_verify_mode() {
        let mut profile = profile();
        profile.db_url =
            "postgres://admin:pw@db.internal:5433/prod?sslmode=verify-full&connect_timeout=5"
                .into();

        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        assert_eq!(target.address(), &RemoteAddr::new("db.internal", 5433));
        assert_eq!(target.ssl_mode(), SslMode::VerifyFull);
        assert_eq!(target.config().get_user(), Some("admin"));
        assert_eq!(target.config().get_ssl_mode(), DriverSslMode::Require);
        assert_eq!(
            target.config().get_connect_timeout(),
            Some(&Duration::from_secs(5))
        );
    }

    #[test]
    fn test_db_url_defaults_port() {
        let mut profile = profile();
        profile.db_url = "postgres://admin@db.internal/prod".into();
        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        assert_eq!(target.address(), &RemoteAddr::new("db.internal", 5432));
    }

    #[test]
    fn test_bad_sslmode_rejected() {
        let mut profile = profile();
        profile.db_url = "postgres://admin@db.internal/prod?sslmode=sometimes".into();
        assert!(matches!(
            PgTarget::from_profile(&profile, "pgtunnel"),
            Err(TunnelError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let target = PgTarget::from_profile(&profile(), "pgtunnel").unwrap();
        assert!(!format!("{:?}", target).contains("secret"));
    }

    #[tokio::test]
    async fn test_connect_surfaces_dial_failure() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut profile = profile();
        profile.host = "127.0.0.1".into();
        profile.port = port;

        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        let connector = DriverConnector::new(Arc::new(DirectDialer), target, Duration::from_secs(2));
        assert!(matches!(
            connector.connect().await,
            Err(TunnelError::DialFailed(_, _))
        ));
    }

    #[tokio::test]
    async fn test_connect_surfaces_protocol_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut profile = profile();
        profile.host = "127.0.0.1".into();
        profile.port = port;

        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        let connector = DriverConnector::new(Arc::new(DirectDialer), target, Duration::from_secs(2));
        assert!(matches!(
            connector.connect().await,
            Err(TunnelError::Database { .. })
        ));
    }
}
