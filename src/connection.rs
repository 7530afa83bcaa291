//! Connection facade: picks direct or tunneled access for a profile, owns
//! the tunnel lifecycle, and hands back one handle with a single teardown.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConnectOptions;
use crate::database::{ConnectionPool, Database, DriverConnector, PgTarget, PooledDatabase};
use crate::models::address::{connectable_host, host_port, RemoteAddr};
use crate::models::error::{Result, TunnelError};
use crate::models::profile::{Profile, SshSettings};
use crate::ssh::auth::{AuthMethod, CredentialResolver};
use crate::ssh::client::TunnelSession;
use crate::ssh::port_forward::PortForwarder;
use crate::transport::{DirectDialer, Dialer, Tunnel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unconnected,
    Authenticating,
    Dialing,
    Verifying,
    Ready,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Direct,
    Tunneled,
}

/// Opens an authenticated tunnel to a profile's bastion.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(
        &self,
        ssh: &SshSettings,
        methods: Vec<AuthMethod>,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Tunnel>>;
}

/// Opens real SSH sessions with russh
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTunnelOpener;

#[async_trait]
impl TunnelOpener for SshTunnelOpener {
    async fn open(
        &self,
        ssh: &SshSettings,
        methods: Vec<AuthMethod>,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Tunnel>> {
        let timeout = ssh.timeout().unwrap_or(options.handshake_timeout);
        let session =
            TunnelSession::open(ssh.bastion_address(), &ssh.user, methods, timeout, options)
                .await?;
        Ok(Arc::new(session))
    }
}

pub struct ConnectionFacade {
    options: ConnectOptions,
    resolver: CredentialResolver,
    opener: Arc<dyn TunnelOpener>,
}

impl ConnectionFacade {
    /// Real SSH, with the agent discovered through `SSH_AUTH_SOCK`
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            resolver: CredentialResolver::from_env(),
            opener: Arc::new(SshTunnelOpener),
        }
    }

    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_opener(mut self, opener: Arc<dyn TunnelOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Open a verified driver connection for in-process queries.
    pub async fn connect(&self, profile: &Profile) -> Result<ConnectionHandle> {
        let target = PgTarget::from_profile(profile, &self.options.application_name)?;
        let mut handle = ConnectionHandle::new(mode_for(profile), target.address().clone());

        match self.build_connected(profile, target, &mut handle).await {
            Ok(()) => {
                handle.set_state(ConnectionState::Ready);
                Ok(handle)
            }
            Err(e) => Err(handle.fail(e).await),
        }
    }

    async fn build_connected(
        &self,
        profile: &Profile,
        target: PgTarget,
        handle: &mut ConnectionHandle,
    ) -> Result<()> {
        let dialer: Arc<dyn Dialer> = if profile.ssh.enabled {
            handle.set_state(ConnectionState::Authenticating);
            let tunnel = self.open_tunnel(&profile.ssh).await?;
            handle.tunnel = Some(tunnel.clone());
            Arc::new(tunnel) as Arc<dyn Dialer>
        } else {
            Arc::new(DirectDialer) as Arc<dyn Dialer>
        };

        handle.set_state(ConnectionState::Dialing);
        let connector = DriverConnector::new(dialer, target, self.options.dial_timeout);
        self.verify(connector, handle).await
    }

    /// Open the first pooled connection, ping it and leave it idle in the pool.
    async fn verify(&self, connector: DriverConnector, handle: &mut ConnectionHandle) -> Result<()> {
        let pool = handle.pool.insert(ConnectionPool::new(
            connector.clone(),
            &self.options.pool,
            self.options.ping_timeout,
        )?);
        let database = pool.get().await?;

        handle.set_state(ConnectionState::Verifying);
        database.ping(self.options.ping_timeout).await?;
        drop(database);

        handle.connector = Some(connector);
        Ok(())
    }

    /// Make the database reachable for an external process. Tunneled
    /// profiles get a local forwarded port; direct profiles report the
    /// database's own address.
    pub async fn expose(&self, profile: &Profile) -> Result<ConnectionHandle> {
        let target = PgTarget::from_profile(profile, &self.options.application_name)?;
        let mut handle = ConnectionHandle::new(mode_for(profile), target.address().clone());

        match self.build_exposed(profile, target, &mut handle).await {
            Ok(()) => {
                handle.set_state(ConnectionState::Ready);
                Ok(handle)
            }
            Err(e) => Err(handle.fail(e).await),
        }
    }

    async fn build_exposed(
        &self,
        profile: &Profile,
        target: PgTarget,
        handle: &mut ConnectionHandle,
    ) -> Result<()> {
        let connector = if profile.ssh.enabled {
            handle.set_state(ConnectionState::Authenticating);
            let tunnel = self.open_tunnel(&profile.ssh).await?;
            handle.tunnel = Some(tunnel.clone());

            handle.set_state(ConnectionState::Dialing);
            let forwarder =
                PortForwarder::start(tunnel, target.address().clone(), &self.options).await?;
            let local = RemoteAddr::new(
                connectable_host(&self.options.forward_bind_host),
                forwarder.local_port(),
            );
            handle.local_address = Some(forwarder.local_address());
            handle.dsn = Some(profile.dsn_for(&local.host, local.port)?);
            handle.forwarder = Some(forwarder);

            DriverConnector::new(Arc::new(DirectDialer), target, self.options.dial_timeout)
                .with_dial_address(local)
        } else {
            handle.set_state(ConnectionState::Dialing);
            let address = target.address();
            handle.local_address = Some(host_port(&address.host, address.port));
            handle.dsn = Some(profile.dsn()?);
            DriverConnector::new(Arc::new(DirectDialer), target, self.options.dial_timeout)
        };

        // Verify through the same path the external tool will use
        self.verify(connector, handle).await
    }

    async fn open_tunnel(&self, ssh: &SshSettings) -> Result<Arc<dyn Tunnel>> {
        let methods = self.resolver.resolve(ssh)?;
        tracing::debug!(
            "Resolved SSH methods for {}: {:?}",
            ssh.bastion_address(),
            methods.iter().map(|m| m.kind()).collect::<Vec<_>>()
        );
        self.opener.open(ssh, methods, &self.options).await
    }
}

fn mode_for(profile: &Profile) -> ConnectionMode {
    if profile.ssh.enabled {
        ConnectionMode::Tunneled
    } else {
        ConnectionMode::Direct
    }
}

/// Everything one logical connection owns. `close` releases the driver
/// pool, then the forwarder, then the tunnel.
pub struct ConnectionHandle {
    mode: ConnectionMode,
    state: ConnectionState,
    database_address: RemoteAddr,
    pool: Option<ConnectionPool>,
    connector: Option<DriverConnector>,
    forwarder: Option<PortForwarder>,
    tunnel: Option<Arc<dyn Tunnel>>,
    local_address: Option<String>,
    dsn: Option<String>,
}

impl ConnectionHandle {
    fn new(mode: ConnectionMode, database_address: RemoteAddr) -> Self {
        Self {
            mode,
            state: ConnectionState::Unconnected,
            database_address,
            pool: None,
            connector: None,
            forwarder: None,
            tunnel: None,
            local_address: None,
            dsn: None,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        tracing::debug!(
            "Connection to {}: {:?} -> {:?}",
            self.database_address,
            self.state,
            state
        );
        self.state = state;
    }

    async fn fail(&mut self, error: TunnelError) -> TunnelError {
        tracing::warn!("Connection to {} failed: {}", self.database_address, error);
        self.release().await;
        self.set_state(ConnectionState::Failed);
        error
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The database as addressed from the bastion (or directly)
    pub fn database_address(&self) -> &RemoteAddr {
        &self.database_address
    }

    /// Driver pool over this handle's path. Holds the connection verified
    /// during `connect` or `expose`.
    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    /// Check a driver connection out of the pool.
    pub async fn database(&self) -> Result<PooledDatabase> {
        match (&self.pool, self.state) {
            (Some(pool), ConnectionState::Ready) => pool.get().await,
            _ => Err(TunnelError::SessionClosed(self.database_address.to_string())),
        }
    }

    /// `host:port` for external processes, set by `expose`
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// Connection URL pointing at `local_address`, set by `expose`
    pub fn dsn(&self) -> Option<&str> {
        self.dsn.as_deref()
    }

    pub fn forwarder(&self) -> Option<&PortForwarder> {
        self.forwarder.as_ref()
    }

    /// Open a dedicated driver connection over the same path, outside the pool.
    pub async fn open_driver_connection(&self) -> Result<Database> {
        match (&self.connector, self.state) {
            (Some(connector), ConnectionState::Ready) => connector.connect().await,
            _ => Err(TunnelError::SessionClosed(self.database_address.to_string())),
        }
    }

    /// Release everything this handle owns. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.release().await;
        self.set_state(ConnectionState::Closed);
    }

    async fn release(&mut self) {
        self.connector = None;
        if let Some(pool) = self.pool.take() {
            pool.close();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop().await;
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // Driver connections and forwarders wind down on drop; the tunnel
        // needs an async close.
        let Some(tunnel) = self.tunnel.take() else {
            return;
        };
        if tunnel.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("Closing tunnel to {} on drop", tunnel.endpoint());
                runtime.spawn(async move { tunnel.close().await });
            }
            Err(_) => {
                tracing::warn!(
                    "Tunnel to {} dropped outside a runtime without close()",
                    tunnel.endpoint()
                );
            }
        }
    }
}

/// Outcome of `test_connection`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub mode: ConnectionMode,
    pub database: String,
    pub elapsed: Duration,
}

/// Connect, verify and close, reporting how the database was reached.
pub async fn test_connection(profile: &Profile, options: ConnectOptions) -> Result<ConnectionReport> {
    run_connection_test(&ConnectionFacade::new(options), profile).await
}

async fn run_connection_test(facade: &ConnectionFacade, profile: &Profile) -> Result<ConnectionReport> {
    let start = Instant::now();
    let mut handle = facade.connect(profile).await?;
    let report = ConnectionReport {
        mode: handle.mode(),
        database: handle.database_address().to_string(),
        elapsed: start.elapsed(),
    };
    handle.close().await;

    tracing::info!(
        "Connection test to {} succeeded ({:?}, {}ms)",
        report.database,
        report.mode,
        report.elapsed.as_millis()
    );
    Ok(report)
}
