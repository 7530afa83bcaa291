//! Driver connection pool over a `DriverConnector`.
//!
//! Every pooled connection is dialed through the connector, so on the
//! tunneled path each one rides its own channel of the shared SSH session.

use deadpool::managed::{self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::database::{Database, DriverConnector};
use crate::models::error::{Result, TunnelError};

/// Sizing and aging limits for the driver pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Upper bound on open connections, idle or in use
    pub max_open: usize,
    /// Idle connections kept warm; extras are closed by the reaper
    pub max_idle: usize,
    /// Idle connections unused this long are closed
    pub max_idle_time: Duration,
    /// Connections older than this are replaced
    pub max_lifetime: Duration,
    /// How long `get` waits for a free slot
    pub acquire_timeout: Duration,
    /// How often idle connections are reaped
    pub reap_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_open: 5,
            max_idle: 2,
            max_idle_time: Duration::from_secs(2 * 60),
            max_lifetime: Duration::from_secs(10 * 60),
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// deadpool manager minting `Database`s through a connector
pub struct DriverManager {
    connector: DriverConnector,
    max_lifetime: Duration,
    ping_timeout: Duration,
}

impl managed::Manager for DriverManager {
    type Type = Database;
    type Error = TunnelError;

    async fn create(&self) -> std::result::Result<Database, TunnelError> {
        self.connector.connect().await
    }

    async fn recycle(&self, db: &mut Database, metrics: &Metrics) -> RecycleResult<TunnelError> {
        if db.is_closed() {
            return Err(RecycleError::Message("connection closed".to_string().into()));
        }
        if metrics.age() > self.max_lifetime {
            return Err(RecycleError::Message(
                format!("connection older than {:?}", self.max_lifetime).into(),
            ));
        }
        db.ping(self.ping_timeout).await.map_err(RecycleError::Backend)
    }
}

/// A connection checked out of the pool; returned to it on drop
pub type PooledDatabase = Object<DriverManager>;

pub struct ConnectionPool {
    pool: Pool<DriverManager>,
    label: String,
    reaper: CancellationToken,
}

impl ConnectionPool {
    /// Build the pool and start its idle reaper. No connection is opened
    /// until the first `get`.
    pub fn new(
        connector: DriverConnector,
        options: &PoolOptions,
        ping_timeout: Duration,
    ) -> Result<Self> {
        let label = connector.target().address().to_string();
        let manager = DriverManager {
            connector,
            max_lifetime: options.max_lifetime,
            ping_timeout,
        };

        let pool = Pool::builder(manager)
            .max_size(options.max_open.max(1))
            .wait_timeout(Some(options.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                TunnelError::InvalidConfiguration(format!("Failed to build connection pool: {}", e))
            })?;

        let reaper = CancellationToken::new();
        tokio::spawn(run_reaper(
            pool.clone(),
            options.clone(),
            reaper.clone(),
            label.clone(),
        ));

        tracing::debug!(
            "Connection pool for {} ready (max {} open, {} idle)",
            label,
            options.max_open,
            options.max_idle
        );

        Ok(Self {
            pool,
            label,
            reaper,
        })
    }

    /// Check out a connection, reusing an idle one when it still answers.
    pub async fn get(&self) -> Result<PooledDatabase> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            PoolError::Closed => TunnelError::SessionClosed(self.label.clone()),
            other => TunnelError::Database {
                message: format!("Connection pool for {}: {}", self.label, other),
            },
        })
    }

    /// Connections currently open, idle or in use
    pub fn size(&self) -> usize {
        self.pool.status().size
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close idle connections and refuse new checkouts. Connections still
    /// checked out close when dropped.
    pub fn close(&self) {
        self.reaper.cancel();
        self.pool.close();
        tracing::debug!("Connection pool for {} closed", self.label);
    }

    /// Apply the idle and lifetime limits now.
    pub fn reap(&self, options: &PoolOptions) {
        reap_idle(&self.pool, options, &self.label);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

async fn run_reaper(
    pool: Pool<DriverManager>,
    options: PoolOptions,
    shutdown: CancellationToken,
    label: String,
) {
    let mut interval = tokio::time::interval(options.reap_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => reap_idle(&pool, &options, &label),
        }
    }
}

/// Close idle connections past their idle time or lifetime, then trim the
/// idle set down to `max_idle`.
fn reap_idle(pool: &Pool<DriverManager>, options: &PoolOptions, label: &str) {
    let kept = Cell::new(0usize);
    let before = pool.status().size;
    pool.retain(|_, metrics: Metrics| {
        let keep = metrics.last_used() < options.max_idle_time
            && metrics.age() < options.max_lifetime
            && kept.get() < options.max_idle;
        if keep {
            kept.set(kept.get() + 1);
        }
        keep
    });
    let after = pool.status().size;
    if after < before {
        tracing::debug!("Closed {} idle connections to {}", before - after, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fake_server;
    use crate::database::PgTarget;
    use crate::models::profile::Profile;
    use crate::transport::mock::LoopbackTunnel;
    use crate::transport::{Dialer, Tunnel};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    async fn pool_with(options: PoolOptions) -> (ConnectionPool, Arc<LoopbackTunnel>) {
        let address = fake_server::start(true).await;
        let profile = Profile {
            user: "postgres".into(),
            host: address.host.clone(),
            port: address.port,
            database: "app".into(),
            ..Default::default()
        };
        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        let tunnel = LoopbackTunnel::new(0);
        let connector = DriverConnector::new(
            tunnel.clone() as Arc<dyn Dialer>,
            target,
            Duration::from_secs(2),
        );
        let pool = ConnectionPool::new(connector, &options, Duration::from_millis(500)).unwrap();
        (pool, tunnel)
    }

    #[test]
    fn test_default_limits() {
        let options = PoolOptions::default();
        assert_eq!(options.max_open, 5);
        assert_eq!(options.max_idle, 2);
        assert_eq!(options.max_idle_time, Duration::from_secs(120));
        assert_eq!(options.max_lifetime, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let (pool, tunnel) = pool_with(PoolOptions::default()).await;

        let first = pool.get().await.unwrap();
        first.ping(Duration::from_secs(1)).await.unwrap();
        drop(first);

        let second = pool.get().await.unwrap();
        second.ping(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tunnel.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);
        pool.close();
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_open_separate_connections() {
        let (pool, tunnel) = pool_with(PoolOptions::default()).await;

        let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        for db in [&a, &b, &c] {
            db.ping(Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(tunnel.dials.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 3);
        pool.close();
    }

    #[tokio::test]
    async fn test_max_open_bounds_checkouts() {
        let (pool, _tunnel) = pool_with(PoolOptions {
            max_open: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .await;

        let held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(TunnelError::Database { .. })));
        drop(held);
        assert!(pool.get().await.is_ok());
        pool.close();
    }

    #[tokio::test]
    async fn test_reap_trims_idle_set() {
        let options = PoolOptions::default();
        let (pool, _tunnel) = pool_with(options.clone()).await;

        let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
        drop((a.unwrap(), b.unwrap(), c.unwrap()));
        assert_eq!(pool.size(), 3);

        pool.reap(&options);
        assert_eq!(pool.size(), options.max_idle);

        pool.reap(&PoolOptions {
            max_idle_time: Duration::ZERO,
            ..options
        });
        assert_eq!(pool.size(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let (pool, _tunnel) = pool_with(PoolOptions::default()).await;
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.get().await, Err(TunnelError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_unchanged() {
        let (pool, tunnel) = pool_with(PoolOptions::default()).await;
        tunnel.close().await;
        assert!(matches!(pool.get().await, Err(TunnelError::SessionClosed(_))));
        pool.close();
    }
}
