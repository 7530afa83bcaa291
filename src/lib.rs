//! SSH bastion tunneling for PostgreSQL.
//!
//! `ConnectionFacade::connect` opens a verified in-process driver connection
//! (directly or through a bastion), `ConnectionFacade::expose` publishes the
//! database on a local port for external tools. Both hand back a
//! `ConnectionHandle` whose `close` tears everything down in order.

pub mod config;
pub mod connection;
pub mod database;
pub mod models;
pub mod ssh;
pub mod transport;

pub use config::{ConnectOptions, HostKeyPolicy};
pub use connection::{
    test_connection, ConnectionFacade, ConnectionHandle, ConnectionMode, ConnectionReport,
    ConnectionState, SshTunnelOpener, TunnelOpener,
};
pub use database::{
    CellValue, ConnectionPool, Database, DriverConnector, PgTarget, PoolOptions, PooledDatabase,
};
pub use models::{Profile, RemoteAddr, Result, SshSettings, SslMode, TunnelError};
pub use transport::{BoxedStream, DirectDialer, Dialer, Tunnel};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber, filtered by `RUST_LOG`.
///
/// Embedding applications with their own subscriber can skip this; a second
/// call is a no-op.
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgtunnel=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("pgtunnel logging initialised");
    }
}
