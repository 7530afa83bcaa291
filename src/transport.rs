//! Byte-stream transports shared by the driver connector and the port
//! forwarder: a plain TCP dialer for direct connections and the `Tunnel`
//! abstraction implemented by SSH sessions.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::models::address::RemoteAddr;
use crate::models::error::{Result, TunnelError};

/// Anything the SQL protocol layer (or a relay) can read from and write to.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to a network address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &RemoteAddr) -> Result<BoxedStream>;

    /// Races `dial` against a timer. On expiry the in-flight dial future is
    /// dropped, which cancels it, and `DialTimeout` is returned immediately.
    async fn dial_timeout(&self, target: &RemoteAddr, timeout: Duration) -> Result<BoxedStream> {
        match tokio::time::timeout(timeout, self.dial(target)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Dial to {} timed out after {:?}", target, timeout);
                Err(TunnelError::DialTimeout {
                    target: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// A dialer backed by a long-lived session that must be closed explicitly.
#[async_trait]
pub trait Tunnel: Dialer {
    /// The bastion this tunnel is connected to
    fn endpoint(&self) -> &RemoteAddr;

    fn is_closed(&self) -> bool;

    /// Idempotent; streams opened through the tunnel become invalid.
    async fn close(&self);
}

/// Plain TCP dialer used when no bastion is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &RemoteAddr) -> Result<BoxedStream> {
        let stream = TcpStream::connect(target.to_string())
            .await
            .map_err(|e| TunnelError::DialFailed(target.to_string(), e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", target, e);
        }
        Ok(Box::new(stream))
    }
}

/// Lets a shared tunnel be handed to anything expecting a plain dialer.
#[async_trait]
impl Dialer for Arc<dyn Tunnel> {
    async fn dial(&self, target: &RemoteAddr) -> Result<BoxedStream> {
        (**self).dial(target).await
    }
}
