use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectOptions;
use crate::models::address::{host_port, RemoteAddr};
use crate::models::error::{Result, TunnelError};
use crate::models::port_forward::{PortForward, PortForwardStatus};
use crate::transport::Tunnel;

/// Consecutive ports tried when a preferred local port is taken
const PORT_FALLBACK_ATTEMPTS: u16 = 20;

/// Byte counters for one local connection and its remote channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub peer: SocketAddr,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

struct RelayCounters {
    peer: SocketAddr,
    to_remote: AtomicU64,
    to_local: AtomicU64,
}

type RelayRegistry = Arc<DashMap<u64, Arc<RelayCounters>>>;

/// Everything the accept loop and its relay tasks share
#[derive(Clone)]
struct RelayContext {
    tunnel: Arc<dyn Tunnel>,
    remote: RemoteAddr,
    dial_timeout: Duration,
    relays: RelayRegistry,
    next_relay_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

/// A local TCP listener that relays every accepted connection through a
/// tunnel to one fixed remote address.
pub struct PortForwarder {
    info: SyncMutex<PortForward>,
    tunnel: Arc<dyn Tunnel>,
    relays: RelayRegistry,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PortForwarder {
    /// Bind the local listener and start accepting connections.
    ///
    /// The listener is bound once and kept for the forwarder's lifetime, so
    /// the reported port cannot be taken by another process in between.
    pub async fn start(
        tunnel: Arc<dyn Tunnel>,
        remote: RemoteAddr,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let listener =
            bind_listener(&options.forward_bind_host, options.forward_local_port).await?;
        let local_port = listener
            .local_addr()
            .map_err(|e| {
                TunnelError::ListenerBindFailed(format!("Failed to get local address: {}", e))
            })?
            .port();

        let info = PortForward::new(options.forward_bind_host.clone(), local_port, remote.clone());
        let shutdown = CancellationToken::new();
        let relays: RelayRegistry = Arc::new(DashMap::new());

        let context = RelayContext {
            tunnel: tunnel.clone(),
            remote,
            dial_timeout: options.dial_timeout,
            relays: relays.clone(),
            next_relay_id: Arc::new(AtomicU64::new(1)),
            shutdown: shutdown.clone(),
        };

        tracing::info!(
            "Port forward {} listening on {} -> {} via {}",
            info.id,
            info.local_address(),
            info.remote,
            tunnel.endpoint()
        );

        let forward_id = info.id.clone();
        let listener_task = tokio::spawn(async move {
            run_listener(listener, context).await;
            tracing::debug!("Port forward {} accept loop exited", forward_id);
        });

        Ok(Self {
            info: SyncMutex::new(info),
            tunnel,
            relays,
            shutdown,
            listener_task: Mutex::new(Some(listener_task)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.info.lock().local_port
    }

    /// `host:port` external processes should connect to
    pub fn local_address(&self) -> String {
        self.info.lock().local_address()
    }

    pub fn info(&self) -> PortForward {
        self.info.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Relay pairs currently open, with their byte counts
    pub fn active_relays(&self) -> Vec<RelayStats> {
        self.relays
            .iter()
            .map(|entry| {
                let counters = entry.value();
                RelayStats {
                    peer: counters.peer,
                    bytes_to_remote: counters.to_remote.load(Ordering::Relaxed),
                    bytes_to_local: counters.to_local.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Close the listener and the owning tunnel. Idempotent.
    ///
    /// Established relay pairs are left to finish on their own: data already
    /// in flight is delivered, and each pair ends when either side reaches
    /// EOF, which closing the tunnel brings about.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();

        let task = self.listener_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Port forward listener task ended abnormally: {}", e);
            }
        }

        let id = {
            let mut info = self.info.lock();
            info.status = PortForwardStatus::Stopped;
            info.id.clone()
        };

        self.tunnel.close().await;
        tracing::info!("Stopped port forward {}", id);
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        // Stops accepting; the tunnel itself is closed by its owner
        self.shutdown.cancel();
    }
}

/// Bind on `host`, either on an OS-assigned port or on `preferred` with
/// fallback to the following ports.
async fn bind_listener(host: &str, preferred: Option<u16>) -> Result<TcpListener> {
    let Some(port) = preferred else {
        return TcpListener::bind(host_port(host, 0)).await.map_err(|e| {
            TunnelError::ListenerBindFailed(format!("Failed to bind {}: {}", host, e))
        });
    };

    let mut last_error = None;
    for offset in 0..PORT_FALLBACK_ATTEMPTS {
        let Some(try_port) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(host_port(host, try_port)).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::info!("Port {} was taken, bound to {} instead", port, try_port);
                }
                return Ok(listener);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(TunnelError::ListenerBindFailed(format!(
        "Failed to bind {} ports {}-{}: {}",
        host,
        port,
        port.saturating_add(PORT_FALLBACK_ATTEMPTS - 1),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Accept until shutdown; each connection gets its own relay task.
async fn run_listener(listener: TcpListener, context: RelayContext) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    continue;
                }
            },
        };

        tracing::debug!("Accepted connection from {}", peer);
        let context = context.clone();
        tokio::spawn(async move {
            handle_connection(socket, peer, context).await;
        });
    }
}

/// Dial the remote end for one local connection and relay until either side
/// finishes. A failed dial only drops this local connection.
async fn handle_connection(local: TcpStream, peer: SocketAddr, context: RelayContext) {
    let remote = match context
        .tunnel
        .dial_timeout(&context.remote, context.dial_timeout)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Dropping connection from {}: {}", peer, e);
            return;
        }
    };

    if let Err(e) = local.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let relay_id = context.next_relay_id.fetch_add(1, Ordering::Relaxed);
    let counters = Arc::new(RelayCounters {
        peer,
        to_remote: AtomicU64::new(0),
        to_local: AtomicU64::new(0),
    });
    context.relays.insert(relay_id, counters.clone());

    let pair = CancellationToken::new();
    let (local_reader, local_writer) = local.into_split();
    let (remote_reader, remote_writer) = tokio::io::split(remote);

    let upstream = tokio::spawn(pump(
        local_reader,
        remote_writer,
        counters.clone(),
        Direction::ToRemote,
        pair.clone(),
    ));
    let downstream = tokio::spawn(pump(
        remote_reader,
        local_writer,
        counters.clone(),
        Direction::ToLocal,
        pair,
    ));

    let _ = tokio::join!(upstream, downstream);
    context.relays.remove(&relay_id);

    tracing::debug!(
        "Relay for {} finished: {} bytes to remote, {} bytes to local",
        peer,
        counters.to_remote.load(Ordering::Relaxed),
        counters.to_local.load(Ordering::Relaxed)
    );
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToRemote,
    ToLocal,
}

/// Copy one direction of a relay pair. EOF or an error on either side ends
/// both directions; bytes already read are always written out first.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counters: Arc<RelayCounters>,
    direction: Direction,
    pair: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = match direction {
        Direction::ToRemote => &counters.to_remote,
        Direction::ToLocal => &counters.to_local,
    };
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = tokio::select! {
            _ = pair.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let err = TunnelError::RelayIo(format!("{:?} read for {}: {}", direction, counters.peer, e));
                    tracing::debug!("{}", err);
                    break;
                }
            },
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            let err = TunnelError::RelayIo(format!("{:?} write for {}: {}", direction, counters.peer, e));
            tracing::debug!("{}", err);
            break;
        }

        counter.fetch_add(n as u64, Ordering::Relaxed);
        tracing::trace!("{:?}: {} bytes for {}", direction, n, counters.peer);
    }

    pair.cancel();
    let _ = writer.shutdown().await;
}
