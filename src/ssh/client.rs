use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use russh::client::{self, Config, Handle};
use russh::keys::key;
use russh::Disconnect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectOptions, HostKeyPolicy};
use crate::models::address::RemoteAddr;
use crate::models::error::{Result, TunnelError};
use crate::ssh::auth::AuthMethod;
use crate::ssh::known_hosts::{self, HostKeyVerdict, KnownHostsFile};
use crate::transport::{BoxedStream, Dialer, Tunnel};

/// Handle to observe host key rejections after the SSH handshake.
/// russh takes ownership of `SshHandler`, so the rejection reason is shared
/// through an `Arc` and inspected once `client::connect` has failed.
pub struct HostKeyWatcher(Arc<SyncMutex<Option<String>>>);

impl HostKeyWatcher {
    pub fn check(&self, hostname: &str) -> Option<TunnelError> {
        let reason = self.0.lock().take()?;
        Some(TunnelError::HostKeyRejected {
            hostname: hostname.to_string(),
            reason,
        })
    }
}

/// SSH connection handler applying the configured host key policy.
pub struct SshHandler {
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<KnownHostsFile>,
    rejection: Arc<SyncMutex<Option<String>>>,
}

impl SshHandler {
    pub fn new(
        hostname: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Option<KnownHostsFile>,
    ) -> (Self, HostKeyWatcher) {
        let rejection = Arc::new(SyncMutex::new(None));
        let watcher = HostKeyWatcher(rejection.clone());
        let handler = Self {
            hostname,
            port,
            policy,
            known_hosts,
            rejection,
        };
        (handler, watcher)
    }

    fn reject(&self, reason: String) -> bool {
        tracing::error!(
            "Rejecting host key for {}: {}",
            RemoteAddr::new(self.hostname.clone(), self.port),
            reason
        );
        *self.rejection.lock() = Some(reason);
        false
    }
}

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known_hosts = match (self.policy, &self.known_hosts) {
            (HostKeyPolicy::AcceptAny, _) | (_, None) => {
                tracing::info!(
                    "Accepting {} host key for {}:{} without verification (SHA256:{})",
                    server_public_key.name(),
                    self.hostname,
                    self.port,
                    server_public_key.fingerprint()
                );
                return Ok(true);
            }
            (_, Some(file)) => file,
        };

        let status = match known_hosts.lookup(&self.hostname, self.port, server_public_key) {
            Ok(status) => status,
            Err(e) => return Ok(self.reject(e.to_string())),
        };

        match known_hosts::judge(self.policy, &status) {
            HostKeyVerdict::Accept => {
                tracing::debug!("Host key verified for {}:{}", self.hostname, self.port);
                Ok(true)
            }
            HostKeyVerdict::AcceptAndRecord => {
                tracing::info!(
                    "Unknown host key for {}:{} (SHA256:{}), trusting on first use",
                    self.hostname,
                    self.port,
                    server_public_key.fingerprint()
                );
                if let Err(e) = known_hosts.record(&self.hostname, self.port, server_public_key) {
                    tracing::warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerdict::Reject(reason) => Ok(self.reject(reason)),
        }
    }
}

/// One authenticated SSH connection to a bastion.
///
/// Every dial opens its own `direct-tcpip` channel over the shared transport.
/// Channel opens run concurrently and never wait on each other or on `close`.
pub struct TunnelSession {
    handle: Handle<SshHandler>,
    endpoint: RemoteAddr,
    user: String,
    keepalive: Option<Duration>,
    closed: AtomicBool,
}

impl TunnelSession {
    /// Connect to the bastion and authenticate with the first accepted method.
    ///
    /// `timeout` bounds the TCP connect, key exchange and authentication
    /// together.
    pub async fn open(
        bastion: RemoteAddr,
        user: &str,
        methods: Vec<AuthMethod>,
        timeout: Duration,
        options: &ConnectOptions,
    ) -> Result<Self> {
        if methods.is_empty() {
            return Err(TunnelError::NoAuthMethodAvailable(format!(
                "no authentication methods for {}@{}",
                user, bastion
            )));
        }

        let known_hosts = match options.host_key_policy {
            HostKeyPolicy::AcceptAny => None,
            _ => Some(KnownHostsFile::resolve(options.known_hosts_path.as_deref())?),
        };

        let config = Config {
            keepalive_interval: options.keepalive_interval,
            ..Default::default()
        };

        tracing::info!("Opening SSH tunnel to {} as {}", bastion, user);

        let (handler, watcher) = SshHandler::new(
            bastion.host.clone(),
            bastion.port,
            options.host_key_policy,
            known_hosts,
        );

        let handshake = async {
            let mut handle = client::connect(Arc::new(config), bastion.to_string(), handler)
                .await
                .map_err(|e| {
                    watcher.check(&bastion.host).unwrap_or_else(|| {
                        TunnelError::HandshakeFailed(bastion.to_string(), e.to_string())
                    })
                })?;
            authenticate(&mut handle, &bastion, user, &methods).await?;
            Ok::<_, TunnelError>(handle)
        };

        let handle = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                TunnelError::HandshakeFailed(
                    bastion.to_string(),
                    format!("timed out after {} seconds", timeout.as_secs_f32()),
                )
            })??;

        tracing::info!("SSH tunnel to {} established", bastion);

        Ok(Self {
            handle,
            endpoint: bastion,
            user: user.to_string(),
            keepalive: options.keepalive_interval,
            closed: AtomicBool::new(false),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive
    }

    /// Open a byte stream to `target` as seen from the bastion
    pub async fn dial_remote(&self, target: &RemoteAddr) -> Result<BoxedStream> {
        self.dial(target).await
    }

    pub async fn dial_remote_timeout(
        &self,
        target: &RemoteAddr,
        timeout: Duration,
    ) -> Result<BoxedStream> {
        self.dial_timeout(target, timeout).await
    }
}

#[async_trait]
impl Dialer for TunnelSession {
    async fn dial(&self, target: &RemoteAddr) -> Result<BoxedStream> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed(self.endpoint.to_string()));
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host.clone(), target.port as u32, "127.0.0.1", 0)
            .await;

        // close() may have raced the open
        if self.is_closed() {
            return Err(TunnelError::SessionClosed(self.endpoint.to_string()));
        }

        let channel = channel.map_err(|e| {
            TunnelError::DialFailed(target.to_string(), format!("via {}: {}", self.endpoint, e))
        })?;

        tracing::debug!("Opened channel to {} via {}", target, self.endpoint);
        Ok(Box::new(channel.into_stream()))
    }
}

#[async_trait]
impl Tunnel for TunnelSession {
    fn endpoint(&self) -> &RemoteAddr {
        &self.endpoint
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("Disconnect from {} reported: {}", self.endpoint, e);
        }
        tracing::info!("Closed SSH tunnel to {}", self.endpoint);
    }
}

/// Try each method in order until the server accepts one.
async fn authenticate(
    handle: &mut Handle<SshHandler>,
    bastion: &RemoteAddr,
    user: &str,
    methods: &[AuthMethod],
) -> Result<()> {
    for method in methods {
        tracing::debug!("Trying {} authentication on {}", method.kind(), bastion);

        let accepted = match method {
            AuthMethod::Agent(socket) => authenticate_with_agent(handle, user, socket).await?,
            AuthMethod::PrivateKey { key, .. } => handle
                .authenticate_publickey(user, key.clone())
                .await
                .map_err(|e| TunnelError::HandshakeFailed(bastion.to_string(), e.to_string()))?,
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| TunnelError::HandshakeFailed(bastion.to_string(), e.to_string()))?,
        };

        if accepted {
            tracing::info!("SSH {} authentication succeeded for {}", method.kind(), bastion);
            return Ok(());
        }
        tracing::debug!("{} authentication rejected by {}", method.kind(), bastion);
    }

    Err(TunnelError::AuthRejected {
        host: bastion.to_string(),
        user: user.to_string(),
    })
}

/// Offer every agent identity in turn. Agent-side failures count as a
/// rejection so the next method still gets a chance.
#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<SshHandler>,
    user: &str,
    socket: &std::path::Path,
) -> Result<bool> {
    use russh_keys::agent::client::AgentClient;

    let mut agent = match AgentClient::connect_uds(socket).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::warn!("Failed to connect to ssh-agent at {}: {}", socket.display(), e);
            return Ok(false);
        }
    };

    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(e) => {
            tracing::warn!("Failed to list ssh-agent identities: {}", e);
            return Ok(false);
        }
    };

    for identity in identities {
        let (returned, result) = handle.authenticate_future(user, identity, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => tracing::debug!("ssh-agent signing failed: {}", e),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<SshHandler>,
    _user: &str,
    socket: &std::path::Path,
) -> Result<bool> {
    tracing::warn!("ssh-agent at {} is not supported on this platform", socket.display());
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::load_private_key;
    use crate::ssh::auth::tests::{write_key, PLAIN_ED25519};
    use russh::client::Handler;
    use russh::server::{Auth, Msg, Session};
    use russh::Channel;
    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// In-process bastion: password and public-key auth, and direct-tcpip
    /// channels relayed to loopback targets.
    #[derive(Clone, Default)]
    struct Bastion {
        password: String,
        authorized_key: Option<key::PublicKey>,
        /// Channel opens to this port hang for a few seconds, then fail
        stall_port: Option<u32>,
    }

    #[async_trait]
    impl russh::server::Handler for Bastion {
        type Error = russh::Error;

        async fn auth_password(
            &mut self,
            _user: &str,
            password: &str,
        ) -> std::result::Result<Auth, Self::Error> {
            if !self.password.is_empty() && password == self.password {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }

        async fn auth_publickey(
            &mut self,
            _user: &str,
            public_key: &key::PublicKey,
        ) -> std::result::Result<Auth, Self::Error> {
            let authorized = self
                .authorized_key
                .as_ref()
                .is_some_and(|k| k.fingerprint() == public_key.fingerprint());
            if authorized {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<Msg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut Session,
        ) -> std::result::Result<bool, Self::Error> {
            if self.stall_port == Some(port_to_connect) {
                tokio::time::sleep(Duration::from_secs(3)).await;
                return Ok(false);
            }
            let target = format!("{}:{}", host_to_connect, port_to_connect);
            tokio::spawn(async move {
                let Ok(mut upstream) = TcpStream::connect(target).await else {
                    return;
                };
                let mut stream = channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            });
            Ok(true)
        }
    }

    async fn start_bastion(bastion: Bastion) -> RemoteAddr {
        let config = Arc::new(russh::server::Config {
            keys: vec![KeyPair::generate_ed25519()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = config.clone();
                let handler = bastion.clone();
                tokio::spawn(async move {
                    if let Ok(session) = russh::server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });
        RemoteAddr::new("127.0.0.1", port)
    }

    async fn echo_server() -> RemoteAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        RemoteAddr::new("127.0.0.1", port)
    }

    async fn open_session(bastion: RemoteAddr, methods: Vec<AuthMethod>) -> Result<TunnelSession> {
        TunnelSession::open(
            bastion,
            "deploy",
            methods,
            Duration::from_secs(5),
            &ConnectOptions::default(),
        )
        .await
    }

    fn key_method() -> (AuthMethod, key::PublicKey) {
        let file = write_key(PLAIN_ED25519);
        let path = file.path().to_string_lossy().into_owned();
        let key = load_private_key(&path, "").unwrap();
        let public = key.clone_public_key().unwrap();
        let method = AuthMethod::PrivateKey {
            path,
            key: Arc::new(key),
        };
        (method, public)
    }

    fn server_key() -> key::PublicKey {
        KeyPair::generate_ed25519().clone_public_key().unwrap()
    }

    #[tokio::test]
    async fn test_accept_any_accepts_unknown_key() {
        let (mut handler, watcher) =
            SshHandler::new("bastion".into(), 22, HostKeyPolicy::AcceptAny, None);
        assert!(handler.check_server_key(&server_key()).await.unwrap());
        assert!(watcher.check("bastion").is_none());
    }

    #[tokio::test]
    async fn test_strict_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let file = KnownHostsFile::new(dir.path().join("known_hosts"));
        let (mut handler, watcher) =
            SshHandler::new("bastion".into(), 22, HostKeyPolicy::Strict, Some(file));

        assert!(!handler.check_server_key(&server_key()).await.unwrap());
        assert!(matches!(
            watcher.check("bastion"),
            Some(TunnelError::HostKeyRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_new_records_then_rejects_changed_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let first = server_key();

        let (mut handler, _) = SshHandler::new(
            "bastion".into(),
            2222,
            HostKeyPolicy::AcceptNew,
            Some(KnownHostsFile::new(&path)),
        );
        assert!(handler.check_server_key(&first).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&first.public_key_base64()));

        let (mut handler, watcher) = SshHandler::new(
            "bastion".into(),
            2222,
            HostKeyPolicy::AcceptNew,
            Some(KnownHostsFile::new(&path)),
        );
        assert!(!handler.check_server_key(&server_key()).await.unwrap());
        assert!(watcher.check("bastion").is_some());
    }

    #[tokio::test]
    async fn test_open_requires_methods() {
        let result = TunnelSession::open(
            RemoteAddr::new("127.0.0.1", 22),
            "deploy",
            Vec::new(),
            Duration::from_secs(1),
            &ConnectOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::NoAuthMethodAvailable(_))));
    }

    #[tokio::test]
    async fn test_open_fails_when_peer_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let result = TunnelSession::open(
            RemoteAddr::new("127.0.0.1", port),
            "deploy",
            vec![AuthMethod::Password("pw".into())],
            Duration::from_secs(5),
            &ConnectOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::HandshakeFailed(_, _))));
    }

    #[tokio::test]
    async fn test_open_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let start = Instant::now();
        let result = TunnelSession::open(
            RemoteAddr::new("127.0.0.1", port),
            "deploy",
            vec![AuthMethod::Password("pw".into())],
            Duration::from_millis(200),
            &ConnectOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(TunnelError::HandshakeFailed(_, _))));
        assert!(start.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn test_publickey_auth_against_bastion() {
        let (method, public) = key_method();
        let bastion = start_bastion(Bastion {
            authorized_key: Some(public),
            ..Default::default()
        })
        .await;

        let session = open_session(bastion.clone(), vec![method]).await.unwrap();
        assert_eq!(session.endpoint(), &bastion);
        assert_eq!(session.user(), "deploy");
        session.close().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_key_falls_through_to_password() {
        let (method, _) = key_method();
        let bastion = start_bastion(Bastion {
            password: "s3cret".into(),
            ..Default::default()
        })
        .await;

        let session = open_session(bastion, vec![method, AuthMethod::Password("s3cret".into())])
            .await
            .unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let bastion = start_bastion(Bastion {
            password: "s3cret".into(),
            ..Default::default()
        })
        .await;

        let result = open_session(bastion, vec![AuthMethod::Password("guess".into())]).await;
        assert!(matches!(result, Err(TunnelError::AuthRejected { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_dials_then_close_invalidates_all() {
        let echo = echo_server().await;
        let bastion = start_bastion(Bastion {
            password: "s3cret".into(),
            ..Default::default()
        })
        .await;
        let session = open_session(bastion, vec![AuthMethod::Password("s3cret".into())])
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            session.dial_remote(&echo),
            session.dial_remote(&echo),
            session.dial_remote(&echo)
        );
        let mut streams = vec![a.unwrap(), b.unwrap(), c.unwrap()];

        for (i, stream) in streams.iter_mut().enumerate() {
            let message = format!("channel {}", i);
            stream.write_all(message.as_bytes()).await.unwrap();
            let mut reply = vec![0u8; message.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, message.as_bytes());
        }

        session.close().await;

        for stream in streams.iter_mut() {
            let mut buf = [0u8; 8];
            let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }
        assert!(matches!(
            session.dial_remote(&echo).await,
            Err(TunnelError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_pending_channel_open() {
        let bastion = start_bastion(Bastion {
            password: "s3cret".into(),
            stall_port: Some(1),
            ..Default::default()
        })
        .await;
        let session = Arc::new(
            open_session(bastion, vec![AuthMethod::Password("s3cret".into())])
                .await
                .unwrap(),
        );

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.dial_remote(&RemoteAddr::new("127.0.0.1", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        session.close().await;
        assert!(start.elapsed() < Duration::from_millis(500));

        let start = Instant::now();
        let result = session.dial_remote(&RemoteAddr::new("127.0.0.1", 2)).await;
        assert!(matches!(result, Err(TunnelError::SessionClosed(_))));
        assert!(start.elapsed() < Duration::from_millis(500));

        pending.abort();
    }
}
