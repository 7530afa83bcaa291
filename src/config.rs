//! Connection knobs passed explicitly into the facade.
//!
//! Nothing here is read from process-wide state; callers (a CLI, a test)
//! build a `ConnectOptions` and hand it to `ConnectionFacade::new`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::database::pool::PoolOptions;

/// How the bastion's host key is checked during the SSH handshake
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept any host key. Compatible with frequently rotated bastion keys,
    /// but provides no authenticity guarantee.
    #[default]
    AcceptAny,
    /// Trust on first use: record unknown hosts, reject changed or revoked keys
    AcceptNew,
    /// Only accept hosts already present in known_hosts
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// SSH connect + authentication budget when the profile sets no timeout
    pub handshake_timeout: Duration,
    /// Per-connection dial budget for the driver connector
    pub dial_timeout: Duration,
    /// Liveness check budget
    pub ping_timeout: Duration,
    /// SSH keepalive interval (None disables keepalives)
    pub keepalive_interval: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
    /// Overrides ~/.ssh/known_hosts
    pub known_hosts_path: Option<PathBuf>,
    /// Interface the port forwarder listens on
    pub forward_bind_host: String,
    /// Preferred local port for the forwarder (None = OS-assigned)
    pub forward_local_port: Option<u16>,
    pub application_name: String,
    /// Limits for the driver pool behind `ConnectionHandle::pool`
    pub pool: PoolOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            host_key_policy: HostKeyPolicy::AcceptAny,
            known_hosts_path: None,
            forward_bind_host: "127.0.0.1".to_string(),
            forward_local_port: None,
            application_name: "pgtunnel".to_string(),
            pool: PoolOptions::default(),
        }
    }
}
