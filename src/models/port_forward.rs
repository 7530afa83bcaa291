use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::address::{connectable_host, host_port, RemoteAddr};

/// Status of a port forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortForwardStatus {
    Active,
    Stopped,
}

/// Snapshot of a local listener relaying through a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    /// Unique identifier for this port forward
    pub id: String,
    /// Address the local listener is bound to
    pub bind_host: String,
    /// Port the listener actually bound
    pub local_port: u16,
    /// Destination as seen from the bastion
    pub remote: RemoteAddr,
    /// Active until `PortForwarder::stop`
    pub status: PortForwardStatus,
    /// When this forward was created
    pub created_at: String,
}

impl PortForward {
    pub fn new(bind_host: String, local_port: u16, remote: RemoteAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bind_host,
            local_port,
            remote,
            status: PortForwardStatus::Active,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Address external processes should connect to
    pub fn local_address(&self) -> String {
        host_port(connectable_host(&self.bind_host), self.local_port)
    }
}
