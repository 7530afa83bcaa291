pub mod auth;
pub mod client;
pub mod known_hosts;
pub mod port_forward;

pub use auth::{AuthMethod, CredentialResolver};
pub use client::TunnelSession;
pub use known_hosts::{HostKeyStatus, KnownHostsFile};
pub use port_forward::{PortForwarder, RelayStats};
