use serde::{Deserialize, Serialize};
use std::fmt;

/// Format a host:port pair, bracketing IPv6 addresses to avoid ambiguity.
pub fn host_port(hostname: &str, port: u16) -> String {
    if hostname.contains(':') && !hostname.starts_with('[') {
        format!("[{}]:{}", hostname, port)
    } else {
        format!("{}:{}", hostname, port)
    }
}

/// Host a local client should dial to reach a listener bound on `bind_host`.
/// Wildcard binds are reached over loopback.
pub fn connectable_host(bind_host: &str) -> &str {
    match bind_host.trim_start_matches('[').trim_end_matches(']') {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        _ => bind_host,
    }
}

/// A host and port reachable from somewhere: the bastion from here, or a
/// database from the bastion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl RemoteAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&host_port(&self.host, self.port))
    }
}
