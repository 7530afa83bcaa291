pub mod address;
pub mod error;
pub mod port_forward;
pub mod profile;

pub use address::{host_port, RemoteAddr};
pub use error::{Result, TunnelError};
pub use port_forward::{PortForward, PortForwardStatus};
pub use profile::{Profile, SshSettings, SslMode};
