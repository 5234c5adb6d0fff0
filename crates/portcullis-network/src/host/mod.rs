//! Linux realization of the host capabilities.
//!
//! The NAT network is a bridge, each endpoint a veth pair whose container
//! side is moved into the container's named network namespace, and endpoint
//! policies are enforced with iptables. All configuration goes through a
//! [`CommandRunner`](crate::platform::CommandRunner), so a failed command
//! surfaces as a platform error that [`classify`](crate::platform::classify)
//! understands.

pub mod bridge;
pub mod iface;
pub mod iptables;
pub mod plane;
pub mod runner;
pub mod store;
pub mod veth;

pub use bridge::Bridge;
pub use iface::HostInterfaces;
pub use plane::BridgeControlPlane;
pub use runner::ShellRunner;
pub use store::EndpointStore;
pub use veth::VethPair;

use portcullis_common::PortcullisError;

pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// Report a failed configuration command as a platform failure.
pub(crate) fn platform_error(err: PortcullisError) -> PortcullisError {
    match err {
        PortcullisError::CommandFailed { command, message } => {
            PortcullisError::platform(format!("{command}: {message}"))
        }
        other => other,
    }
}
