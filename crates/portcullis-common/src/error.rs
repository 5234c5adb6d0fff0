//! Common error types for portcullis.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PortcullisError`].
pub type PortcullisResult<T> = Result<T, PortcullisError>;

/// Errors raised while provisioning container networking.
#[derive(Error, Diagnostic, Debug)]
pub enum PortcullisError {
    /// More ingress rules than the platform can map.
    #[error("invalid number of port mappings: {count}")]
    #[diagnostic(
        code(portcullis::validation::port_mappings),
        help("At most 2 ingress rules are supported per container")
    )]
    TooManyPortMappings {
        /// Number of ingress rules requested.
        count: usize,
    },

    /// Egress rule protocol outside the known set.
    #[error("invalid protocol: {value}")]
    #[diagnostic(code(portcullis::validation::protocol))]
    InvalidProtocol {
        /// The raw protocol value.
        value: u8,
    },

    /// Explicit MTU above the supported maximum.
    #[error("invalid mtu specified: {mtu}")]
    #[diagnostic(
        code(portcullis::validation::mtu),
        help("Use a value between 1 and 1500, or 0 to inherit the adapter MTU")
    )]
    InvalidMtu {
        /// The rejected MTU.
        mtu: u32,
    },

    /// Address range whose start lies after its end.
    #[error("invalid ip range: {start}-{end}")]
    #[diagnostic(code(portcullis::validation::ip_range))]
    InvalidIpRange {
        /// Range start.
        start: String,
        /// Range end.
        end: String,
    },

    /// Port range whose start lies after its end.
    #[error("invalid port range: {start}-{end}")]
    #[diagnostic(
        code(portcullis::validation::port_range),
        help("Give both start and end; use the same port twice for a single port")
    )]
    InvalidPortRange {
        /// Range start.
        start: u16,
        /// Range end.
        end: u16,
    },

    /// Invalid container handle format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(portcullis::validation::container_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// The shared network exists but disagrees with the desired configuration.
    #[error(
        "network {name} already exists with subnets [{existing}], wanted {subnet} via {gateway}"
    )]
    #[diagnostic(
        code(portcullis::network::conflict),
        help("Delete the existing network or change network_name in the config")
    )]
    NetworkConflict {
        /// Network name.
        name: String,
        /// Existing subnets rendered as `prefix via gateway`.
        existing: String,
        /// Desired subnet.
        subnet: String,
        /// Desired gateway.
        gateway: String,
    },

    /// The shared network could not be resolved after repeated attempts.
    #[error("could not load nat network: {name}")]
    #[diagnostic(code(portcullis::network::unavailable))]
    NatNetworkUnavailable {
        /// Network name.
        name: String,
    },

    /// Literal failure reported by the host network control plane.
    #[error("{message}")]
    #[diagnostic(code(portcullis::platform))]
    Platform {
        /// The platform's message, unmodified.
        message: String,
    },

    /// The port allocator failed.
    #[error("{operation}: {message}")]
    #[diagnostic(code(portcullis::ports::allocation))]
    PortAllocation {
        /// Allocator step that failed.
        operation: String,
        /// Underlying cause.
        message: String,
    },

    /// No free port is left in the managed range.
    #[error("port pool exhausted")]
    #[diagnostic(
        code(portcullis::ports::exhausted),
        help("Release ports from stopped containers or raise port_range_capacity")
    )]
    PortPoolExhausted,

    /// A network configuration command failed.
    #[error("running '{command}' failed: {message}")]
    #[diagnostic(code(portcullis::command))]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Exit status and stderr.
        message: String,
    },

    /// Several independent steps failed.
    #[error("{}", join_messages(.0))]
    #[diagnostic(code(portcullis::combined))]
    Combined(Vec<PortcullisError>),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(portcullis::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(portcullis::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(portcullis::serialization))]
    Serialization(String),
}

impl PortcullisError {
    /// Build a platform error from the control plane's message.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }
}

fn join_messages(errors: &[PortcullisError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for PortcullisError {
    fn from(err: serde_json::Error) -> Self {
        PortcullisError::Serialization(err.to_string())
    }
}
