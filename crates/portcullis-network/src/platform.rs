//! Capabilities consumed from the host.
//!
//! Everything that touches host state goes through one of the traits in this
//! module: the virtual network control plane, the host port pool, interface
//! lookup and the configuration command runner. The managers only ever see
//! these traits, which keeps the retry and rollback logic testable against
//! in-memory fakes.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use portcullis_common::{ContainerId, PortcullisError, PortcullisResult};
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Address block and gateway of a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Address block.
    pub address_prefix: Ipv4Net,
    /// Gateway inside the block.
    pub gateway_address: Ipv4Addr,
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.address_prefix, self.gateway_address)
    }
}

/// A virtual network known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Control plane identifier.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Address blocks.
    pub subnets: Vec<Subnet>,
    /// DNS servers handed to endpoints.
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Request to create a NAT network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Network name.
    pub name: String,
    /// Address blocks.
    pub subnets: Vec<Subnet>,
    /// DNS servers handed to endpoints.
    pub dns_servers: Vec<String>,
}

/// Request to create an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    /// Endpoint name, equal to the container handle.
    pub name: String,
    /// Identifier of the network to join.
    pub virtual_network: String,
    /// Policies enforced on the endpoint.
    pub policies: Vec<Policy>,
    /// DNS servers for the container.
    pub dns_servers: Vec<String>,
}

/// A container's attachment point to a virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Control plane identifier.
    pub id: String,
    /// Endpoint name, equal to the container handle.
    pub name: String,
    /// Identifier of the joined network.
    pub virtual_network: String,
    /// Address leased to the container.
    pub ip_address: Option<Ipv4Addr>,
    /// Policies enforced on the endpoint.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// DNS servers for the container.
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// A local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name.
    pub name: String,
    /// Interface index.
    pub index: u32,
    /// Current MTU.
    pub mtu: u32,
}

/// Host virtual network control plane.
///
/// Failures are reported as [`PortcullisError::Platform`] carrying the
/// platform's message unchanged; see [`classify`].
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Resolve a network by name.
    async fn network_by_name(&self, name: &str) -> PortcullisResult<Network>;

    /// Create a network.
    async fn create_network(&self, request: &NetworkRequest) -> PortcullisResult<Network>;

    /// Delete a network.
    async fn delete_network(&self, network: &Network) -> PortcullisResult<()>;

    /// Create an endpoint.
    async fn create_endpoint(&self, request: &EndpointRequest) -> PortcullisResult<Endpoint>;

    /// Resolve an endpoint by identifier.
    async fn endpoint_by_id(&self, id: &str) -> PortcullisResult<Endpoint>;

    /// Resolve an endpoint by name.
    async fn endpoint_by_name(&self, name: &str) -> PortcullisResult<Endpoint>;

    /// Replace the policies of an existing endpoint.
    async fn update_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<Endpoint>;

    /// Delete an endpoint.
    async fn delete_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<()>;

    /// Attach an endpoint to a running container.
    async fn hot_attach_endpoint(&self, container_id: &str, endpoint_id: &str)
    -> PortcullisResult<()>;

    /// Detach an endpoint from a container.
    async fn hot_detach_endpoint(&self, container_id: &str, endpoint_id: &str)
    -> PortcullisResult<()>;
}

/// Host port pool shared by every container on the host.
///
/// Implementations must be safe under concurrent callers and never hand out
/// a port that is still held.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Allocate a port for `handle`; `preferred` 0 means any free port.
    async fn allocate_port(&self, handle: &str, preferred: u16) -> PortcullisResult<u16>;

    /// Release every port held by `handle`.
    async fn release_all_ports(&self, handle: &str) -> PortcullisResult<()>;
}

/// Local network interface lookup.
#[async_trait]
pub trait NetInterface: Send + Sync {
    /// Find an interface by name.
    async fn by_name(&self, name: &str) -> PortcullisResult<Interface>;

    /// Find the interface whose subnet contains `ip`.
    async fn by_ip(&self, ip: Ipv4Addr) -> PortcullisResult<Interface>;

    /// The host's outbound, non-loopback IPv4 address.
    async fn local_ip(&self) -> PortcullisResult<Ipv4Addr>;
}

/// Runs network configuration commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command on the host and return its stdout.
    async fn run_host(&self, program: &str, args: &[String]) -> PortcullisResult<String>;

    /// Run a command inside a container's network namespace.
    async fn run_container(
        &self,
        container_id: &str,
        program: &str,
        args: &[String],
    ) -> PortcullisResult<String>;
}

/// The host capabilities handed to the managers.
#[derive(Clone)]
pub struct Capabilities {
    /// Virtual network control plane.
    pub control_plane: Arc<dyn ControlPlane>,
    /// Host port pool.
    pub ports: Arc<dyn PortAllocator>,
    /// Interface lookup.
    pub interfaces: Arc<dyn NetInterface>,
    /// Configuration command runner.
    pub runner: Arc<dyn CommandRunner>,
}

/// Name of the host side of a container's adapter pair.
#[must_use]
pub fn host_adapter(id: &ContainerId) -> String {
    format!("vh-{}", id.adapter_suffix())
}

/// Name of the container side of a container's adapter pair.
#[must_use]
pub fn container_adapter(id: &ContainerId) -> String {
    format!("vc-{}", id.adapter_suffix())
}

/// How a platform failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Expected to clear up on retry.
    Transient,
    /// The resource was created by someone else.
    Conflict,
    /// The resource does not exist.
    NotFound,
    /// Anything else.
    Permanent,
}

const TRANSIENT_SIGNATURES: &[&str] = &[
    "Unspecified error",
    "Resource temporarily unavailable",
    "Device or resource busy",
];

const CONFLICT_SIGNATURES: &[&str] = &["Object Exists", "File exists", "already exists"];

const NOT_FOUND_SIGNATURES: &[&str] = &["not found", "does not exist", "Cannot find device"];

/// Classify an error by the platform message it carries.
///
/// This is the only place message signatures are matched. Errors that did
/// not come from the platform are always [`Failure::Permanent`].
#[must_use]
pub fn classify(err: &PortcullisError) -> Failure {
    let PortcullisError::Platform { message } = err else {
        return Failure::Permanent;
    };

    let matches = |signatures: &[&str]| signatures.iter().any(|s| message.contains(s));

    if matches(TRANSIENT_SIGNATURES) {
        Failure::Transient
    } else if matches(CONFLICT_SIGNATURES) {
        Failure::Conflict
    } else if matches(NOT_FOUND_SIGNATURES) {
        Failure::NotFound
    } else {
        Failure::Permanent
    }
}

/// Message used when a network lookup misses.
#[must_use]
pub fn network_not_found(name: &str) -> PortcullisError {
    PortcullisError::platform(format!("Network {name} not found"))
}

/// Message used when an endpoint lookup misses.
#[must_use]
pub fn endpoint_not_found(name: &str) -> PortcullisError {
    PortcullisError::platform(format!("Endpoint {name} not found"))
}

/// Message used when a container's namespace is gone.
#[must_use]
pub fn container_not_found(id: &str) -> PortcullisError {
    PortcullisError::platform(format!("container {id} does not exist"))
}
