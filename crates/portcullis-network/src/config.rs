//! Host network configuration.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use portcullis_common::{PortcullisError, PortcullisResult};
use serde::{Deserialize, Serialize};

use crate::applier::MAX_MTU;
use crate::platform::Subnet;

/// Default NAT subnet.
pub const DEFAULT_SUBNET_RANGE: &str = "172.30.0.0/22";

/// Default gateway inside [`DEFAULT_SUBNET_RANGE`].
pub const DEFAULT_GATEWAY_ADDRESS: &str = "172.30.0.1";

/// Default shared network name.
pub const DEFAULT_NETWORK_NAME: &str = "pcl-nat";

/// Longest usable interface name on Linux.
const MAX_INTERFACE_NAME: usize = 15;

/// Configuration of the host-wide NAT network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// MTU for the network and container adapters; 0 inherits.
    pub mtu: u32,
    /// Name of the shared network.
    pub network_name: String,
    /// Address block of the shared network.
    pub subnet_range: String,
    /// Gateway inside `subnet_range`.
    pub gateway_address: String,
    /// DNS servers handed to containers.
    pub dns_servers: Vec<String>,
    /// Outbound bandwidth cap per container in bytes/s; 0 is unlimited.
    pub maximum_outgoing_bandwidth: u64,
    /// First port of the host allocation range.
    pub port_range_start: u16,
    /// Number of ports in the host allocation range.
    pub port_range_capacity: u16,
    /// Timeout for each configuration command (seconds).
    pub command_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mtu: 0,
            network_name: DEFAULT_NETWORK_NAME.to_string(),
            subnet_range: DEFAULT_SUBNET_RANGE.to_string(),
            gateway_address: DEFAULT_GATEWAY_ADDRESS.to_string(),
            dns_servers: Vec::new(),
            maximum_outgoing_bandwidth: 0,
            port_range_start: 40000,
            port_range_capacity: 5000,
            command_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> PortcullisResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PortcullisError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| PortcullisError::Config {
            message: format!("failed to parse {}: {e}", path.display()),
        })?;

        config.validate()?;

        tracing::debug!(path = %path.display(), network = %config.network_name, "Loaded network config");
        Ok(config)
    }

    /// Check that the config describes a usable network.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::InvalidMtu`] for an MTU above [`MAX_MTU`],
    /// otherwise [`PortcullisError::Config`] describing the first problem found.
    pub fn validate(&self) -> PortcullisResult<()> {
        if self.mtu > MAX_MTU {
            return Err(PortcullisError::InvalidMtu { mtu: self.mtu });
        }

        if self.network_name.is_empty() || self.network_name.len() > MAX_INTERFACE_NAME {
            return Err(config_error(format!(
                "network_name must be 1-{MAX_INTERFACE_NAME} characters: {}",
                self.network_name
            )));
        }

        if self.network_name.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(config_error(format!(
                "network_name contains invalid characters: {}",
                self.network_name
            )));
        }

        let subnet = self.subnet()?;
        if !subnet.address_prefix.contains(&subnet.gateway_address) {
            return Err(config_error(format!(
                "gateway_address {} is outside subnet_range {}",
                subnet.gateway_address, subnet.address_prefix
            )));
        }

        if self.port_range_capacity == 0
            || u32::from(self.port_range_start) + u32::from(self.port_range_capacity)
                > u32::from(u16::MAX) + 1
        {
            return Err(config_error(format!(
                "port range {}+{} does not fit in the port space",
                self.port_range_start, self.port_range_capacity
            )));
        }

        Ok(())
    }

    /// The configured subnet and gateway.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::Config`] if either value does not parse.
    pub fn subnet(&self) -> PortcullisResult<Subnet> {
        let address_prefix: Ipv4Net = self
            .subnet_range
            .parse()
            .map_err(|_| config_error(format!("invalid subnet_range: {}", self.subnet_range)))?;
        let gateway_address: Ipv4Addr = self.gateway_address.parse().map_err(|_| {
            config_error(format!("invalid gateway_address: {}", self.gateway_address))
        })?;

        Ok(Subnet {
            address_prefix: address_prefix.trunc(),
            gateway_address,
        })
    }
}

fn config_error(message: String) -> PortcullisError {
    PortcullisError::Config { message }
}
