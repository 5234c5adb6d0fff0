//! Linux bridge management.
//!
//! The shared NAT network is a bridge carrying the gateway address; the
//! subnet is recovered from that address when the network is looked up.

use portcullis_common::PortcullisResult;

use crate::platform::{CommandRunner, Failure, Subnet, classify, network_not_found};

use super::iface::parse_ipv4_addresses;
use super::{args, platform_error};

/// A bridge backing a NAT network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    name: String,
}

impl Bridge {
    /// Refer to the bridge called `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get the bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the bridge, assign the gateway address and bring it up.
    ///
    /// # Errors
    ///
    /// Returns the platform error; an existing bridge reports `File exists`.
    pub async fn create(
        &self,
        runner: &dyn CommandRunner,
        subnet: Subnet,
    ) -> PortcullisResult<()> {
        tracing::debug!(name = %self.name, subnet = %subnet, "Creating bridge");

        runner
            .run_host(
                "ip",
                &args(&["link", "add", "name", &self.name, "type", "bridge"]),
            )
            .await
            .map_err(platform_error)?;

        let gateway = format!(
            "{}/{}",
            subnet.gateway_address,
            subnet.address_prefix.prefix_len()
        );
        runner
            .run_host("ip", &args(&["addr", "add", &gateway, "dev", &self.name]))
            .await
            .map_err(platform_error)?;

        runner
            .run_host("ip", &args(&["link", "set", &self.name, "up"]))
            .await
            .map_err(platform_error)?;

        tracing::info!(name = %self.name, "Bridge created successfully");
        Ok(())
    }

    /// Subnets configured on the bridge.
    ///
    /// # Errors
    ///
    /// Returns `Network <name> not found` when the bridge does not exist.
    pub async fn subnets(&self, runner: &dyn CommandRunner) -> PortcullisResult<Vec<Subnet>> {
        let listing = match runner
            .run_host(
                "ip",
                &args(&["-o", "-4", "addr", "show", "dev", &self.name]),
            )
            .await
            .map_err(platform_error)
        {
            Ok(listing) => listing,
            Err(err) if classify(&err) == Failure::NotFound => {
                return Err(network_not_found(&self.name));
            }
            Err(err) => return Err(err),
        };

        Ok(parse_ipv4_addresses(&listing)
            .into_iter()
            .filter(|(iface, _)| *iface == self.name)
            .map(|(_, net)| Subnet {
                address_prefix: net.trunc(),
                gateway_address: net.addr(),
            })
            .collect())
    }

    /// Attach an interface to the bridge.
    ///
    /// # Errors
    ///
    /// Returns the platform error.
    pub async fn add_interface(
        &self,
        runner: &dyn CommandRunner,
        interface: &str,
    ) -> PortcullisResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Adding interface to bridge");

        runner
            .run_host(
                "ip",
                &args(&["link", "set", interface, "master", &self.name]),
            )
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    /// Delete the bridge.
    ///
    /// # Errors
    ///
    /// Returns the platform error.
    pub async fn delete(&self, runner: &dyn CommandRunner) -> PortcullisResult<()> {
        tracing::debug!(name = %self.name, "Deleting bridge");

        runner
            .run_host(
                "ip",
                &args(&["link", "delete", &self.name, "type", "bridge"]),
            )
            .await
            .map_err(platform_error)?;
        Ok(())
    }
}
