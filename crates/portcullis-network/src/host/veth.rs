//! Virtual ethernet pair management.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use portcullis_common::{ContainerId, PortcullisResult};

use crate::platform::{CommandRunner, Failure, classify, container_adapter, host_adapter};

use super::{args, platform_error};

/// Virtual ethernet pair connecting a container to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name.
    pub host: String,
    /// Container-side interface name.
    pub container: String,
}

impl VethPair {
    /// The pair belonging to a container.
    #[must_use]
    pub fn for_container(id: &ContainerId) -> Self {
        Self {
            host: host_adapter(id),
            container: container_adapter(id),
        }
    }

    /// Create the pair and bring the host side up.
    ///
    /// # Errors
    ///
    /// Returns the platform error if either command fails.
    pub async fn create(&self, runner: &dyn CommandRunner) -> PortcullisResult<()> {
        tracing::debug!(host = %self.host, container = %self.container, "Creating veth pair");

        runner
            .run_host(
                "ip",
                &args(&[
                    "link",
                    "add",
                    &self.host,
                    "type",
                    "veth",
                    "peer",
                    "name",
                    &self.container,
                ]),
            )
            .await
            .map_err(platform_error)?;

        runner
            .run_host("ip", &args(&["link", "set", &self.host, "up"]))
            .await
            .map_err(platform_error)?;

        Ok(())
    }

    /// Move the container side into a named network namespace.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the move fails.
    pub async fn move_to_netns(
        &self,
        runner: &dyn CommandRunner,
        netns: &str,
    ) -> PortcullisResult<()> {
        tracing::debug!(interface = %self.container, netns, "Moving to netns");

        runner
            .run_host(
                "ip",
                &args(&["link", "set", &self.container, "netns", netns]),
            )
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    /// Address the container side and route through `gateway`.
    ///
    /// Must run after [`Self::move_to_netns`].
    ///
    /// # Errors
    ///
    /// Returns the platform error of the first failing command.
    pub async fn configure(
        &self,
        runner: &dyn CommandRunner,
        container_id: &str,
        address: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> PortcullisResult<()> {
        let address = address.to_string();
        let gateway = gateway.to_string();
        let commands: [&[&str]; 4] = [
            &["addr", "add", &address, "dev", &self.container],
            &["link", "set", &self.container, "up"],
            &["link", "set", "lo", "up"],
            &[
                "route",
                "replace",
                "default",
                "via",
                &gateway,
                "dev",
                &self.container,
            ],
        ];

        for command in commands {
            runner
                .run_container(container_id, "ip", &args(command))
                .await
                .map_err(platform_error)?;
        }

        tracing::debug!(
            interface = %self.container,
            container_id,
            address = %address,
            "Configured container interface"
        );
        Ok(())
    }

    /// Move the container side back to the host namespace.
    ///
    /// # Errors
    ///
    /// Returns the platform error, which is [`Failure::NotFound`] when the
    /// container's namespace is already gone.
    pub async fn return_to_host(
        &self,
        runner: &dyn CommandRunner,
        container_id: &str,
    ) -> PortcullisResult<()> {
        runner
            .run_container(
                container_id,
                "ip",
                &args(&["link", "set", &self.container, "netns", "1"]),
            )
            .await
            .map_err(platform_error)?;
        Ok(())
    }

    /// Delete the pair. A pair that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns any other platform error.
    pub async fn delete(&self, runner: &dyn CommandRunner) -> PortcullisResult<()> {
        tracing::debug!(host = %self.host, "Deleting veth pair");

        match runner
            .run_host("ip", &args(&["link", "delete", &self.host]))
            .await
            .map_err(platform_error)
        {
            Err(err) if classify(&err) == Failure::NotFound => {
                tracing::debug!(host = %self.host, "veth pair already gone");
                Ok(())
            }
            other => other.map(drop),
        }
    }
}
