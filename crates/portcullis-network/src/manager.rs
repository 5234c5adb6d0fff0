//! Network manager.
//!
//! Owns the host-wide NAT network and the per-container `up`/`down`
//! sequence. Every partially completed `up` is rolled back before the
//! original error is returned.

use std::collections::BTreeMap;
use std::time::Duration;

use portcullis_common::{ContainerId, PortcullisError, PortcullisResult};
use serde::{Deserialize, Serialize};

use crate::applier::{Applier, validate_mtu};
use crate::cleanup::join_errors;
use crate::config::NetworkConfig;
use crate::endpoint::EndpointManager;
use crate::platform::{Capabilities, Failure, Network, NetworkRequest, Subnet, classify};
use crate::policy::{AclPolicy, NatPolicy};
use crate::rules::{NetIn, NetOut, PortMapping};

/// Placeholder reported for the deprecated host IP property.
pub const HOST_IP: &str = "255.255.255.255";

/// Most ingress rules a container may carry.
pub const MAX_PORT_MAPPINGS: usize = 2;

/// Lookups made after a create conflict before giving up on the network.
const NETWORK_LOOKUP_ATTEMPTS: u32 = 10;

/// Step between successive lookups after a create conflict.
const NETWORK_LOOKUP_BACKOFF: Duration = Duration::from_millis(100);

/// Request read by `up`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpInputs {
    /// Container init process.
    #[serde(default, alias = "Pid")]
    pub pid: u32,
    /// Opaque caller properties.
    #[serde(default, alias = "Properties")]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Egress rules.
    #[serde(default, rename = "netout_rules")]
    pub net_out: Vec<NetOut>,
    /// Ingress rules.
    #[serde(default, rename = "netin")]
    pub net_in: Vec<NetIn>,
}

/// Properties reported by `up`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpProperties {
    /// Address of the container.
    #[serde(rename = "garden.network.container-ip")]
    pub container_ip: String,
    /// Always [`HOST_IP`].
    #[serde(rename = "garden.network.host-ip")]
    pub deprecated_host_ip: String,
    /// JSON list of realized [`PortMapping`]s.
    #[serde(rename = "garden.network.mapped-ports")]
    pub mapped_ports: String,
}

/// Result written by `up`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpOutputs {
    /// Reported properties.
    pub properties: UpProperties,
    /// DNS servers configured for the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

/// Orchestrates host and container networking.
pub struct NetworkManager {
    config: NetworkConfig,
    caps: Capabilities,
    applier: Applier,
}

impl NetworkManager {
    /// Create a manager over the given host capabilities.
    pub fn new(config: NetworkConfig, caps: Capabilities) -> Self {
        let applier = Applier::new(
            config.network_name.clone(),
            caps.ports.clone(),
            caps.interfaces.clone(),
            caps.runner.clone(),
        );
        Self {
            config,
            caps,
            applier,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn endpoints(&self, container_id: &ContainerId) -> EndpointManager {
        EndpointManager::new(
            container_id.clone(),
            self.config.network_name.clone(),
            self.caps.control_plane.clone(),
        )
        .with_dns_servers(self.config.dns_servers.clone())
        .with_bandwidth_limit(self.config.maximum_outgoing_bandwidth)
    }

    /// Ensure the shared NAT network exists with the configured subnet.
    ///
    /// An existing network with the same subnet and gateway is reused. A
    /// concurrent creator winning the race is tolerated by looking the
    /// network up again. A network this call created is deleted again if its
    /// MTU or masquerading cannot be set up.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::InvalidMtu`] before any side effect,
    /// [`PortcullisError::NetworkConflict`] if the existing network
    /// is configured differently, [`PortcullisError::NatNetworkUnavailable`]
    /// if a raced network never becomes visible, or the platform's error.
    pub async fn create_host_nat_network(&self) -> PortcullisResult<Network> {
        validate_mtu(self.config.mtu)?;
        let subnet = self.config.subnet()?;
        let name = &self.config.network_name;

        match self.caps.control_plane.network_by_name(name).await {
            Ok(existing) => return self.reuse(existing, subnet),
            Err(err) if classify(&err) == Failure::NotFound => {}
            Err(err) => return Err(err),
        }

        let request = NetworkRequest {
            name: name.clone(),
            subnets: vec![subnet],
            dns_servers: self.config.dns_servers.clone(),
        };

        let network = match self.caps.control_plane.create_network(&request).await {
            Ok(network) => network,
            Err(err) if classify(&err) == Failure::Conflict => {
                tracing::info!(network = %name, "Network created concurrently, resolving");
                let existing = self.await_network().await?;
                return self.reuse(existing, subnet);
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.configure_network(subnet).await {
            tracing::warn!(network = %name, error = %err, "Removing half-configured NAT network");
            if let Err(delete_err) = self.caps.control_plane.delete_network(&network).await {
                tracing::error!(network = %name, error = %delete_err, "Failed to delete NAT network");
            }
            return Err(err);
        }

        tracing::info!(network = %name, subnet = %subnet, "Created NAT network");
        Ok(network)
    }

    async fn configure_network(&self, subnet: Subnet) -> PortcullisResult<()> {
        self.applier.nat_mtu(self.config.mtu).await?;
        self.caps
            .runner
            .run_host("iptables", &masquerade_args("-A", subnet))
            .await?;
        Ok(())
    }

    /// Remove the shared NAT network; a missing network is success.
    ///
    /// # Errors
    ///
    /// Returns the platform's or the firewall command's error.
    pub async fn delete_host_nat_network(&self) -> PortcullisResult<()> {
        let name = &self.config.network_name;
        let network = match self.caps.control_plane.network_by_name(name).await {
            Ok(network) => network,
            Err(err) if classify(&err) == Failure::NotFound => {
                tracing::debug!(network = %name, "No NAT network to delete");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.caps.control_plane.delete_network(&network).await?;

        for subnet in &network.subnets {
            self.caps
                .runner
                .run_host("iptables", &masquerade_args("-D", *subnet))
                .await?;
        }

        tracing::info!(network = %name, "Deleted NAT network");
        Ok(())
    }

    /// Provision networking for a container.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error unchanged, after releasing the
    /// container's ports and deleting its endpoint if one was created.
    pub async fn up(
        &self,
        container_id: &ContainerId,
        inputs: &UpInputs,
    ) -> PortcullisResult<UpOutputs> {
        if inputs.net_in.len() > MAX_PORT_MAPPINGS {
            return Err(PortcullisError::TooManyPortMappings {
                count: inputs.net_in.len(),
            });
        }

        tracing::info!(
            container_id = %container_id,
            netin = inputs.net_in.len(),
            netout = inputs.net_out.len(),
            "Bringing container network up"
        );

        let mut nat_policies: Vec<NatPolicy> = Vec::with_capacity(inputs.net_in.len());
        let mut acl_policies: Vec<AclPolicy> = Vec::with_capacity(inputs.net_in.len());
        for rule in &inputs.net_in {
            match self.applier.net_in(container_id, rule).await {
                Ok((nat, acl)) => {
                    nat_policies.push(nat);
                    acl_policies.push(acl);
                }
                Err(err) => return Err(self.roll_back(container_id, false, err).await),
            }
        }

        let endpoints = self.endpoints(container_id);
        let endpoint = match endpoints.create(&nat_policies, &acl_policies).await {
            Ok(endpoint) => endpoint,
            Err(err) => return Err(self.roll_back(container_id, false, err).await),
        };

        let mut egress = Vec::new();
        for rule in &inputs.net_out {
            match self.applier.net_out(rule) {
                Ok(policies) => egress.extend(policies),
                Err(err) => return Err(self.roll_back(container_id, true, err).await),
            }
        }

        let endpoint = match endpoints.update_policies(&endpoint, egress).await {
            Ok(endpoint) => endpoint,
            Err(err) => return Err(self.roll_back(container_id, true, err).await),
        };

        if let Err(err) = self.applier.container_mtu(container_id, self.config.mtu).await {
            return Err(self.roll_back(container_id, true, err).await);
        }

        let mappings: Vec<PortMapping> = nat_policies
            .iter()
            .map(|nat| PortMapping {
                host_port: nat.external_port,
                container_port: nat.internal_port,
            })
            .collect();

        let container_ip = match endpoint.ip_address {
            Some(ip) => ip,
            None => match self.caps.interfaces.local_ip().await {
                Ok(ip) => ip,
                Err(err) => return Err(self.roll_back(container_id, true, err).await),
            },
        };

        tracing::info!(
            container_id = %container_id,
            ip = %container_ip,
            mapped = mappings.len(),
            "Container network up"
        );

        Ok(UpOutputs {
            properties: UpProperties {
                container_ip: container_ip.to_string(),
                deprecated_host_ip: HOST_IP.to_string(),
                mapped_ports: serde_json::to_string(&mappings)?,
            },
            dns_servers: self.config.dns_servers.clone(),
        })
    }

    /// Tear down networking for a container.
    ///
    /// Endpoint deletion and port release both run regardless of the
    /// other's outcome.
    ///
    /// # Errors
    ///
    /// Returns whichever step failed, or both combined.
    pub async fn down(&self, container_id: &ContainerId) -> PortcullisResult<()> {
        tracing::info!(container_id = %container_id, "Bringing container network down");

        let deleted = self.endpoints(container_id).delete().await;
        let released = self.applier.cleanup(container_id).await;

        join_errors([deleted, released])
    }

    fn reuse(&self, existing: Network, subnet: Subnet) -> PortcullisResult<Network> {
        if existing.subnets.len() == 1 && existing.subnets[0] == subnet {
            tracing::debug!(network = %existing.name, "Reusing NAT network");
            return Ok(existing);
        }

        Err(PortcullisError::NetworkConflict {
            name: self.config.network_name.clone(),
            existing: existing
                .subnets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            subnet: subnet.address_prefix.to_string(),
            gateway: subnet.gateway_address.to_string(),
        })
    }

    async fn await_network(&self) -> PortcullisResult<Network> {
        let name = &self.config.network_name;
        for attempt in 1..=NETWORK_LOOKUP_ATTEMPTS {
            tokio::time::sleep(NETWORK_LOOKUP_BACKOFF * attempt).await;

            match self.caps.control_plane.network_by_name(name).await {
                Ok(network) => return Ok(network),
                Err(err) if classify(&err) == Failure::NotFound => {
                    tracing::debug!(network = %name, attempt, "NAT network not visible yet");
                }
                Err(err) => return Err(err),
            }
        }

        Err(PortcullisError::NatNetworkUnavailable { name: name.clone() })
    }

    async fn roll_back(
        &self,
        container_id: &ContainerId,
        endpoint_created: bool,
        err: PortcullisError,
    ) -> PortcullisError {
        tracing::warn!(container_id = %container_id, error = %err, "Rolling back container network");

        if let Err(cleanup_err) = self.applier.cleanup(container_id).await {
            tracing::error!(container_id = %container_id, error = %cleanup_err, "Failed to release ports");
        }

        if endpoint_created {
            if let Err(delete_err) = self.endpoints(container_id).delete().await {
                tracing::error!(container_id = %container_id, error = %delete_err, "Failed to delete endpoint");
            }
        }

        err
    }
}

fn masquerade_args(action: &str, subnet: Subnet) -> Vec<String> {
    let source = subnet.address_prefix.to_string();
    [
        "-t",
        "nat",
        action,
        "POSTROUTING",
        "-s",
        source.as_str(),
        "!",
        "-d",
        source.as_str(),
        "-j",
        "MASQUERADE",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
