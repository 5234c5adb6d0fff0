//! Bridge-backed virtual network control plane.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use portcullis_common::{ContainerId, PortcullisError, PortcullisPaths, PortcullisResult};

use crate::platform::{
    CommandRunner, ControlPlane, Endpoint, EndpointRequest, Network, NetworkRequest, Subnet,
    container_adapter, container_not_found,
};
use crate::policy::{Policy, QosPolicy};

use super::bridge::Bridge;
use super::store::EndpointStore;
use super::veth::VethPair;
use super::{args, iptables, platform_error};

/// [`ControlPlane`] realized with a Linux bridge, veth pairs and iptables.
///
/// Networks are identified by their bridge name. Endpoints and their
/// address leases are kept in an [`EndpointStore`].
pub struct BridgeControlPlane {
    runner: Arc<dyn CommandRunner>,
    store: EndpointStore,
    paths: PortcullisPaths,
}

impl BridgeControlPlane {
    /// Create a control plane keeping its records under `paths`.
    pub fn new(runner: Arc<dyn CommandRunner>, paths: PortcullisPaths) -> Self {
        Self {
            runner,
            store: EndpointStore::new(paths.endpoints()),
            paths,
        }
    }

    async fn subnet(&self, network: &str) -> PortcullisResult<Subnet> {
        Bridge::named(network)
            .subnets(self.runner.as_ref())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PortcullisError::platform(format!("Network {network} has no subnet")))
    }

    fn ensure_netns(&self, container_id: &str) -> PortcullisResult<()> {
        if self.paths.container_netns(container_id).exists() {
            Ok(())
        } else {
            Err(container_not_found(container_id))
        }
    }

    async fn provision(&self, endpoint: &Endpoint, ip: Ipv4Addr) -> PortcullisResult<()> {
        let pair = pair_for(endpoint)?;
        pair.create(self.runner.as_ref()).await?;
        Bridge::named(&endpoint.virtual_network)
            .add_interface(self.runner.as_ref(), &pair.host)
            .await?;
        iptables::apply(
            self.runner.as_ref(),
            &iptables::render(&endpoint.id, ip, &endpoint.policies),
        )
        .await
    }

    async fn tear_down(&self, endpoint: &Endpoint) -> PortcullisResult<()> {
        iptables::remove(self.runner.as_ref(), &endpoint.id).await?;
        pair_for(endpoint)?.delete(self.runner.as_ref()).await?;
        self.store.remove(&endpoint.id).await
    }

    async fn shape(&self, container_id: &str, qos: QosPolicy) -> PortcullisResult<()> {
        if qos.maximum_outgoing_bandwidth_in_bytes == 0 {
            return Ok(());
        }

        let device = container_adapter(&ContainerId::new(container_id)?);
        let rate = format!("{}bit", qos.maximum_outgoing_bandwidth_in_bytes.saturating_mul(8));
        self.runner
            .run_container(
                container_id,
                "tc",
                &args(&[
                    "qdisc", "replace", "dev", &device, "root", "tbf", "rate", &rate, "burst",
                    "32kbit", "latency", "400ms",
                ]),
            )
            .await
            .map_err(platform_error)?;

        tracing::debug!(container_id, rate = %rate, "Limited outgoing bandwidth");
        Ok(())
    }

    async fn write_resolv_conf(
        &self,
        container_id: &str,
        dns_servers: &[String],
    ) -> PortcullisResult<()> {
        let path = self.paths.container_resolv_conf(container_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content: String = dns_servers
            .iter()
            .map(|server| format!("nameserver {server}\n"))
            .collect();
        tokio::fs::write(&path, content).await?;

        tracing::debug!(path = %path.display(), "Wrote resolver configuration");
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for BridgeControlPlane {
    async fn network_by_name(&self, name: &str) -> PortcullisResult<Network> {
        let subnets = Bridge::named(name).subnets(self.runner.as_ref()).await?;
        Ok(Network {
            id: name.to_string(),
            name: name.to_string(),
            subnets,
            dns_servers: Vec::new(),
        })
    }

    async fn create_network(&self, request: &NetworkRequest) -> PortcullisResult<Network> {
        let subnet = request.subnets.first().copied().ok_or_else(|| {
            PortcullisError::platform(format!("Network {} requested without a subnet", request.name))
        })?;

        Bridge::named(&request.name)
            .create(self.runner.as_ref(), subnet)
            .await?;
        self.runner
            .run_host("sysctl", &args(&["-w", "net.ipv4.ip_forward=1"]))
            .await
            .map_err(platform_error)?;

        Ok(Network {
            id: request.name.clone(),
            name: request.name.clone(),
            subnets: vec![subnet],
            dns_servers: request.dns_servers.clone(),
        })
    }

    async fn delete_network(&self, network: &Network) -> PortcullisResult<()> {
        Bridge::named(&network.id).delete(self.runner.as_ref()).await
    }

    async fn create_endpoint(&self, request: &EndpointRequest) -> PortcullisResult<Endpoint> {
        let subnet = self.subnet(&request.virtual_network).await?;
        let endpoint = self.store.create(request, subnet).await?;
        let ip = endpoint.ip_address.unwrap_or(subnet.gateway_address);

        if let Err(err) = self.provision(&endpoint, ip).await {
            tracing::warn!(endpoint_id = %endpoint.id, error = %err, "Endpoint setup failed, tearing down");
            if let Err(teardown_err) = self.tear_down(&endpoint).await {
                tracing::error!(endpoint_id = %endpoint.id, error = %teardown_err, "Endpoint teardown failed");
            }
            return Err(err);
        }

        tracing::info!(endpoint_id = %endpoint.id, name = %endpoint.name, ip = %ip, "Created endpoint");
        Ok(endpoint)
    }

    async fn endpoint_by_id(&self, id: &str) -> PortcullisResult<Endpoint> {
        self.store.by_id(id).await
    }

    async fn endpoint_by_name(&self, name: &str) -> PortcullisResult<Endpoint> {
        self.store.by_name(name).await
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<Endpoint> {
        let stored = self.store.by_id(&endpoint.id).await?;
        let updated = Endpoint {
            policies: endpoint.policies.clone(),
            dns_servers: endpoint.dns_servers.clone(),
            ..stored
        };

        iptables::remove(self.runner.as_ref(), &updated.id).await?;
        if let Some(ip) = updated.ip_address {
            iptables::apply(
                self.runner.as_ref(),
                &iptables::render(&updated.id, ip, &updated.policies),
            )
            .await?;
        }
        self.store.update(&updated).await?;

        tracing::debug!(endpoint_id = %updated.id, policies = updated.policies.len(), "Updated endpoint policies");
        Ok(updated)
    }

    async fn delete_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<()> {
        self.tear_down(endpoint).await?;
        tracing::info!(endpoint_id = %endpoint.id, "Deleted endpoint");
        Ok(())
    }

    async fn hot_attach_endpoint(
        &self,
        container_id: &str,
        endpoint_id: &str,
    ) -> PortcullisResult<()> {
        self.ensure_netns(container_id)?;

        let endpoint = self.store.by_id(endpoint_id).await?;
        let ip = endpoint.ip_address.ok_or_else(|| {
            PortcullisError::platform(format!("Endpoint {endpoint_id} has no address"))
        })?;
        let subnet = self.subnet(&endpoint.virtual_network).await?;
        let address = Ipv4Net::new(ip, subnet.address_prefix.prefix_len())
            .map_err(|e| PortcullisError::platform(e.to_string()))?;

        let pair = pair_for(&endpoint)?;
        pair.move_to_netns(self.runner.as_ref(), container_id).await?;
        pair.configure(
            self.runner.as_ref(),
            container_id,
            address,
            subnet.gateway_address,
        )
        .await?;

        for policy in &endpoint.policies {
            if let Policy::Qos(qos) = policy {
                self.shape(container_id, *qos).await?;
            }
        }

        if !endpoint.dns_servers.is_empty() {
            self.write_resolv_conf(container_id, &endpoint.dns_servers)
                .await?;
        }

        tracing::info!(container_id, endpoint_id, address = %address, "Attached endpoint");
        Ok(())
    }

    async fn hot_detach_endpoint(
        &self,
        container_id: &str,
        endpoint_id: &str,
    ) -> PortcullisResult<()> {
        self.ensure_netns(container_id)?;

        let endpoint = self.store.by_id(endpoint_id).await?;
        pair_for(&endpoint)?
            .return_to_host(self.runner.as_ref(), container_id)
            .await?;

        match tokio::fs::remove_dir_all(self.paths.netns_config.join(container_id)).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }

        tracing::info!(container_id, endpoint_id, "Detached endpoint");
        Ok(())
    }
}

fn pair_for(endpoint: &Endpoint) -> PortcullisResult<VethPair> {
    Ok(VethPair::for_container(&ContainerId::new(
        endpoint.name.clone(),
    )?))
}
