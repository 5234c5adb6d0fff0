//! Container endpoint lifecycle.
//!
//! An endpoint moves through absent, created and attached, and back to
//! absent on delete. Creation is retried on transient platform failures and
//! never leaves an unattached endpoint behind.

use std::sync::Arc;

use portcullis_common::{ContainerId, PortcullisResult};

use crate::cleanup::join_errors;
use crate::platform::{ControlPlane, Endpoint, EndpointRequest, Failure, classify};
use crate::policy::{AclPolicy, NatPolicy, Policy, QosPolicy};

/// Attempts made to create an endpoint before giving up.
pub const CREATE_ATTEMPTS: usize = 3;

/// Manages the network endpoint of one container.
pub struct EndpointManager {
    container_id: ContainerId,
    network_name: String,
    dns_servers: Vec<String>,
    qos: Option<QosPolicy>,
    control_plane: Arc<dyn ControlPlane>,
}

impl EndpointManager {
    /// Create a manager for `container_id` joining `network_name`.
    pub fn new(
        container_id: ContainerId,
        network_name: impl Into<String>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            container_id,
            network_name: network_name.into(),
            dns_servers: Vec::new(),
            qos: None,
            control_plane,
        }
    }

    /// Set the DNS servers handed to the container.
    #[must_use]
    pub fn with_dns_servers(mut self, dns_servers: Vec<String>) -> Self {
        self.dns_servers = dns_servers;
        self
    }

    /// Cap outbound bandwidth; 0 leaves it unlimited.
    #[must_use]
    pub fn with_bandwidth_limit(mut self, bytes_per_second: u64) -> Self {
        self.qos = (bytes_per_second > 0).then_some(QosPolicy {
            maximum_outgoing_bandwidth_in_bytes: bytes_per_second,
        });
        self
    }

    /// Create the endpoint carrying the given policies and attach it.
    ///
    /// # Errors
    ///
    /// Fails if the shared network is missing, if creation fails permanently
    /// or keeps failing transiently, or if attaching fails. In the last case
    /// the new endpoint is deleted before the attach error is returned.
    pub async fn create(
        &self,
        nat_policies: &[NatPolicy],
        acl_policies: &[AclPolicy],
    ) -> PortcullisResult<Endpoint> {
        let network = self
            .control_plane
            .network_by_name(&self.network_name)
            .await?;

        let mut policies: Vec<Policy> = nat_policies.iter().copied().map(Policy::from).collect();
        policies.extend(acl_policies.iter().cloned().map(Policy::from));
        policies.extend(self.qos.map(Policy::from));

        let request = EndpointRequest {
            name: self.container_id.to_string(),
            virtual_network: network.id,
            policies,
            dns_servers: self.dns_servers.clone(),
        };

        let endpoint = self.create_with_retry(&request).await?;

        if let Err(attach_err) = self
            .control_plane
            .hot_attach_endpoint(self.container_id.as_str(), &endpoint.id)
            .await
        {
            tracing::warn!(
                container_id = %self.container_id,
                endpoint_id = %endpoint.id,
                error = %attach_err,
                "Attach failed, deleting endpoint"
            );
            if let Err(delete_err) = self.control_plane.delete_endpoint(&endpoint).await {
                tracing::error!(
                    endpoint_id = %endpoint.id,
                    error = %delete_err,
                    "Failed to delete unattached endpoint"
                );
            }
            return Err(attach_err);
        }

        tracing::info!(
            container_id = %self.container_id,
            endpoint_id = %endpoint.id,
            ip = ?endpoint.ip_address,
            "Endpoint attached"
        );
        Ok(endpoint)
    }

    /// Add ACL policies to an existing endpoint.
    ///
    /// # Errors
    ///
    /// Returns the control plane's error.
    pub async fn update_policies(
        &self,
        endpoint: &Endpoint,
        acl_policies: Vec<AclPolicy>,
    ) -> PortcullisResult<Endpoint> {
        if acl_policies.is_empty() {
            return Ok(endpoint.clone());
        }

        let mut updated = endpoint.clone();
        updated
            .policies
            .extend(acl_policies.into_iter().map(Policy::from));

        tracing::debug!(
            endpoint_id = %endpoint.id,
            policies = updated.policies.len(),
            "Updating endpoint policies"
        );
        self.control_plane.update_endpoint(&updated).await
    }

    /// Detach and delete the container's endpoint.
    ///
    /// A missing endpoint is success, as is detaching from a container that
    /// is already gone. Delete is attempted even when detach fails.
    ///
    /// # Errors
    ///
    /// Returns the detach or delete failure, or both combined.
    pub async fn delete(&self) -> PortcullisResult<()> {
        let endpoint = match self
            .control_plane
            .endpoint_by_name(self.container_id.as_str())
            .await
        {
            Ok(endpoint) => endpoint,
            Err(err) if classify(&err) == Failure::NotFound => {
                tracing::debug!(container_id = %self.container_id, "No endpoint to delete");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let detached = match self
            .control_plane
            .hot_detach_endpoint(self.container_id.as_str(), &endpoint.id)
            .await
        {
            Err(err) if classify(&err) == Failure::NotFound => Ok(()),
            other => other,
        };
        let deleted = self.control_plane.delete_endpoint(&endpoint).await;

        join_errors([detached, deleted])?;

        tracing::info!(container_id = %self.container_id, endpoint_id = %endpoint.id, "Endpoint deleted");
        Ok(())
    }

    async fn create_with_retry(&self, request: &EndpointRequest) -> PortcullisResult<Endpoint> {
        let mut attempt = 1;
        loop {
            match self.control_plane.create_endpoint(request).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(err) if attempt < CREATE_ATTEMPTS && classify(&err) == Failure::Transient => {
                    tracing::warn!(
                        container_id = %self.container_id,
                        attempt,
                        error = %err,
                        "Transient failure creating endpoint, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeControlPlane;
    use crate::platform::{Network, Subnet};
    use crate::policy::{Direction, IpProtocol};
    use portcullis_common::PortcullisError;

    const TRANSIENT: &str = "RTNETLINK answers: Unspecified error";

    fn network() -> Network {
        Network {
            id: "net-0".to_string(),
            name: "pcl-nat".to_string(),
            subnets: vec![Subnet {
                address_prefix: "172.30.0.0/22".parse().unwrap(),
                gateway_address: "172.30.0.1".parse().unwrap(),
            }],
            dns_servers: vec![],
        }
    }

    fn manager(plane: &Arc<FakeControlPlane>) -> EndpointManager {
        EndpointManager::new(ContainerId::new("web-1").unwrap(), "pcl-nat", plane.clone())
    }

    fn script(plane: &FakeControlPlane, results: &[Option<&str>]) {
        plane.state.lock().create_endpoint_results =
            results.iter().map(|r| r.map(String::from)).collect();
    }

    #[test_log::test(tokio::test)]
    async fn transient_failures_are_retried() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        script(&plane, &[Some(TRANSIENT), Some(TRANSIENT), None]);

        let endpoint = manager(&plane).create(&[], &[]).await.unwrap();

        let state = plane.state.lock();
        assert_eq!(state.create_endpoint_calls, 3);
        assert_eq!(state.attach_calls, 1);
        assert_eq!(endpoint.name, "web-1");
        assert_eq!(endpoint.virtual_network, "net-0");
    }

    #[tokio::test]
    async fn transient_failures_give_up_after_three_attempts() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        script(&plane, &[Some(TRANSIENT), Some(TRANSIENT), Some(TRANSIENT), None]);

        let err = manager(&plane).create(&[], &[]).await.unwrap_err();

        assert_eq!(err.to_string(), TRANSIENT);
        assert_eq!(plane.state.lock().create_endpoint_calls, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        script(&plane, &[Some("access is denied"), None]);

        let err = manager(&plane).create(&[], &[]).await.unwrap_err();

        assert_eq!(err.to_string(), "access is denied");
        let state = plane.state.lock();
        assert_eq!(state.create_endpoint_calls, 1);
        assert_eq!(state.attach_calls, 0);
    }

    #[tokio::test]
    async fn attach_failure_deletes_endpoint_once() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        plane.state.lock().attach_error = Some("attach exploded".to_string());

        let err = manager(&plane).create(&[], &[]).await.unwrap_err();

        assert_eq!(err.to_string(), "attach exploded");
        let state = plane.state.lock();
        assert_eq!(state.delete_endpoint_calls, 1);
        assert!(state.endpoints.is_empty());
    }

    #[tokio::test]
    async fn missing_network_is_fatal() {
        let plane = Arc::new(FakeControlPlane::default());

        let err = manager(&plane).create(&[], &[]).await.unwrap_err();

        assert_eq!(err.to_string(), "Network pcl-nat not found");
        assert_eq!(plane.state.lock().create_endpoint_calls, 0);
    }

    #[tokio::test]
    async fn request_bundles_all_policies() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        let nat = [NatPolicy::tcp(8080, 40000)];
        let acl = [AclPolicy::allow(Direction::In, IpProtocol::Tcp).local_port(8080)];

        manager(&plane)
            .with_dns_servers(vec!["1.1.1.1".to_string()])
            .with_bandwidth_limit(1_000_000)
            .create(&nat, &acl)
            .await
            .unwrap();

        let state = plane.state.lock();
        let request = state.last_request.as_ref().unwrap();
        assert_eq!(request.policies.len(), 3);
        assert!(matches!(request.policies[0], Policy::Nat(_)));
        assert!(matches!(request.policies[1], Policy::Acl(_)));
        assert!(matches!(request.policies[2], Policy::Qos(_)));
        assert_eq!(request.dns_servers, vec!["1.1.1.1"]);
    }

    #[tokio::test]
    async fn update_appends_policies() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        let manager = manager(&plane);
        let endpoint = manager
            .create(&[NatPolicy::tcp(8080, 40000)], &[])
            .await
            .unwrap();

        let unchanged = manager.update_policies(&endpoint, vec![]).await.unwrap();
        assert_eq!(unchanged, endpoint);
        assert_eq!(plane.state.lock().update_endpoint_calls, 0);

        let updated = manager
            .update_policies(
                &endpoint,
                vec![AclPolicy::allow(Direction::Out, IpProtocol::Icmp)],
            )
            .await
            .unwrap();
        assert_eq!(updated.policies.len(), 2);
        assert_eq!(plane.state.lock().update_endpoint_calls, 1);
    }

    #[tokio::test]
    async fn delete_missing_endpoint_succeeds() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));

        manager(&plane).delete().await.unwrap();

        let state = plane.state.lock();
        assert_eq!(state.detach_calls, 0);
        assert_eq!(state.delete_endpoint_calls, 0);
    }

    #[tokio::test]
    async fn delete_tolerates_gone_container() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        let manager = manager(&plane);
        manager.create(&[], &[]).await.unwrap();
        plane.state.lock().detach_error = Some("gone".to_string());

        manager.delete().await.unwrap();

        let state = plane.state.lock();
        assert_eq!(state.delete_endpoint_calls, 1);
        assert!(state.endpoints.is_empty());
    }

    #[tokio::test]
    async fn delete_runs_even_when_detach_fails() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        let manager = manager(&plane);
        manager.create(&[], &[]).await.unwrap();
        plane.state.lock().detach_error = Some("detach failed".to_string());

        let err = manager.delete().await.unwrap_err();

        assert_eq!(err.to_string(), "detach failed");
        assert_eq!(plane.state.lock().delete_endpoint_calls, 1);
    }

    #[tokio::test]
    async fn delete_reports_both_failures() {
        let plane = Arc::new(FakeControlPlane::with_network(network()));
        let manager = manager(&plane);
        manager.create(&[], &[]).await.unwrap();
        {
            let mut state = plane.state.lock();
            state.detach_error = Some("detach failed".to_string());
            state.delete_endpoint_error = Some("delete failed".to_string());
        }

        let err = manager.delete().await.unwrap_err();

        assert!(matches!(err, PortcullisError::Combined(_)));
        assert_eq!(err.to_string(), "detach failed, delete failed");
    }
}
