//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use parking_lot::Mutex;
use portcullis_common::{PortcullisError, PortcullisResult};

use crate::platform::{
    CommandRunner, ControlPlane, Endpoint, EndpointRequest, Interface, NetInterface, Network,
    NetworkRequest, PortAllocator, container_not_found, endpoint_not_found, network_not_found,
};

/// Control plane backed by vectors, with scripted failures.
#[derive(Default)]
pub struct FakeControlPlane {
    pub state: Mutex<PlaneState>,
}

#[derive(Default)]
pub struct PlaneState {
    pub networks: Vec<Network>,
    pub endpoints: Vec<Endpoint>,
    pub next_id: u32,

    pub create_network_calls: usize,
    pub delete_network_calls: usize,
    pub network_lookups: usize,
    pub create_endpoint_calls: usize,
    pub update_endpoint_calls: usize,
    pub delete_endpoint_calls: usize,
    pub attach_calls: usize,
    pub detach_calls: usize,

    /// Popped once per create attempt; `None` means succeed.
    pub create_endpoint_results: VecDeque<Option<String>>,
    /// Returned by every create_network call.
    pub create_network_error: Option<String>,
    /// Network that appears once create_network has failed, mimicking a racer.
    pub raced_network: Option<Network>,
    /// Number of lookups after which `raced_network` becomes visible.
    pub raced_visible_after: usize,
    pub lookup_error: Option<String>,
    pub attach_error: Option<String>,
    pub detach_error: Option<String>,
    pub delete_endpoint_error: Option<String>,
    pub update_endpoint_error: Option<String>,
    pub last_request: Option<EndpointRequest>,
}

impl FakeControlPlane {
    pub fn with_network(network: Network) -> Self {
        let plane = Self::default();
        plane.state.lock().networks.push(network);
        plane
    }

    fn fresh_id(state: &mut PlaneState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn network_by_name(&self, name: &str) -> PortcullisResult<Network> {
        let mut state = self.state.lock();
        state.network_lookups += 1;

        if let Some(message) = &state.lookup_error {
            return Err(PortcullisError::platform(message.clone()));
        }

        if state.network_lookups > state.raced_visible_after {
            if let Some(network) = state.raced_network.take() {
                state.networks.push(network);
            }
        }

        state
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| network_not_found(name))
    }

    async fn create_network(&self, request: &NetworkRequest) -> PortcullisResult<Network> {
        let mut state = self.state.lock();
        state.create_network_calls += 1;

        if let Some(message) = &state.create_network_error {
            return Err(PortcullisError::platform(message.clone()));
        }

        let network = Network {
            id: Self::fresh_id(&mut state, "net"),
            name: request.name.clone(),
            subnets: request.subnets.clone(),
            dns_servers: request.dns_servers.clone(),
        };
        state.networks.push(network.clone());
        Ok(network)
    }

    async fn delete_network(&self, network: &Network) -> PortcullisResult<()> {
        let mut state = self.state.lock();
        state.delete_network_calls += 1;
        state.networks.retain(|n| n.id != network.id);
        Ok(())
    }

    async fn create_endpoint(&self, request: &EndpointRequest) -> PortcullisResult<Endpoint> {
        let mut state = self.state.lock();
        state.create_endpoint_calls += 1;
        state.last_request = Some(request.clone());

        if let Some(Some(message)) = state.create_endpoint_results.pop_front() {
            return Err(PortcullisError::platform(message));
        }

        let endpoint = Endpoint {
            id: Self::fresh_id(&mut state, "ep"),
            name: request.name.clone(),
            virtual_network: request.virtual_network.clone(),
            ip_address: Some(Ipv4Addr::new(172, 30, 0, 2)),
            policies: request.policies.clone(),
            dns_servers: request.dns_servers.clone(),
        };
        state.endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    async fn endpoint_by_id(&self, id: &str) -> PortcullisResult<Endpoint> {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| endpoint_not_found(id))
    }

    async fn endpoint_by_name(&self, name: &str) -> PortcullisResult<Endpoint> {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| endpoint_not_found(name))
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<Endpoint> {
        let mut state = self.state.lock();
        state.update_endpoint_calls += 1;

        if let Some(message) = &state.update_endpoint_error {
            return Err(PortcullisError::platform(message.clone()));
        }

        let stored = state
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint.id)
            .ok_or_else(|| endpoint_not_found(&endpoint.id))?;
        *stored = endpoint.clone();
        Ok(endpoint.clone())
    }

    async fn delete_endpoint(&self, endpoint: &Endpoint) -> PortcullisResult<()> {
        let mut state = self.state.lock();
        state.delete_endpoint_calls += 1;

        if let Some(message) = &state.delete_endpoint_error {
            return Err(PortcullisError::platform(message.clone()));
        }

        state.endpoints.retain(|e| e.id != endpoint.id);
        Ok(())
    }

    async fn hot_attach_endpoint(
        &self,
        container_id: &str,
        _endpoint_id: &str,
    ) -> PortcullisResult<()> {
        let mut state = self.state.lock();
        state.attach_calls += 1;

        match &state.attach_error {
            Some(message) if message == "gone" => Err(container_not_found(container_id)),
            Some(message) => Err(PortcullisError::platform(message.clone())),
            None => Ok(()),
        }
    }

    async fn hot_detach_endpoint(
        &self,
        container_id: &str,
        _endpoint_id: &str,
    ) -> PortcullisResult<()> {
        let mut state = self.state.lock();
        state.detach_calls += 1;

        match &state.detach_error {
            Some(message) if message == "gone" => Err(container_not_found(container_id)),
            Some(message) => Err(PortcullisError::platform(message.clone())),
            None => Ok(()),
        }
    }
}

/// Sequential port allocator.
pub struct FakePortAllocator {
    pub state: Mutex<AllocatorState>,
}

#[derive(Default)]
pub struct AllocatorState {
    pub next_port: u16,
    pub allocate_calls: usize,
    pub release_calls: usize,
    pub allocate_error: Option<String>,
    pub release_error: Option<String>,
}

impl Default for FakePortAllocator {
    fn default() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next_port: 40000,
                ..AllocatorState::default()
            }),
        }
    }
}

#[async_trait]
impl PortAllocator for FakePortAllocator {
    async fn allocate_port(&self, _handle: &str, preferred: u16) -> PortcullisResult<u16> {
        let mut state = self.state.lock();
        state.allocate_calls += 1;

        if let Some(message) = &state.allocate_error {
            return Err(PortcullisError::PortAllocation {
                operation: "acquire port".to_string(),
                message: message.clone(),
            });
        }
        if preferred != 0 {
            return Ok(preferred);
        }

        let port = state.next_port;
        state.next_port += 1;
        Ok(port)
    }

    async fn release_all_ports(&self, _handle: &str) -> PortcullisResult<()> {
        let mut state = self.state.lock();
        state.release_calls += 1;

        match &state.release_error {
            Some(message) => Err(PortcullisError::PortAllocation {
                operation: "release ports".to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Fixed interface table.
pub struct FakeInterfaces {
    pub by_name: HashMap<String, u32>,
    pub host_mtu: u32,
    pub local_ip: Ipv4Addr,
    pub lookups: Mutex<Vec<String>>,
}

impl Default for FakeInterfaces {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            host_mtu: 9001,
            local_ip: Ipv4Addr::new(10, 0, 0, 5),
            lookups: Mutex::new(Vec::new()),
        }
    }
}

impl FakeInterfaces {
    pub fn with_interface(mut self, name: &str, mtu: u32) -> Self {
        self.by_name.insert(name.to_string(), mtu);
        self
    }
}

#[async_trait]
impl NetInterface for FakeInterfaces {
    async fn by_name(&self, name: &str) -> PortcullisResult<Interface> {
        self.lookups.lock().push(format!("name:{name}"));
        self.by_name
            .get(name)
            .map(|mtu| Interface {
                name: name.to_string(),
                index: 3,
                mtu: *mtu,
            })
            .ok_or_else(|| PortcullisError::platform(format!("interface {name} not found")))
    }

    async fn by_ip(&self, ip: Ipv4Addr) -> PortcullisResult<Interface> {
        self.lookups.lock().push(format!("ip:{ip}"));
        if ip == self.local_ip {
            Ok(Interface {
                name: "eth0".to_string(),
                index: 2,
                mtu: self.host_mtu,
            })
        } else {
            Err(PortcullisError::platform(format!(
                "no interface with address {ip} not found"
            )))
        }
    }

    async fn local_ip(&self) -> PortcullisResult<Ipv4Addr> {
        Ok(self.local_ip)
    }
}

/// Records every command, answers those matching a scripted output and
/// fails those matching a pattern.
#[derive(Default)]
pub struct FakeRunner {
    pub commands: Mutex<Vec<String>>,
    pub fail_matching: Mutex<Option<(String, String)>>,
    pub outputs: Mutex<Vec<(String, String)>>,
}

impl FakeRunner {
    pub fn failing_on(pattern: &str, message: &str) -> Self {
        let runner = Self::default();
        *runner.fail_matching.lock() = Some((pattern.to_string(), message.to_string()));
        runner
    }

    pub fn with_output(self, pattern: &str, output: &str) -> Self {
        self.outputs
            .lock()
            .push((pattern.to_string(), output.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn record(&self, line: String) -> PortcullisResult<String> {
        self.commands.lock().push(line.clone());

        match &*self.fail_matching.lock() {
            Some((pattern, message)) if line.contains(pattern.as_str()) => {
                Err(PortcullisError::CommandFailed {
                    command: line,
                    message: message.clone(),
                })
            }
            _ => Ok(self
                .outputs
                .lock()
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default()),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run_host(&self, program: &str, args: &[String]) -> PortcullisResult<String> {
        self.record(format!("host: {program} {}", args.join(" ")))
    }

    async fn run_container(
        &self,
        container_id: &str,
        program: &str,
        args: &[String],
    ) -> PortcullisResult<String> {
        self.record(format!("{container_id}: {program} {}", args.join(" ")))
    }
}
