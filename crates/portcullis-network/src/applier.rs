//! Rule applier.
//!
//! Turns ingress and egress rules into NAT and ACL policies, and applies
//! adapter MTUs. Host ports allocated here are owned by the container handle
//! until [`Applier::cleanup`] releases them.

use std::sync::Arc;

use portcullis_common::{ContainerId, PortcullisError, PortcullisResult};

use crate::cidr::range_to_cidrs;
use crate::platform::{CommandRunner, NetInterface, PortAllocator, container_adapter};
use crate::policy::{AclPolicy, Direction, IpProtocol, NatPolicy};
use crate::rules::{NetIn, NetOut, Protocol};

/// Largest MTU accepted when set explicitly.
pub const MAX_MTU: u32 = 1500;

/// Applies network rules on the shared network.
pub struct Applier {
    network_name: String,
    ports: Arc<dyn PortAllocator>,
    interfaces: Arc<dyn NetInterface>,
    runner: Arc<dyn CommandRunner>,
}

impl Applier {
    /// Create an applier for the shared network `network_name`.
    pub fn new(
        network_name: impl Into<String>,
        ports: Arc<dyn PortAllocator>,
        interfaces: Arc<dyn NetInterface>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            network_name: network_name.into(),
            ports,
            interfaces,
            runner,
        }
    }

    /// Realize an ingress rule.
    ///
    /// Allocates a host port when the rule asks for any port, opens the
    /// container-side listener, and returns the NAT policy with its matching
    /// inbound ACL.
    ///
    /// # Errors
    ///
    /// Returns the allocator's or the command runner's error unchanged.
    pub async fn net_in(
        &self,
        container_id: &ContainerId,
        rule: &NetIn,
    ) -> PortcullisResult<(NatPolicy, AclPolicy)> {
        let external_port = if rule.host_port == 0 {
            self.ports.allocate_port(container_id.as_str(), 0).await?
        } else {
            rule.host_port
        };

        self.open_port(container_id, rule.container_port).await?;

        tracing::debug!(
            container_id = %container_id,
            host_port = external_port,
            container_port = rule.container_port,
            "Mapped ingress port"
        );

        Ok((
            NatPolicy::tcp(rule.container_port, external_port),
            AclPolicy::allow(Direction::In, IpProtocol::Tcp).local_port(rule.container_port),
        ))
    }

    /// Expand an egress rule into outbound allow ACLs.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::InvalidProtocol`],
    /// [`PortcullisError::InvalidIpRange`] or
    /// [`PortcullisError::InvalidPortRange`]; no policies are produced on
    /// error.
    pub fn net_out(&self, rule: &NetOut) -> PortcullisResult<Vec<AclPolicy>> {
        egress_policies(rule)
    }

    /// Apply the container adapter MTU.
    ///
    /// `0` inherits the MTU of the shared network's bridge.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::InvalidMtu`] before issuing any command if
    /// `mtu` is above [`MAX_MTU`], otherwise lookup or command errors.
    pub async fn container_mtu(
        &self,
        container_id: &ContainerId,
        mtu: u32,
    ) -> PortcullisResult<()> {
        let mtu = if mtu == 0 {
            self.interfaces.by_name(&self.network_name).await?.mtu
        } else {
            validate_mtu(mtu)?
        };

        let adapter = container_adapter(container_id);
        self.runner
            .run_container(container_id.as_str(), "ip", &set_mtu_args(&adapter, mtu))
            .await?;

        tracing::debug!(container_id = %container_id, adapter = %adapter, mtu, "Set container MTU");
        Ok(())
    }

    /// Apply the shared network's MTU.
    ///
    /// `0` inherits the MTU of the host's outbound interface.
    ///
    /// # Errors
    ///
    /// Returns [`PortcullisError::InvalidMtu`] before issuing any command if
    /// `mtu` is above [`MAX_MTU`], otherwise lookup or command errors.
    pub async fn nat_mtu(&self, mtu: u32) -> PortcullisResult<()> {
        let mtu = if mtu == 0 {
            let host_ip = self.interfaces.local_ip().await?;
            self.interfaces.by_ip(host_ip).await?.mtu
        } else {
            validate_mtu(mtu)?
        };

        self.runner
            .run_host("ip", &set_mtu_args(&self.network_name, mtu))
            .await?;

        tracing::debug!(network = %self.network_name, mtu, "Set network MTU");
        Ok(())
    }

    /// Release every host port held by the container.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error.
    pub async fn cleanup(&self, container_id: &ContainerId) -> PortcullisResult<()> {
        self.ports.release_all_ports(container_id.as_str()).await
    }

    async fn open_port(&self, container_id: &ContainerId, port: u16) -> PortcullisResult<()> {
        let port = port.to_string();
        let args = [
            "-A",
            "INPUT",
            "-p",
            "tcp",
            "--dport",
            port.as_str(),
            "-j",
            "ACCEPT",
        ]
        .map(String::from);

        self.runner
            .run_container(container_id.as_str(), "iptables", &args)
            .await?;
        Ok(())
    }
}

/// Expand an egress rule into one outbound allow ACL per address block,
/// port and protocol.
///
/// Empty `networks` yields a single empty address field and empty `ports` a
/// single rule without a port. [`Protocol::All`] covers TCP, UDP and ICMP;
/// ICMP rules never carry a port.
///
/// # Errors
///
/// Returns [`PortcullisError::InvalidProtocol`],
/// [`PortcullisError::InvalidIpRange`] or
/// [`PortcullisError::InvalidPortRange`].
pub fn egress_policies(rule: &NetOut) -> PortcullisResult<Vec<AclPolicy>> {
    let protocols: &[IpProtocol] = match rule.protocol {
        Protocol::All => &[IpProtocol::Tcp, IpProtocol::Udp, IpProtocol::Icmp],
        Protocol::Tcp => &[IpProtocol::Tcp],
        Protocol::Udp => &[IpProtocol::Udp],
        Protocol::Icmp => &[IpProtocol::Icmp],
        Protocol::Unknown(value) => return Err(PortcullisError::InvalidProtocol { value }),
    };

    let mut addresses = Vec::new();
    for range in &rule.networks {
        if !range.is_valid() {
            return Err(PortcullisError::InvalidIpRange {
                start: range.start.to_string(),
                end: range.end.to_string(),
            });
        }
        addresses.extend(
            range_to_cidrs(range.start, range.end)
                .iter()
                .map(ToString::to_string),
        );
    }
    if addresses.is_empty() {
        addresses.push(String::new());
    }

    if let Some(range) = rule.ports.iter().find(|range| !range.is_valid()) {
        return Err(PortcullisError::InvalidPortRange {
            start: range.start,
            end: range.end,
        });
    }
    let mut ports: Vec<Option<u16>> = rule
        .ports
        .iter()
        .flat_map(|range| range.ports().map(Some))
        .collect();
    if ports.is_empty() {
        ports.push(None);
    }

    let mut policies = Vec::with_capacity(addresses.len() * ports.len() * protocols.len());
    for address in &addresses {
        for port in &ports {
            for protocol in protocols {
                let remote_port = match protocol {
                    IpProtocol::Icmp | IpProtocol::Any => None,
                    IpProtocol::Tcp | IpProtocol::Udp => *port,
                };
                policies.push(
                    AclPolicy::allow(Direction::Out, *protocol)
                        .remote_port(remote_port)
                        .remote_addresses(address.as_str()),
                );
            }
        }
    }

    Ok(policies)
}

pub(crate) fn validate_mtu(mtu: u32) -> PortcullisResult<u32> {
    if mtu > MAX_MTU {
        return Err(PortcullisError::InvalidMtu { mtu });
    }
    Ok(mtu)
}

fn set_mtu_args(device: &str, mtu: u32) -> [String; 6] {
    let mtu = mtu.to_string();
    ["link", "set", "dev", device, "mtu", mtu.as_str()].map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeInterfaces, FakePortAllocator, FakeRunner};
    use crate::rules::{IpRange, PortRange};

    struct Harness {
        ports: Arc<FakePortAllocator>,
        interfaces: Arc<FakeInterfaces>,
        runner: Arc<FakeRunner>,
        applier: Applier,
    }

    fn harness_with(runner: FakeRunner) -> Harness {
        let ports = Arc::new(FakePortAllocator::default());
        let interfaces = Arc::new(FakeInterfaces::default().with_interface("pcl-nat", 1450));
        let runner = Arc::new(runner);
        let applier = Applier::new(
            "pcl-nat",
            ports.clone(),
            interfaces.clone(),
            runner.clone(),
        );
        Harness {
            ports,
            interfaces,
            runner,
            applier,
        }
    }

    fn web() -> ContainerId {
        ContainerId::new("web-1").unwrap()
    }

    fn harness() -> Harness {
        harness_with(FakeRunner::default())
    }

    fn out_rule(protocol: Protocol, networks: Vec<IpRange>, ports: Vec<PortRange>) -> NetOut {
        NetOut {
            protocol,
            networks,
            ports,
        }
    }

    #[tokio::test]
    async fn net_in_allocates_when_host_port_is_zero() {
        let h = harness();
        let (nat, acl) = h
            .applier
            .net_in(&web(), &NetIn {
                host_port: 0,
                container_port: 8080,
            })
            .await
            .unwrap();

        assert_eq!(nat, NatPolicy::tcp(8080, 40000));
        assert_eq!(acl.direction, Direction::In);
        assert_eq!(acl.local_port, Some(8080));
        assert_eq!(h.ports.state.lock().allocate_calls, 1);
        assert_eq!(
            h.runner.commands(),
            vec!["web-1: iptables -A INPUT -p tcp --dport 8080 -j ACCEPT"]
        );
    }

    #[tokio::test]
    async fn net_in_keeps_explicit_host_port() {
        let h = harness();
        let (nat, _) = h
            .applier
            .net_in(&web(), &NetIn {
                host_port: 2222,
                container_port: 22,
            })
            .await
            .unwrap();

        assert_eq!(nat.external_port, 2222);
        assert_eq!(nat.internal_port, 22);
        assert_eq!(h.ports.state.lock().allocate_calls, 0);
    }

    #[tokio::test]
    async fn net_in_propagates_allocator_errors() {
        let h = harness();
        h.ports.state.lock().allocate_error = Some("port pool exhausted".to_string());

        let err = h
            .applier
            .net_in(&web(), &NetIn {
                host_port: 0,
                container_port: 8080,
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("port pool exhausted"));
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn net_in_propagates_listener_errors() {
        let h = harness_with(FakeRunner::failing_on("iptables", "netns gone"));
        let err = h
            .applier
            .net_in(&web(), &NetIn {
                host_port: 0,
                container_port: 8080,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PortcullisError::CommandFailed { .. }));
        assert_eq!(h.runner.commands().len(), 1);
    }

    #[test]
    fn all_protocols_expand_to_three_policies() {
        let rule = out_rule(
            Protocol::All,
            vec![IpRange::single("8.8.8.8".parse().unwrap())],
            vec![PortRange::single(53)],
        );
        let policies = egress_policies(&rule).unwrap();

        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].protocol, IpProtocol::Tcp);
        assert_eq!(policies[0].remote_port, Some(53));
        assert_eq!(policies[1].protocol, IpProtocol::Udp);
        assert_eq!(policies[1].remote_port, Some(53));
        assert_eq!(policies[2].protocol, IpProtocol::Icmp);
        assert_eq!(policies[2].remote_port, None);
        assert!(
            policies
                .iter()
                .all(|p| p.remote_addresses == "8.8.8.8/32" && p.direction == Direction::Out)
        );
    }

    #[test]
    fn unspecified_networks_and_ports_match_anything() {
        let policies = egress_policies(&out_rule(Protocol::Tcp, vec![], vec![])).unwrap();

        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].remote_addresses, "");
        assert_eq!(policies[0].remote_port, None);
    }

    #[test]
    fn every_block_and_port_gets_a_policy() {
        let rule = out_rule(
            Protocol::Udp,
            vec![IpRange {
                start: "10.0.0.1".parse().unwrap(),
                end: "10.0.0.2".parse().unwrap(),
            }],
            vec![
                PortRange { start: 80, end: 81 },
                PortRange::single(443),
            ],
        );
        let policies = egress_policies(&rule).unwrap();

        // 10.0.0.1/32 and 10.0.0.2/32, times three ports.
        assert_eq!(policies.len(), 6);
        assert_eq!(policies[0].remote_addresses, "10.0.0.1/32");
        assert_eq!(policies[5].remote_addresses, "10.0.0.2/32");
        assert_eq!(policies[5].remote_port, Some(443));
    }

    #[test]
    fn icmp_ignores_ports() {
        let rule = out_rule(Protocol::Icmp, vec![], vec![PortRange { start: 1, end: 3 }]);
        let policies = egress_policies(&rule).unwrap();

        assert!(policies.iter().all(|p| p.remote_port.is_none()));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let rule = out_rule(Protocol::Unknown(7), vec![], vec![]);
        let err = egress_policies(&rule).unwrap_err();
        assert_eq!(err.to_string(), "invalid protocol: 7");
    }

    #[test]
    fn reversed_range_is_rejected() {
        let rule = out_rule(
            Protocol::Tcp,
            vec![IpRange {
                start: "10.0.0.9".parse().unwrap(),
                end: "10.0.0.1".parse().unwrap(),
            }],
            vec![],
        );
        assert!(matches!(
            egress_policies(&rule),
            Err(PortcullisError::InvalidIpRange { .. })
        ));
    }

    #[test]
    fn reversed_or_open_ended_port_range_is_rejected() {
        for range in [
            PortRange { start: 443, end: 80 },
            PortRange {
                start: 8080,
                end: 0,
            },
        ] {
            let rule = out_rule(Protocol::Tcp, vec![], vec![PortRange::single(53), range]);
            let err = egress_policies(&rule).unwrap_err();
            assert!(matches!(err, PortcullisError::InvalidPortRange { .. }));
        }

        // ICMP ignores ports but the request is still malformed.
        let rule = out_rule(Protocol::Icmp, vec![], vec![PortRange { start: 9, end: 1 }]);
        assert_eq!(
            egress_policies(&rule).unwrap_err().to_string(),
            "invalid port range: 9-1"
        );
    }

    #[tokio::test]
    async fn explicit_container_mtu_is_applied() {
        let h = harness();
        h.applier.container_mtu(&web(), 1400).await.unwrap();

        let adapter = container_adapter(&web());
        assert_eq!(
            h.runner.commands(),
            vec![format!("web-1: ip link set dev {adapter} mtu 1400")]
        );
        assert!(h.interfaces.lookups.lock().is_empty());
    }

    #[tokio::test]
    async fn zero_container_mtu_inherits_network_mtu() {
        let h = harness();
        h.applier.container_mtu(&web(), 0).await.unwrap();

        assert_eq!(*h.interfaces.lookups.lock(), vec!["name:pcl-nat"]);
        assert!(h.runner.commands()[0].ends_with("mtu 1450"));
    }

    #[tokio::test]
    async fn oversized_mtu_is_rejected_without_commands() {
        let h = harness();
        let err = h.applier.container_mtu(&web(), 1501).await.unwrap_err();

        assert_eq!(err.to_string(), "invalid mtu specified: 1501");
        assert!(h.runner.commands().is_empty());

        let err = h.applier.nat_mtu(9000).await.unwrap_err();
        assert!(err.to_string().contains("9000"));
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn zero_nat_mtu_inherits_host_interface() {
        let h = harness();
        h.applier.nat_mtu(0).await.unwrap();

        assert_eq!(*h.interfaces.lookups.lock(), vec!["ip:10.0.0.5"]);
        assert_eq!(
            h.runner.commands(),
            vec!["host: ip link set dev pcl-nat mtu 9001"]
        );
    }

    #[tokio::test]
    async fn cleanup_is_repeatable() {
        let h = harness();
        h.applier.cleanup(&web()).await.unwrap();
        h.applier.cleanup(&web()).await.unwrap();
        assert_eq!(h.ports.state.lock().release_calls, 2);
    }
}
