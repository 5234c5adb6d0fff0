//! Platform policy objects.
//!
//! These are the address-translation, packet-filter and bandwidth policies
//! an endpoint carries. They are built by the rule applier and enforced by
//! the host control plane.

use serde::{Deserialize, Serialize};

/// IP protocol with its assigned number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum IpProtocol {
    /// ICMP (1).
    Icmp,
    /// TCP (6).
    Tcp,
    /// UDP (17).
    Udp,
    /// Every protocol (256, outside the assigned range).
    Any,
}

impl IpProtocol {
    /// Assigned protocol number.
    #[must_use]
    pub const fn number(self) -> u16 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Any => 256,
        }
    }

    /// Lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Any => "all",
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<IpProtocol> for u16 {
    fn from(protocol: IpProtocol) -> Self {
        protocol.number()
    }
}

impl TryFrom<u16> for IpProtocol {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Icmp),
            6 => Ok(Self::Tcp),
            17 => Ok(Self::Udp),
            256 => Ok(Self::Any),
            other => Err(format!("unsupported ip protocol number: {other}")),
        }
    }
}

/// Traffic direction relative to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Toward the container.
    In,
    /// Away from the container.
    Out,
}

/// Filter verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Let matching traffic through.
    Allow,
    /// Drop matching traffic.
    Block,
}

/// Host port to container port translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NatPolicy {
    /// Translated protocol.
    pub protocol: IpProtocol,
    /// Port inside the container.
    pub internal_port: u16,
    /// Port on the host.
    pub external_port: u16,
}

impl NatPolicy {
    /// TCP translation from `external_port` to `internal_port`.
    #[must_use]
    pub fn tcp(internal_port: u16, external_port: u16) -> Self {
        Self {
            protocol: IpProtocol::Tcp,
            internal_port,
            external_port,
        }
    }
}

/// Directional packet filter rule.
///
/// Empty address fields and absent ports match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclPolicy {
    /// Matched protocol.
    pub protocol: IpProtocol,
    /// Matched direction.
    pub direction: Direction,
    /// Verdict.
    pub action: Action,
    /// Container-side port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Peer-side port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Container-side addresses.
    #[serde(default)]
    pub local_addresses: String,
    /// Peer-side addresses.
    #[serde(default)]
    pub remote_addresses: String,
}

impl AclPolicy {
    /// Create an allow rule.
    #[must_use]
    pub fn allow(direction: Direction, protocol: IpProtocol) -> Self {
        Self {
            protocol,
            direction,
            action: Action::Allow,
            local_port: None,
            remote_port: None,
            local_addresses: String::new(),
            remote_addresses: String::new(),
        }
    }

    /// Create a block rule.
    #[must_use]
    pub fn block(direction: Direction, protocol: IpProtocol) -> Self {
        Self {
            action: Action::Block,
            ..Self::allow(direction, protocol)
        }
    }

    /// Set local port.
    #[must_use]
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Set remote port, if any.
    #[must_use]
    pub fn remote_port(mut self, port: Option<u16>) -> Self {
        self.remote_port = port;
        self
    }

    /// Set remote addresses.
    #[must_use]
    pub fn remote_addresses(mut self, addresses: impl Into<String>) -> Self {
        self.remote_addresses = addresses.into();
        self
    }
}

/// Outbound bandwidth cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QosPolicy {
    /// Bytes per second.
    pub maximum_outgoing_bandwidth_in_bytes: u64,
}

/// Any policy an endpoint can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Policy {
    /// Address translation.
    #[serde(rename = "NAT")]
    Nat(NatPolicy),
    /// Packet filter.
    #[serde(rename = "ACL")]
    Acl(AclPolicy),
    /// Bandwidth cap.
    #[serde(rename = "QOS")]
    Qos(QosPolicy),
}

impl From<NatPolicy> for Policy {
    fn from(policy: NatPolicy) -> Self {
        Self::Nat(policy)
    }
}

impl From<AclPolicy> for Policy {
    fn from(policy: AclPolicy) -> Self {
        Self::Acl(policy)
    }
}

impl From<QosPolicy> for Policy {
    fn from(policy: QosPolicy) -> Self {
        Self::Qos(policy)
    }
}
