//! Declarative ingress and egress rules.
//!
//! These are the shapes callers hand to `up`: ingress rules ask for a host
//! port to be mapped onto a container port, egress rules whitelist outbound
//! traffic by protocol, address range and port range.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Protocol selector of an egress rule.
///
/// Values arrive as small integers on the wire. Unknown values are kept so
/// that they can be rejected when the rule is applied rather than when the
/// request is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Protocol {
    /// TCP, UDP and ICMP.
    #[default]
    All,
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// ICMP only.
    Icmp,
    /// A value outside the known set.
    Unknown(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::All,
            1 => Self::Tcp,
            2 => Self::Udp,
            3 => Self::Icmp,
            other => Self::Unknown(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::All => 0,
            Protocol::Tcp => 1,
            Protocol::Udp => 2,
            Protocol::Icmp => 3,
            Protocol::Unknown(value) => value,
        }
    }
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    /// First address.
    pub start: Ipv4Addr,
    /// Last address.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// Range covering a single address.
    #[must_use]
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// Whether `start <= end`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        u32::from(self.start) <= u32::from(self.end)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    #[serde(default)]
    pub start: u16,
    /// Last port.
    #[serde(default)]
    pub end: u16,
}

impl PortRange {
    /// Range covering a single port.
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether `start <= end`. An omitted `end` decodes as 0, so a range
    /// giving only `start` is invalid unless it starts at 0.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Every port in the range, in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ingress rule: expose `container_port` on `host_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetIn {
    /// Host port, 0 to allocate one.
    #[serde(default)]
    pub host_port: u16,
    /// Port inside the container.
    #[serde(default)]
    pub container_port: u16,
}

/// Egress rule: allow outbound traffic matching protocol, networks and ports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetOut {
    /// Protocol to whitelist.
    #[serde(default)]
    pub protocol: Protocol,
    /// Destination address ranges; empty means any address.
    #[serde(default)]
    pub networks: Vec<IpRange>,
    /// Destination port ranges; empty means any port. Ignored for ICMP.
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

/// A realized ingress mapping, echoed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}
