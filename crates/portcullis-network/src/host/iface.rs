//! Local interface lookup.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use portcullis_common::{PortcullisError, PortcullisResult};
use tokio::net::UdpSocket;

use crate::platform::{CommandRunner, Interface, NetInterface};

use super::platform_error;

/// Address used to pick the outbound interface. Nothing is sent to it.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Interface lookup backed by `ip -o` listings.
pub struct HostInterfaces {
    runner: Arc<dyn CommandRunner>,
}

impl HostInterfaces {
    /// Create a lookup running `ip` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NetInterface for HostInterfaces {
    async fn by_name(&self, name: &str) -> PortcullisResult<Interface> {
        let args = ["-o", "link", "show", "dev", name].map(String::from);
        let listing = self
            .runner
            .run_host("ip", &args)
            .await
            .map_err(platform_error)?;

        parse_links(&listing)
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| PortcullisError::platform(format!("interface {name} not found")))
    }

    async fn by_ip(&self, ip: Ipv4Addr) -> PortcullisResult<Interface> {
        let args = ["-o", "-4", "addr", "show"].map(String::from);
        let listing = self
            .runner
            .run_host("ip", &args)
            .await
            .map_err(platform_error)?;
        let addresses = parse_ipv4_addresses(&listing);

        let name = addresses
            .iter()
            .find(|(_, net)| net.addr() == ip)
            .or_else(|| addresses.iter().find(|(_, net)| net.contains(&ip)))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                PortcullisError::platform(format!("interface with address {ip} not found"))
            })?;

        self.by_name(&name).await
    }

    async fn local_ip(&self) -> PortcullisResult<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(PROBE_ADDR).await?;

        match socket.local_addr()? {
            SocketAddr::V4(addr) if !addr.ip().is_loopback() => Ok(*addr.ip()),
            other => Err(PortcullisError::platform(format!(
                "no non-loopback IPv4 address found (got {other})"
            ))),
        }
    }
}

/// Parse `ip -o link show` output.
pub fn parse_links(listing: &str) -> Vec<Interface> {
    listing.lines().filter_map(parse_link).collect()
}

fn parse_link(line: &str) -> Option<Interface> {
    let (index, rest) = line.split_once(": ")?;
    let (name, rest) = rest.split_once(": ")?;
    let name = name.split('@').next()?;

    let mut tokens = rest.split_whitespace();
    tokens.find(|t| *t == "mtu")?;
    let mtu = tokens.next()?.parse().ok()?;

    Some(Interface {
        name: name.to_string(),
        index: index.trim().parse().ok()?,
        mtu,
    })
}

/// Parse `ip -o -4 addr show` output into `(interface, address)` pairs.
pub fn parse_ipv4_addresses(listing: &str) -> Vec<(String, Ipv4Net)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.next()?;
            let name = tokens.next()?;
            tokens.find(|t| *t == "inet")?;
            let net: Ipv4Net = tokens.next()?.parse().ok()?;
            Some((name.split('@').next()?.to_string(), net))
        })
        .collect()
}
