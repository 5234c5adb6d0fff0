//! # portcullis-network
//!
//! Per-container virtual networking for portcullis.
//!
//! This crate turns declarative ingress and egress rules into policies on a
//! shared NAT network, manages each container's endpoint on that network and
//! sequences the whole `up`/`down` lifecycle with retries and rollback:
//!
//! - [`NetworkManager`] owns the NAT network and the per-container sequence
//! - [`EndpointManager`] creates, attaches and deletes one container's endpoint
//! - [`Applier`] translates rules into NAT and ACL policies and sets MTUs
//! - [`host`] realizes the capabilities in [`platform`] on a Linux host

#![warn(missing_docs)]

pub mod applier;
pub mod cidr;
pub mod cleanup;
pub mod config;
pub mod endpoint;
pub mod host;
pub mod manager;
pub mod platform;
pub mod policy;
pub mod portpool;
pub mod rules;
pub mod statefile;

#[cfg(test)]
mod fakes;

pub use applier::Applier;
pub use cidr::range_to_cidrs;
pub use config::NetworkConfig;
pub use endpoint::EndpointManager;
pub use manager::{NetworkManager, UpInputs, UpOutputs, UpProperties};
pub use platform::{
    Capabilities, CommandRunner, ControlPlane, Endpoint, Failure, Interface, NetInterface,
    Network, PortAllocator, Subnet, classify,
};
pub use policy::{AclPolicy, NatPolicy, Policy, QosPolicy};
pub use portpool::PortPool;
pub use rules::{IpRange, NetIn, NetOut, PortMapping, PortRange, Protocol};
