//! Endpoint policies rendered as iptables rules.
//!
//! NAT policies become DNAT rules in the `nat` table; ACL policies become
//! `FORWARD` rules keyed on the container address. Every rule carries a
//! comment naming its endpoint so that the whole set can be found again
//! and removed without keeping a copy of it.

use std::net::Ipv4Addr;

use portcullis_common::PortcullisResult;

use crate::platform::CommandRunner;
use crate::policy::{AclPolicy, Action, Direction, IpProtocol, NatPolicy, Policy};

use super::platform_error;

const NAT_TABLE: &str = "nat";
const FILTER_TABLE: &str = "filter";

/// Comment tagging every rule of an endpoint.
#[must_use]
pub fn endpoint_tag(endpoint_id: &str) -> String {
    format!("pcl-{endpoint_id}")
}

/// Render the rules enforcing `policies` for a container at `ip`.
///
/// Each rule is a full `iptables` argument list. A container without ACLs is
/// cut off in both directions. Otherwise it is deny-by-default: replies to
/// allowed traffic pass, anything not explicitly allowed is dropped.
#[must_use]
pub fn render(endpoint_id: &str, ip: Ipv4Addr, policies: &[Policy]) -> Vec<Vec<String>> {
    let tag = endpoint_tag(endpoint_id);
    let host = format!("{ip}/32");
    let mut rules = Vec::new();

    for policy in policies {
        if let Policy::Nat(nat) = policy {
            rules.extend(nat_rules(nat, ip, &tag));
        }
    }

    let acls: Vec<&AclPolicy> = policies
        .iter()
        .filter_map(|policy| match policy {
            Policy::Acl(acl) => Some(acl),
            Policy::Nat(_) | Policy::Qos(_) => None,
        })
        .collect();

    if acls.is_empty() {
        for acl in [
            AclPolicy::block(Direction::Out, IpProtocol::Any),
            AclPolicy::block(Direction::In, IpProtocol::Any),
        ] {
            rules.push(acl_rule(&acl, &host, &tag));
        }
        return rules;
    }

    for side in ["-d", "-s"] {
        rules.push(forward(
            &[
                side,
                host.as_str(),
                "-m",
                "conntrack",
                "--ctstate",
                "ESTABLISHED,RELATED",
            ],
            "ACCEPT",
            &tag,
        ));
    }

    for acl in acls {
        rules.push(acl_rule(acl, &host, &tag));
    }

    for side in ["-s", "-d"] {
        rules.push(forward(&[side, host.as_str()], "DROP", &tag));
    }

    rules
}

fn nat_rules(nat: &NatPolicy, ip: Ipv4Addr, tag: &str) -> [Vec<String>; 2] {
    let destination = format!("{ip}:{}", nat.internal_port);
    let external = nat.external_port.to_string();

    ["PREROUTING", "OUTPUT"].map(|chain| {
        strings(&[
            "-t",
            NAT_TABLE,
            "-A",
            chain,
            "-p",
            nat.protocol.as_str(),
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "--dport",
            external.as_str(),
            "-m",
            "comment",
            "--comment",
            tag,
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ])
    })
}

fn acl_rule(acl: &AclPolicy, host: &str, tag: &str) -> Vec<String> {
    let (own_side, peer_side) = match acl.direction {
        Direction::In => ("-d", "-s"),
        Direction::Out => ("-s", "-d"),
    };
    let port = match acl.direction {
        Direction::In => acl.local_port,
        Direction::Out => acl.remote_port,
    };

    let mut matches = vec![
        own_side.to_string(),
        host.to_string(),
        "-p".to_string(),
        acl.protocol.as_str().to_string(),
    ];
    if !acl.remote_addresses.is_empty() {
        matches.push(peer_side.to_string());
        matches.push(acl.remote_addresses.clone());
    }
    if let Some(port) = port {
        matches.push("--dport".to_string());
        matches.push(port.to_string());
    }

    let target = match acl.action {
        Action::Allow => "ACCEPT",
        Action::Block => "DROP",
    };
    let matches: Vec<&str> = matches.iter().map(String::as_str).collect();
    forward(&matches, target, tag)
}

fn forward(matches: &[&str], target: &str, tag: &str) -> Vec<String> {
    let mut rule = strings(&["-t", FILTER_TABLE, "-A", "FORWARD"]);
    rule.extend(strings(matches));
    rule.extend(strings(&["-m", "comment", "--comment", tag, "-j", target]));
    rule
}

/// Turn an `iptables -S` listing into the delete commands for every rule
/// tagged `tag`.
#[must_use]
pub fn deletions(table: &str, listing: &str, tag: &str) -> Vec<Vec<String>> {
    listing
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line
                .split_whitespace()
                .map(|t| t.trim_matches('"'))
                .collect();
            if tokens.first() != Some(&"-A") {
                return None;
            }
            if !tokens.windows(2).any(|w| w[0] == "--comment" && w[1] == tag) {
                return None;
            }

            let mut rule = strings(&["-t", table, "-D"]);
            rule.extend(strings(&tokens[1..]));
            Some(rule)
        })
        .collect()
}

/// Install rendered rules in order.
///
/// # Errors
///
/// Returns the first failing command's platform error.
pub async fn apply(runner: &dyn CommandRunner, rules: &[Vec<String>]) -> PortcullisResult<()> {
    for rule in rules {
        runner
            .run_host("iptables", rule)
            .await
            .map_err(platform_error)?;
    }
    Ok(())
}

/// Remove every rule tagged for `endpoint_id` from both tables.
///
/// # Errors
///
/// Returns the platform error of a failed listing or delete.
pub async fn remove(runner: &dyn CommandRunner, endpoint_id: &str) -> PortcullisResult<()> {
    let tag = endpoint_tag(endpoint_id);

    for table in [NAT_TABLE, FILTER_TABLE] {
        let listing = runner
            .run_host("iptables", &strings(&["-t", table, "-S"]))
            .await
            .map_err(platform_error)?;

        let rules = deletions(table, &listing, &tag);
        tracing::debug!(table, tag = %tag, count = rules.len(), "Removing endpoint rules");
        apply(runner, &rules).await?;
    }

    Ok(())
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}
