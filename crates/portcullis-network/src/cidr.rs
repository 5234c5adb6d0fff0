//! Address range to CIDR block decomposition.
//!
//! Egress rules name inclusive address ranges, while packet filters only
//! understand prefixes. [`range_to_cidrs`] bridges the two by emitting, from
//! the low end of the range, the largest aligned block that still fits.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Split the inclusive range `start..=end` into CIDR blocks.
///
/// Blocks are emitted in ascending order, cover the range exactly, and are
/// each the largest block aligned at their first address. A reversed range
/// yields no blocks.
#[must_use]
pub fn range_to_cidrs(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Net> {
    let end = u32::from(end);
    let mut start = u32::from(start);
    let mut blocks = Vec::new();

    while start <= end {
        let mut prefix = 32u8;
        while prefix > 0 {
            let wider = prefix - 1;
            if first(start, wider) != start || last(start, wider) > end {
                break;
            }
            prefix = wider;
        }

        blocks.push(
            Ipv4Net::new(Ipv4Addr::from(start), prefix)
                .unwrap_or_else(|_| unreachable!("prefix length is at most 32")),
        );

        let block_end = last(start, prefix);
        if block_end == u32::MAX {
            break;
        }
        start = block_end + 1;
    }

    blocks
}

fn mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn first(addr: u32, prefix: u8) -> u32 {
    addr & mask(prefix)
}

fn last(addr: u32, prefix: u8) -> u32 {
    (addr & mask(prefix)) | !mask(prefix)
}
