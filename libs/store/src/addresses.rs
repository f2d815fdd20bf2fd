//! Tunnel address allocation.
//!
//! Given a pool CIDR, a starting offset and the set of already-taken
//! addresses, the allocator scans forward from the offset for the first free
//! host and falls back to scanning backward from `offset - 1` toward the
//! network address. The network address, the first host (conventional
//! gateway) and the last host (broadcast) are never assignable.
//!
//! Callers must hold the store lock across the scan-and-insert, which is what
//! makes two concurrent allocators return distinct addresses.

use ip_network::{Ipv4Network, Ipv6Network};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

pub fn allocate_ipv4(
    pool: Ipv4Network,
    offset: u32,
    taken: &HashSet<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let size = 1u128 << (32 - pool.netmask());
    let base = u32::from(pool.network_address()) as u128;

    scan(size, offset as u128, |index| {
        let candidate = Ipv4Addr::from((base + index) as u32);

        (!taken.contains(&candidate)).then_some(candidate)
    })
}

pub fn allocate_ipv6(
    pool: Ipv6Network,
    offset: u128,
    taken: &HashSet<Ipv6Addr>,
) -> Option<Ipv6Addr> {
    let size = match pool.netmask() {
        0 => u128::MAX, // Effectively unbounded; the last host is unreachable anyway.
        prefix => 1u128 << (128 - prefix),
    };
    let base = u128::from(pool.network_address());

    scan(size, offset, |index| {
        let candidate = Ipv6Addr::from(base + index);

        (!taken.contains(&candidate)).then_some(candidate)
    })
}

/// Scans assignable host indices `[2, size - 2]`: forward from `offset`, then
/// backward from `offset - 1`.
fn scan<T>(size: u128, offset: u128, mut check: impl FnMut(u128) -> Option<T>) -> Option<T> {
    if size < 4 {
        // Nothing assignable once network, gateway and broadcast are reserved.
        return None;
    }

    let first = 2u128;
    let last = size - 2;

    let start = offset.clamp(first, last);

    for index in start..=last {
        if let Some(found) = check(index) {
            return Some(found);
        }
    }

    let mut index = start;

    while index > first {
        index -= 1;

        if let Some(found) = check(index) {
            return Some(found);
        }
    }

    None
}
