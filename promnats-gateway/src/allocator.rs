//! Stable port assignment for discovered identities.

use tracing::{info, warn};

use crate::portmap::PortMap;

/// Extend `existing` with a port for every identity in `discovered`.
///
/// Identities already present keep their port. New ones get the first free
/// port at or above `max(start_port, highest mapped port + 1)`, in discovery
/// order. Identities seen twice are assigned once. When the port range is
/// exhausted the remaining identities are left unmapped.
pub fn allocate<'a, I>(existing: &PortMap, discovered: I, start_port: u16) -> PortMap
where
    I: IntoIterator<Item = &'a str>,
{
    allocate_avoiding(existing, discovered, start_port, &[])
}

/// [`allocate`], never handing out a port listed in `reserved`.
///
/// Port 0 is never handed out either: binding it picks a random port.
pub fn allocate_avoiding<'a, I>(
    existing: &PortMap,
    discovered: I,
    start_port: u16,
    reserved: &[u16],
) -> PortMap
where
    I: IntoIterator<Item = &'a str>,
{
    let mut map = existing.clone();
    let mut next = existing
        .max_port()
        .and_then(|max| max.checked_add(1))
        .map_or(start_port, |after_max| after_max.max(start_port));
    let mut exhausted = false;

    for identity in discovered {
        if map.port_of(identity).is_some() {
            continue;
        }

        if !exhausted {
            match free_port_from(&map, next, reserved) {
                Some(port) => {
                    map.insert(port, identity);
                    info!(port, identity = %identity, "Assigned port");
                    match port.checked_add(1) {
                        Some(p) => next = p,
                        None => exhausted = true,
                    }
                    continue;
                }
                None => exhausted = true,
            }
        }
        warn!(identity = %identity, "No free port left, identity not mapped");
    }

    map
}

fn free_port_from(map: &PortMap, from: u16, reserved: &[u16]) -> Option<u16> {
    (from.max(1)..=u16::MAX).find(|p| !map.contains_port(*p) && !reserved.contains(p))
}
