//! Tunnel identifiers shared with the tunnel creation tooling.
//!
//! Nothing is stored between runs, so the creation and removal tools only
//! agree on keys and port names because both derive them the same way.

use md5::{Digest, Md5};
use std::collections::BTreeMap;

use crate::models::{Node, TeardownTask};

/// Prefix of every VXLAN port created between master and worker
pub const PORT_PREFIX: &str = "vxlan";

/// Separator between the parts of a port name
pub const PORT_SEPARATOR: char = '-';

/// Derive the VXLAN tunnel key for a bridge.
///
/// The key is the first four hex digits of the MD5 digest of the bridge
/// name, which is the same as the first two digest bytes read big-endian.
/// This is namespacing, not security: MD5 is used only because the
/// creation side uses it, and the 16-bit key space means distinct bridges
/// can collide. Collisions are reported by [`key_collisions`], never
/// remapped.
pub fn derive_key(bridge: &str) -> u16 {
    let digest = Md5::digest(bridge.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Port name for the tunnel between the master and `worker` on `bridge`
/// e.g., ("worker-1", "n2br") -> "vxlan-worker-1-n2br"
pub fn port_name(worker: &str, bridge: &str) -> String {
    format!("{PORT_PREFIX}{PORT_SEPARATOR}{worker}{PORT_SEPARATOR}{bridge}")
}

/// Expand workers and bridges into one task per (worker, bridge) pair.
/// Workers are the outer loop and bridges the inner one; input order is kept.
pub fn expand_tasks(workers: &[Node], bridges: &[String]) -> Vec<TeardownTask> {
    let keys: Vec<u16> = bridges.iter().map(|b| derive_key(b)).collect();

    workers
        .iter()
        .flat_map(|worker| {
            bridges.iter().zip(keys.iter()).map(move |(bridge, key)| TeardownTask {
                node: worker.clone(),
                bridge: bridge.clone(),
                key: *key,
                port_name: port_name(&worker.name, bridge),
            })
        })
        .collect()
}

/// Group bridges that share a derived key. Only keys with two or more
/// distinct bridges are returned.
pub fn key_collisions(bridges: &[String]) -> BTreeMap<u16, Vec<String>> {
    let mut by_key: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for bridge in bridges {
        let entry = by_key.entry(derive_key(bridge)).or_default();
        if !entry.contains(bridge) {
            entry.push(bridge.clone());
        }
    }
    by_key.retain(|_, names| names.len() > 1);
    by_key
}
