//! Port allocation
//!
//! Three allocation modes share one "in use" definition (any port committed
//! to a chain_node or forward_port row on the node):
//! - chain allocation picks the lowest free candidate of the node's range,
//!   scoped to one topology build via a provisional reservation set;
//! - forward ingress intersects the available sets of every entry node and
//!   picks at random, so a multi-entry forward gets one port number;
//! - peer-share allocation additionally counts active runtime reservations
//!   and is bounded by the share's port range.

use crate::error::PortAllocError;
use portlink_db::entities::{chain_node, forward_port, node, peer_share, peer_share_runtime};
use rand::seq::SliceRandom;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::collections::{BTreeSet, HashMap, HashSet};

pub const DEFAULT_PORT_RANGE: &str = "1000-65535";
/// Ingress fallback when a tunnel has no entry rows to intersect.
pub const FALLBACK_INGRESS_PORT: u16 = 10000;

/// Ports handed out earlier in the same topology build, keyed by node.
pub type Reservations = HashMap<i64, BTreeSet<u16>>;

/// Expand a range spec ("1000-2000,3005") into ascending candidates.
/// Malformed fragments are skipped; reversed ranges are normalized.
pub fn parse_port_range_spec(spec: &str) -> Vec<u16> {
    let mut set = BTreeSet::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<u16>(), end.trim().parse::<u16>())
            else {
                continue;
            };
            if start == 0 || end == 0 {
                continue;
            }
            let (lo, hi) = if end < start { (end, start) } else { (start, end) };
            set.extend(lo..=hi);
        } else if let Ok(port) = part.parse::<u16>() {
            if port > 0 {
                set.insert(port);
            }
        }
    }
    set.into_iter().collect()
}

/// Ports already committed on a node, optionally ignoring one tunnel's own
/// chain rows (needed when re-allocating during an update of that tunnel).
pub async fn used_ports_on_node<C: ConnectionTrait>(
    conn: &C,
    node_id: i64,
    exclude_tunnel: Option<i64>,
) -> Result<HashSet<u16>, PortAllocError> {
    let mut used = HashSet::new();

    let mut chain_query = chain_node::Entity::find()
        .filter(chain_node::Column::NodeId.eq(node_id))
        .filter(chain_node::Column::Port.is_not_null());
    if let Some(tunnel_id) = exclude_tunnel {
        chain_query = chain_query.filter(chain_node::Column::TunnelId.ne(tunnel_id));
    }
    for row in chain_query.all(conn).await? {
        if let Some(port) = row.port {
            if port > 0 {
                used.insert(port as u16);
            }
        }
    }

    let forwards = forward_port::Entity::find()
        .filter(forward_port::Column::NodeId.eq(node_id))
        .all(conn)
        .await?;
    for row in forwards {
        if row.port > 0 {
            used.insert(row.port as u16);
        }
    }

    Ok(used)
}

/// Pick the first free port of the node's range for a chain hop/exit.
pub async fn pick_node_port<C: ConnectionTrait>(
    conn: &C,
    node: &node::Model,
    reserved: &mut Reservations,
    exclude_tunnel: Option<i64>,
) -> Result<u16, PortAllocError> {
    let candidates = parse_port_range_spec(&node.port_range);
    if candidates.is_empty() {
        return Err(PortAllocError::Exhausted);
    }

    let used = used_ports_on_node(conn, node.id, exclude_tunnel).await?;
    let node_reserved = reserved.entry(node.id).or_default();

    for candidate in candidates {
        if used.contains(&candidate) || node_reserved.contains(&candidate) {
            continue;
        }
        node_reserved.insert(candidate);
        return Ok(candidate);
    }
    Err(PortAllocError::Exhausted)
}

/// Pick one ingress port available on every entry node of a tunnel,
/// uniformly at random from the intersection. `None` when the tunnel has no
/// entry rows (callers fall back to [`FALLBACK_INGRESS_PORT`]).
pub async fn pick_forward_ingress_port<C: ConnectionTrait>(
    conn: &C,
    entry_node_ids: &[i64],
) -> Result<Option<u16>, PortAllocError> {
    if entry_node_ids.is_empty() {
        return Ok(None);
    }

    let mut common: Option<Vec<u16>> = None;
    for &node_id in entry_node_ids {
        let Some(node) = node::Entity::find_by_id(node_id).one(conn).await? else {
            continue;
        };
        let spec = if node.port_range.trim().is_empty() {
            DEFAULT_PORT_RANGE
        } else {
            node.port_range.as_str()
        };
        let used = used_ports_on_node(conn, node_id, None).await?;
        let available: Vec<u16> = parse_port_range_spec(spec)
            .into_iter()
            .filter(|p| !used.contains(p))
            .collect();

        common = Some(match common {
            None => available,
            Some(previous) => {
                let set: HashSet<u16> = available.into_iter().collect();
                previous.into_iter().filter(|p| set.contains(p)).collect()
            }
        });
        if common.as_ref().is_some_and(Vec::is_empty) {
            break;
        }
    }

    Ok(common
        .filter(|c| !c.is_empty())
        .and_then(|c| c.choose(&mut rand::thread_rng()).copied()))
}

/// Serving-side allocation within a peer share's range. Active runtime
/// reservations count as used even before their role is applied.
pub async fn pick_peer_share_port<C: ConnectionTrait>(
    conn: &C,
    share: &peer_share::Model,
    requested_port: u16,
) -> Result<u16, PortAllocError> {
    let (start, end) = (share.port_range_start, share.port_range_end);
    if start <= 0 || end <= 0 || end < start {
        return Err(PortAllocError::Exhausted);
    }
    let (start, end) = (start as u16, end as u16);

    let mut used = used_ports_on_node(conn, share.node_id, None).await?;
    let runtimes = peer_share_runtime::Entity::find()
        .filter(peer_share_runtime::Column::ShareId.eq(share.id))
        .filter(peer_share_runtime::Column::NodeId.eq(share.node_id))
        .filter(peer_share_runtime::Column::Status.eq(1))
        .all(conn)
        .await?;
    for runtime in runtimes {
        if runtime.port > 0 {
            used.insert(runtime.port as u16);
        }
    }

    if requested_port > 0 {
        if requested_port < start || requested_port > end {
            return Err(PortAllocError::OutOfRange);
        }
        if used.contains(&requested_port) {
            return Err(PortAllocError::Exhausted);
        }
        return Ok(requested_port);
    }

    (start..=end)
        .find(|p| !used.contains(p))
        .ok_or(PortAllocError::Exhausted)
}

/// First usable port of a range spec, used as a probe fallback target.
pub fn first_port_from_range(spec: &str) -> Option<u16> {
    parse_port_range_spec(spec).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_spec_expands_sorted_and_deduplicated() {
        assert_eq!(parse_port_range_spec("1000-1003,3005"), vec![1000, 1001, 1002, 1003, 3005]);
        assert_eq!(parse_port_range_spec("3005,1000-1002,1001"), vec![1000, 1001, 1002, 3005]);
        assert_eq!(parse_port_range_spec("  "), Vec::<u16>::new());
    }

    #[test]
    fn range_spec_skips_malformed_fragments() {
        assert_eq!(parse_port_range_spec("abc,10-x,2000"), vec![2000]);
        assert_eq!(parse_port_range_spec("0,0-5,7"), vec![7]);
    }

    #[test]
    fn reversed_ranges_are_normalized() {
        assert_eq!(parse_port_range_spec("1005-1003"), vec![1003, 1004, 1005]);
    }

    #[test]
    fn first_port_prefers_lowest_entry() {
        assert_eq!(first_port_from_range("2000-2010,1500"), Some(1500));
        assert_eq!(first_port_from_range(""), None);
    }
}
