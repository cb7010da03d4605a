//! Deterministic workspace → port assignment.
//!
//! The primary candidate is `base_port + (hash(workspace_id) mod spread)`, so a
//! client that knows the workspace id can guess the port without a lookup.
//! When that port is taken the allocator probes linearly through
//! `[base_port, base_port + 2 * spread]`.

use std::io;
use std::net::TcpListener;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Default first port of the workspace range.
pub const DEFAULT_BASE_PORT: u16 = 37100;
/// Default number of primary slots hashed into.
pub const DEFAULT_PORT_SPREAD: u16 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub workspace_id: String,
    pub base_port: u16,
    pub spread: u16,
    pub assigned_port: u16,
}

impl PortAssignment {
    /// Whether the hashed candidate was free, i.e. no probing was needed.
    pub fn is_primary(&self) -> bool {
        self.assigned_port == primary_port(&self.workspace_id, self.base_port, self.spread)
    }
}

/// Hashed candidate port for `workspace_id`.
pub fn primary_port(workspace_id: &str, base_port: u16, spread: u16) -> u16 {
    let digest = Sha256::digest(workspace_id.as_bytes());
    let hash = u16::from_be_bytes([digest[0], digest[1]]);
    let offset = hash % spread.max(1);
    base_port.saturating_add(offset)
}

/// Inclusive upper bound of the probe range.
pub fn probe_end(base_port: u16, spread: u16) -> u16 {
    base_port.saturating_add(spread.max(1).saturating_mul(2))
}

/// Ports in probe order: the candidate, upward to the end of the range, then
/// wrapping to the ports below the candidate.
fn probe_order(candidate: u16, base_port: u16, end: u16) -> impl Iterator<Item = u16> {
    (candidate..=end).chain(base_port..candidate)
}

/// Binds the workspace's port on `host` and returns the bound listener.
///
/// Holding the listener closes the window between probing and serving.
pub fn assign_port(
    host: &str,
    workspace_id: &str,
    base_port: u16,
    spread: u16,
) -> Result<(PortAssignment, TcpListener)> {
    let candidate = primary_port(workspace_id, base_port, spread);
    let end = probe_end(base_port, spread);

    for port in probe_order(candidate, base_port, end) {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                let assignment = PortAssignment {
                    workspace_id: workspace_id.to_string(),
                    base_port,
                    spread,
                    assigned_port: port,
                };
                if port == candidate {
                    info!(port, workspace_id, "bound primary workspace port");
                } else {
                    info!(port, candidate, workspace_id, "primary port taken, probed");
                }
                return Ok((assignment, listener));
            }
            Err(error) if is_conflict(&error) => {
                debug!(port, "port in use");
            }
            Err(error) => {
                debug!(port, error = %error, "port unusable");
            }
        }
    }

    Err(BridgeError::NoPortAvailable {
        start: base_port,
        end,
    })
}

fn is_conflict(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_base(width: u16) -> u16 {
        // Find a run of ports that looks free right now.
        for _ in 0..50 {
            let probe = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral");
            let base = probe.local_addr().expect("local addr").port();
            drop(probe);
            if base.checked_add(width).is_none() {
                continue;
            }
            let all_free = (base..=base + width)
                .all(|port| TcpListener::bind(("127.0.0.1", port)).is_ok());
            if all_free {
                return base;
            }
        }
        panic!("no free port run found");
    }

    #[test]
    fn primary_port_is_deterministic_and_in_range() {
        let first = primary_port("0123456789abcdef", 40000, 100);
        let second = primary_port("0123456789abcdef", 40000, 100);
        assert_eq!(first, second);
        assert!((40000..40100).contains(&first));
    }

    #[test]
    fn zero_spread_is_treated_as_one() {
        assert_eq!(primary_port("anything", 40000, 0), 40000);
        assert_eq!(probe_end(40000, 0), 40002);
    }

    #[test]
    fn probe_order_wraps_below_candidate() {
        let order = probe_order(12, 10, 14).collect::<Vec<_>>();
        assert_eq!(order, vec![12, 13, 14, 10, 11]);
    }

    #[test]
    fn binds_primary_when_free() {
        let base = free_base(4);
        let (assignment, _listener) =
            assign_port("127.0.0.1", "workspace-a", base, 2).expect("assign port");
        assert!(assignment.is_primary());
        assert_eq!(
            assignment.assigned_port,
            primary_port("workspace-a", base, 2)
        );
    }

    #[test]
    fn colliding_offsets_get_distinct_free_ports() {
        // spread = 1 forces every id onto the same primary candidate.
        let base = free_base(2);
        let (first, _held_a) =
            assign_port("127.0.0.1", "workspace-a", base, 1).expect("assign first");
        let (second, _held_b) =
            assign_port("127.0.0.1", "workspace-b", base, 1).expect("assign second");

        assert_eq!(first.assigned_port, base);
        assert_ne!(first.assigned_port, second.assigned_port);
        assert!(second.assigned_port <= probe_end(base, 1));
        assert!(!second.is_primary());
    }

    #[test]
    fn exhausted_range_fails() {
        let base = free_base(2);
        let _held = (base..=base + 2)
            .map(|port| TcpListener::bind(("127.0.0.1", port)).expect("hold port"))
            .collect::<Vec<_>>();

        let error = assign_port("127.0.0.1", "workspace-c", base, 1).expect_err("range is full");
        match error {
            BridgeError::NoPortAvailable { start, end } => {
                assert_eq!(start, base);
                assert_eq!(end, base + 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
