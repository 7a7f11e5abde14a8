//! Deadlock-free mesh establishment.
//!
//! For every pair `a < b`, `a` dials and `b` listens. Server `s` therefore
//! accepts from `0..s` in increasing order, then dials `N-1` down to `s+1`.
//! Each round blocks until its link is established; the descriptor exchange
//! then finishes on the completion pollers.

use super::node::Cluster;
use crate::error::{RdsmError, Result};
use crate::transport::fabric::Fabric;
use crate::types::{PeerIndex, Role, Slot};
use std::sync::atomic::Ordering;

/// One blocking connection round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    /// Position in the bootstrap-order table.
    pub slot: Slot,
    pub peer: PeerIndex,
    pub role: Role,
}

/// Rounds server `self_index` runs in a cluster of `cluster_size`.
pub fn bootstrap_plan(self_index: PeerIndex, cluster_size: usize) -> Vec<Round> {
    let passive = (0..self_index).map(|peer| Round {
        slot: peer,
        peer,
        role: Role::Passive,
    });
    let active = ((self_index + 1)..cluster_size)
        .rev()
        .enumerate()
        .map(|(k, peer)| Round {
            slot: self_index + k,
            peer,
            role: Role::Active,
        });
    passive.chain(active).collect()
}

impl<F: Fabric> Cluster<F> {
    /// Map the heap and establish a link to every peer.
    ///
    /// Returns once every round is established. Call
    /// [`server_ready`](Self::server_ready) before issuing operations.
    pub fn start_server(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RdsmError::Config("server already started".into()));
        }
        let server = self.addresses.self_index();
        let cluster_size = self.addresses.cluster_size();
        tracing::info!(server, cluster_size, heap_size = self.config.heap_size, "starting server");

        if cluster_size == 1 {
            let region = self.regions.region()?;
            region.arm_remote_sentinel();
            tracing::info!(
                server,
                heap_start = format_args!("{:#x}", region.heap_start()),
                "single-server mode: heap mapped, no peers"
            );
            return Ok(());
        }

        for round in bootstrap_plan(server, cluster_size) {
            self.stop.check()?;
            let conn = match round.role {
                Role::Passive => self.accept_link(round)?,
                Role::Active => self.dial_link(round)?,
            };
            tracing::info!(
                server,
                peer = round.peer,
                role = %round.role,
                qp_num = conn.qp_num(),
                "link established"
            );
            let mut staged = self
                .staged
                .lock()
                .map_err(|_| RdsmError::LockPoisoned("connection table"))?;
            staged[round.slot] = Some(conn);
        }
        tracing::debug!(server, "bootstrap rounds complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_orders_rounds() {
        let plan = bootstrap_plan(2, 5);
        let peers: Vec<_> = plan.iter().map(|r| (r.peer, r.role, r.slot)).collect();
        assert_eq!(
            peers,
            vec![
                (0, Role::Passive, 0),
                (1, Role::Passive, 1),
                (4, Role::Active, 2),
                (3, Role::Active, 3),
            ]
        );
    }

    #[test]
    fn test_pairs_agree_on_roles() {
        for n in [2usize, 3, 8] {
            let plans: Vec<_> = (0..n).map(|s| bootstrap_plan(s, n)).collect();
            for (a, plan) in plans.iter().enumerate() {
                assert_eq!(plan.len(), n - 1);
                for round in plan {
                    let back = plans[round.peer]
                        .iter()
                        .find(|r| r.peer == a)
                        .unwrap();
                    assert_ne!(round.role, back.role);
                    assert_eq!(round.role == Role::Active, a < round.peer);
                }
            }
        }
    }

    #[test]
    fn test_reversed_back_half_matches_slot_formula() {
        use crate::cluster::AddressMap;
        for n in [2usize, 3, 8] {
            for s in 0..n {
                let mut staged: Vec<_> = bootstrap_plan(s, n).iter().map(|r| r.peer).collect();
                staged[s..].reverse();
                let map = AddressMap::new(s, n, 64).unwrap();
                for (slot, peer) in staged.into_iter().enumerate() {
                    assert_eq!(map.slot_for_peer(peer).unwrap(), slot);
                }
            }
        }
    }

    #[test]
    fn test_single_server_has_no_rounds() {
        assert!(bootstrap_plan(0, 1).is_empty());
    }
}
