//! Cluster-wide rebalance.
//!
//! A rebalance round re-aligns object placement with a new cluster map.
//! Every target runs the round independently and synchronizes progress with
//! its peers through a broadcast-and-poll pattern plus push notifications of
//! stage transitions; see [`coordinator::Reb`].

pub mod coordinator;
pub mod mover;

pub use coordinator::{Reb, RebArgs};
pub use mover::{AckTab, MemInventory, Mover, ObjectInventory, TransportMover};

use crate::types::NodeId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position within a rebalance round. Monotonic per round on every target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Round accepted; waiting for peers to come up.
    Init,
    /// Scanning the local inventory and transmitting misplaced objects.
    Traverse,
    /// Rebuilding the erasure-coded namespace (optional; may be a no-op).
    EcNamespace,
    /// Local scan done; waiting for outstanding ACKs.
    WaitAck,
    /// All ACK obligations resolved; waiting for peers to finish.
    Fin,
    /// Round finished cleanly.
    Done,
    /// Round aborted.
    Aborted,
}

impl Stage {
    /// True for the two terminal stages.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Traverse => "traverse",
            Stage::EcNamespace => "ec-namespace",
            Stage::WaitAck => "wait-ack",
            Stage::Fin => "fin",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Rebalance status of one target, returned by the health probe
/// (`reb_status=true`) and consumed by peers' `check_glob_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebStatus {
    /// Targets this node is still waiting for ACKs from.
    pub targets: Vec<NodeId>,
    /// Current Smap version on this node.
    pub smap_version: i64,
    /// Smap version of this rebalancing round.
    pub reb_version: i64,
    /// Rebalance ID (the RMD version the round started with).
    pub reb_id: i64,
    /// Current stage.
    pub stage: Stage,
    /// Round was aborted.
    pub aborted: bool,
    /// Round is still running.
    pub running: bool,
    /// Transmit queue has drained.
    pub quiescent: bool,
    /// Objects transmitted so far this round.
    pub objs_tx: u64,
    /// Objects received so far this round.
    pub objs_rx: u64,
}

/// Dual-sourced per-peer stage knowledge.
///
/// Peers push "I reached stage X" notifications and coordinators also pull
/// via status probes; both feed this map and merge to the maximum, so pushed
/// progress short-circuits polling and observed stages never regress within
/// a round.
#[derive(Debug, Default)]
pub struct StageTracker {
    stages: DashMap<NodeId, (i64, Stage)>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` reached `stage` of round `reb_id`. Older rounds
    /// and regressed stages are ignored.
    pub fn set(&self, peer: &str, reb_id: i64, stage: Stage) {
        let mut entry = self
            .stages
            .entry(peer.to_string())
            .or_insert((reb_id, stage));
        let (cur_id, cur_stage) = *entry;
        if reb_id > cur_id {
            *entry = (reb_id, stage);
        } else if reb_id == cur_id && stage > cur_stage {
            *entry = (reb_id, stage);
        }
    }

    /// Last known `(reb_id, stage)` for `peer`.
    pub fn get(&self, peer: &str) -> Option<(i64, Stage)> {
        self.stages.get(peer).map(|e| *e)
    }

    /// True when `peer` is known to have reached `stage` of round `reb_id`.
    pub fn is_in_stage(&self, peer: &str, reb_id: i64, stage: Stage) -> bool {
        match self.get(peer) {
            Some((id, s)) => id == reb_id && s >= stage,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Init < Stage::Traverse);
        assert!(Stage::Traverse < Stage::WaitAck);
        assert!(Stage::WaitAck < Stage::Fin);
        assert!(Stage::Fin < Stage::Done);
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Aborted.is_terminal());
        assert!(!Stage::Fin.is_terminal());
    }

    #[test]
    fn test_tracker_never_regresses() {
        let tr = StageTracker::new();
        tr.set("t2", 5, Stage::WaitAck);
        tr.set("t2", 5, Stage::Traverse); // late/duplicate push
        assert_eq!(tr.get("t2"), Some((5, Stage::WaitAck)));
        assert!(tr.is_in_stage("t2", 5, Stage::Traverse));
        assert!(!tr.is_in_stage("t2", 5, Stage::Fin));
    }

    #[test]
    fn test_tracker_newer_round_wins() {
        let tr = StageTracker::new();
        tr.set("t2", 5, Stage::Fin);
        tr.set("t2", 6, Stage::Init);
        assert_eq!(tr.get("t2"), Some((6, Stage::Init)));
        // a stale round's stage no longer matches
        assert!(!tr.is_in_stage("t2", 5, Stage::Fin));
    }

    #[test]
    fn test_stage_serde_kebab() {
        let json = serde_json::to_string(&Stage::EcNamespace).unwrap();
        assert_eq!(json, "\"ec-namespace\"");
        let back: Stage = serde_json::from_str("\"wait-ack\"").unwrap();
        assert_eq!(back, Stage::WaitAck);
    }
}
