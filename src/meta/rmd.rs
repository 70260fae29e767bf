//! The rebalance descriptor.

use crate::meta::{RevKind, RevType};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

/// Versioned rebalance descriptor.
///
/// A new version exists iff a rebalance should run; the version doubles as
/// the rebalance ID (`g<version>` in logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebMd {
    pub version: i64,
    pub uuid: String,
    /// Targets whose membership change produced this revision (may be empty
    /// for administratively triggered rounds).
    #[serde(default)]
    pub target_ids: Vec<NodeId>,
    /// Run a local resilver alongside the global rebalance.
    #[serde(default)]
    pub resilver: bool,
}

impl RebMd {
    /// Descriptor of a cluster that has never rebalanced.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            version: 0,
            uuid: uuid.into(),
            target_ids: Vec::new(),
            resilver: false,
        }
    }

    /// The rebalance ID this revision denotes.
    pub fn reb_id(&self) -> i64 {
        self.version
    }

    /// Log form of the rebalance ID.
    pub fn reb_id_string(&self) -> String {
        format!("g{}", self.version)
    }
}

impl RevType for RebMd {
    const KIND: RevKind = RevKind::Rmd;

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }
}
