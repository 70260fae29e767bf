//! Core types used throughout the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster. Stable and opaque; assigned once at first
/// registration and kept across restarts.
pub type NodeId = String;

/// A single network endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    /// Hostname or IP address.
    pub hostname: String,
    /// TCP port.
    pub port: u16,
}

impl NetAddr {
    /// Create a new endpoint.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Render as `host:port`.
    pub fn to_addr_string(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stateless gateway; routes requests and (one of them) runs the control plane.
    Proxy,
    /// Data-bearing storage node.
    Target,
}

/// Bitmask of per-node flags carried in the cluster map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnodeFlags(pub u16);

impl SnodeFlags {
    /// Proxy never runs for primary.
    pub const NON_ELECTABLE: SnodeFlags = SnodeFlags(1 << 0);
    /// Node is under maintenance; excluded from placement.
    pub const MAINTENANCE: SnodeFlags = SnodeFlags(1 << 1);
    /// Node is being decommissioned; removed once rebalance completes.
    pub const DECOMMISSIONING: SnodeFlags = SnodeFlags(1 << 2);

    /// Flags that exclude a node from placement and make it "in maintenance".
    pub const MAINTENANCE_MASK: SnodeFlags =
        SnodeFlags(Self::MAINTENANCE.0 | Self::DECOMMISSIONING.0);

    /// Check whether all bits of `other` are set.
    pub fn contains(self, other: SnodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any bit of `other` is set.
    pub fn intersects(self, other: SnodeFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Return a copy with the bits of `other` set.
    pub fn set(self, other: SnodeFlags) -> SnodeFlags {
        SnodeFlags(self.0 | other.0)
    }

    /// Return a copy with the bits of `other` cleared.
    pub fn clear(self, other: SnodeFlags) -> SnodeFlags {
        SnodeFlags(self.0 & !other.0)
    }

    /// True when no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A cluster node: identity, endpoints, role, and flags.
///
/// Equality (`eq_full`) compares the ID *and* all three endpoints;
/// re-registration with an identical ID but different endpoints is treated
/// as a registration renewal, subject to duplicate-ID probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    /// Stable opaque node ID.
    pub id: NodeId,
    /// Endpoint serving client requests.
    pub public_net: NetAddr,
    /// Endpoint for intra-cluster control traffic.
    pub control_net: NetAddr,
    /// Endpoint for intra-cluster data traffic.
    pub data_net: NetAddr,
    /// Proxy or target.
    pub role: NodeRole,
    /// Node flags (non-electable, maintenance, decommissioning).
    #[serde(default)]
    pub flags: SnodeFlags,
}

impl Snode {
    /// Create a node with all three endpoints set to the same address.
    pub fn new(id: impl Into<NodeId>, role: NodeRole, addr: NetAddr) -> Self {
        Self {
            id: id.into(),
            public_net: addr.clone(),
            control_net: addr.clone(),
            data_net: addr,
            role,
            flags: SnodeFlags::default(),
        }
    }

    /// This node's ID.
    pub fn sid(&self) -> &str {
        &self.id
    }

    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }

    /// True when the node carries the maintenance or decommissioning flag.
    pub fn in_maintenance(&self) -> bool {
        self.flags.intersects(SnodeFlags::MAINTENANCE_MASK)
    }

    pub fn non_electable(&self) -> bool {
        self.flags.contains(SnodeFlags::NON_ELECTABLE)
    }

    /// Full equality: same ID and same endpoints (flags are excluded so a
    /// maintenance transition does not read as a re-registration).
    pub fn eq_full(&self, other: &Snode) -> bool {
        self.id == other.id
            && self.public_net == other.public_net
            && self.control_net == other.control_net
            && self.data_net == other.data_net
    }

    /// Short display form: `p[id]` / `t[id]`.
    pub fn name(&self) -> String {
        match self.role {
            NodeRole::Proxy => format!("p[{}]", self.id),
            NodeRole::Target => format!("t[{}]", self.id),
        }
    }

    /// Extended display form with the control endpoint.
    pub fn name_ex(&self) -> String {
        format!("{}({})", self.name(), self.control_net)
    }
}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            NodeRole::Proxy => write!(f, "p[{}]", self.id),
            NodeRole::Target => write!(f, "t[{}]", self.id),
        }
    }
}

/// Registration payload a node sends when joining (or keeping alive).
///
/// Carries the candidate's `Snode`, the cluster metadata versions it already
/// knows, and whether it believes a rebalance is still pending on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegMeta {
    /// The registering node.
    pub snode: Snode,
    /// The cluster map the node last saw, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<crate::meta::Smap>,
    /// The bucket metadata the node last saw, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmd: Option<crate::meta::BucketMd>,
    /// True when the node has an interrupted rebalance to resume.
    #[serde(default)]
    pub reb: bool,
}

impl NodeRegMeta {
    /// Registration metadata with no known cluster state.
    pub fn bare(snode: Snode) -> Self {
        Self {
            snode,
            smap: None,
            bmd: None,
            reb: false,
        }
    }
}

/// Join verbs accepted by the membership controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinVerb {
    /// Administrator-driven registration through the API.
    UserRegister,
    /// Node self-registration at startup.
    SelfRegister,
    /// Periodic liveness refresh.
    Keepalive,
}

impl JoinVerb {
    /// Log tag for the verb.
    pub fn tag(self) -> &'static str {
        match self {
            JoinVerb::UserRegister => "user-register",
            JoinVerb::SelfRegister => "join",
            JoinVerb::Keepalive => "keepalive",
        }
    }
}

/// Options for the node-removal family of actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RmNodeOpts {
    /// The node to act upon.
    pub daemon_id: NodeId,
    /// Skip the rebalance that the removal would otherwise trigger.
    #[serde(default)]
    pub skip_rebalance: bool,
}

/// Request body for starting/stopping a long-running cluster activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XactReq {
    /// Activity kind, e.g. "rebalance", "resilver".
    pub kind: String,
    /// Activity UUID; generated when empty.
    #[serde(default)]
    pub id: String,
    /// Restrict to a single node (resilver).
    #[serde(default)]
    pub node: NodeId,
}

/// Administrative cluster actions, dispatched by variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "kebab-case")]
pub enum Action {
    /// Update cluster configuration on every node.
    SetConfig(serde_json::Value),
    /// Shut the whole cluster down.
    Shutdown,
    /// Start a long-running activity.
    XactStart(XactReq),
    /// Stop a long-running activity.
    XactStop(XactReq),
    /// Hand the notification ownership table to an IC member.
    SendOwnershipTbl {
        /// Destination proxy.
        dst_id: NodeId,
    },
    /// Flag a node for maintenance and rebalance around it.
    StartMaintenance(RmNodeOpts),
    /// Flag, rebalance, then permanently remove a node.
    Decommission(RmNodeOpts),
    /// Flag, rebalance, then power a node down.
    ShutdownNode(RmNodeOpts),
    /// Clear maintenance flags; may trigger rebalance.
    StopMaintenance(RmNodeOpts),
    /// Designate a new primary proxy (two-phase).
    SetPrimary {
        /// The new primary's ID.
        id: NodeId,
    },
}

impl Action {
    /// Short name used in logs and listener registrations.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::SetConfig(_) => "set-config",
            Action::Shutdown => "shutdown",
            Action::XactStart(_) => "xact-start",
            Action::XactStop(_) => "xact-stop",
            Action::SendOwnershipTbl { .. } => "send-ownership-tbl",
            Action::StartMaintenance(_) => "start-maintenance",
            Action::Decommission(_) => "decommission",
            Action::ShutdownNode(_) => "shutdown-node",
            Action::StopMaintenance(_) => "stop-maintenance",
            Action::SetPrimary { .. } => "set-primary",
        }
    }

    /// True for the three actions that gracefully remove a node.
    pub fn is_rm_node(&self) -> bool {
        matches!(
            self,
            Action::StartMaintenance(_) | Action::Decommission(_) | Action::ShutdownNode(_)
        )
    }
}

/// Read-only cluster queries (`what=...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhatQuery {
    /// Aggregated node statistics.
    Stats,
    /// Aggregated system information.
    Sysinfo,
    /// Long-running-activity status from the IC.
    Status,
    /// Per-target mountpath report.
    Mountpaths,
    /// Long-running-activity snapshots.
    Xaction,
    /// Remote-cluster attachments, queried from one target.
    RemoteCluster,
    /// Comma-separated target endpoint hostnames.
    TargetIps,
}

/// Options record for the directory-promote operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromoteArgs {
    /// Absolute source directory.
    pub src_dir: String,
    /// Destination object-name prefix ("" keeps relative paths).
    #[serde(default)]
    pub dst_obj_prefix: String,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: bool,
    /// Overwrite a destination object that already exists.
    #[serde(default)]
    pub overwrite_dst: bool,
    /// Remove source files after a successful promote.
    #[serde(default)]
    pub delete_src: bool,
    /// The directory is shared across targets: each target promotes only the
    /// names that place locally.
    #[serde(default)]
    pub file_share: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tnode(id: &str, port: u16) -> Snode {
        Snode::new(id, NodeRole::Target, NetAddr::new("127.0.0.1", port))
    }

    #[test]
    fn test_flags_set_clear() {
        let f = SnodeFlags::default()
            .set(SnodeFlags::MAINTENANCE)
            .set(SnodeFlags::NON_ELECTABLE);
        assert!(f.contains(SnodeFlags::MAINTENANCE));
        assert!(f.intersects(SnodeFlags::MAINTENANCE_MASK));

        let f = f.clear(SnodeFlags::MAINTENANCE);
        assert!(!f.intersects(SnodeFlags::MAINTENANCE_MASK));
        assert!(f.contains(SnodeFlags::NON_ELECTABLE));
    }

    #[test]
    fn test_snode_equality_includes_endpoints() {
        let a = tnode("t1", 9000);
        let mut b = tnode("t1", 9000);
        assert!(a.eq_full(&b));

        b.public_net = NetAddr::new("127.0.0.1", 9001);
        assert!(!a.eq_full(&b));
    }

    #[test]
    fn test_snode_equality_ignores_flags() {
        let a = tnode("t1", 9000);
        let mut b = a.clone();
        b.flags = b.flags.set(SnodeFlags::MAINTENANCE);
        assert!(a.eq_full(&b));
    }

    #[test]
    fn test_action_round_trip() {
        let msg = Action::Decommission(RmNodeOpts {
            daemon_id: "t2".to_string(),
            skip_rebalance: false,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"decommission\""));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Action::Decommission(o) if o.daemon_id == "t2"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let res: std::result::Result<Action, _> =
            serde_json::from_str(r#"{"action":"frobnicate","value":null}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_display_forms() {
        let t = tnode("abcd", 9000);
        assert_eq!(t.name(), "t[abcd]");
        assert_eq!(format!("{t}"), "t[abcd]");
        assert!(t.name_ex().contains("127.0.0.1:9000"));
    }
}
