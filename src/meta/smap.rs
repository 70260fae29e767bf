//! The cluster map.

use crate::error::{Error, IntegrityError, Result};
use crate::meta::{validate_uuid, RevKind, RevType};
use crate::types::{NodeId, Snode, SnodeFlags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the information council (IC): the proxies that track long-lived
/// job notifications. The primary is always a member.
pub const IC_SIZE: usize = 3;

/// Versioned snapshot of cluster membership.
///
/// Invariants: `version` is strictly monotonic per `uuid`; the primary is
/// one of the proxies; a node never appears in both maps. The IC member set
/// is recomputed deterministically on every mutation, so any two nodes
/// holding the same Smap version agree on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smap {
    pub version: i64,
    pub uuid: String,
    pub primary_id: NodeId,
    /// Proxies, keyed by node ID.
    pub pmap: BTreeMap<NodeId, Snode>,
    /// Targets, keyed by node ID.
    pub tmap: BTreeMap<NodeId, Snode>,
    /// Current IC membership (derived, see [`Smap::staff_ic`]).
    #[serde(default)]
    pub ic: BTreeSet<NodeId>,
    /// Creation time, milliseconds since the epoch.
    pub creation_time: u64,
}

impl Smap {
    /// Create version-1 map with a single (primary) proxy.
    pub fn new(uuid: impl Into<String>, primary: Snode) -> Self {
        debug_assert!(primary.is_proxy());
        let mut smap = Self {
            version: 1,
            uuid: uuid.into(),
            primary_id: primary.id.clone(),
            pmap: BTreeMap::from([(primary.id.clone(), primary)]),
            tmap: BTreeMap::new(),
            ic: BTreeSet::new(),
            creation_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        smap.staff_ic();
        smap
    }

    /// Placeholder map of a node that has not joined a cluster yet; replaced
    /// wholesale by the first installed revision.
    pub fn empty() -> Self {
        Self {
            version: 0,
            uuid: String::new(),
            primary_id: String::new(),
            pmap: BTreeMap::new(),
            tmap: BTreeMap::new(),
            ic: BTreeSet::new(),
            creation_time: 0,
        }
    }

    pub fn get_proxy(&self, id: &str) -> Option<&Snode> {
        self.pmap.get(id)
    }

    pub fn get_target(&self, id: &str) -> Option<&Snode> {
        self.tmap.get(id)
    }

    /// Look a node up in either map.
    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.pmap.get(id).or_else(|| self.tmap.get(id))
    }

    /// The primary proxy. `None` only on a corrupt map.
    pub fn primary(&self) -> Option<&Snode> {
        self.pmap.get(&self.primary_id)
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.primary_id == id
    }

    pub fn is_ic(&self, id: &str) -> bool {
        self.ic.contains(id)
    }

    pub fn count_proxies(&self) -> usize {
        self.pmap.len()
    }

    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }

    /// Targets not excluded from placement by maintenance flags.
    pub fn active_targets(&self) -> impl Iterator<Item = &Snode> {
        self.tmap.values().filter(|t| !t.in_maintenance())
    }

    pub fn count_active_targets(&self) -> usize {
        self.active_targets().count()
    }

    /// Proxies eligible for primaryship.
    pub fn electable_proxies(&self) -> impl Iterator<Item = &Snode> {
        self.pmap
            .values()
            .filter(|p| !p.in_maintenance() && !p.non_electable())
    }

    /// Insert or replace a node, applying extra `flags` on top of the ones
    /// it advertises. Returns true when a node with this ID already existed.
    pub fn put_node(&mut self, mut snode: Snode, flags: SnodeFlags) -> bool {
        snode.flags = snode.flags.set(flags);
        let exists = if snode.is_proxy() {
            debug_assert!(!self.tmap.contains_key(&snode.id));
            self.pmap.insert(snode.id.clone(), snode).is_some()
        } else {
            debug_assert!(!self.pmap.contains_key(&snode.id));
            self.tmap.insert(snode.id.clone(), snode).is_some()
        };
        self.staff_ic();
        exists
    }

    /// Remove a node from whichever map holds it.
    pub fn del_node(&mut self, id: &str) -> Option<Snode> {
        let removed = self.pmap.remove(id).or_else(|| self.tmap.remove(id));
        if removed.is_some() {
            self.staff_ic();
        }
        removed
    }

    /// Set flags on a node in place.
    pub fn set_node_flags(&mut self, id: &str, flags: SnodeFlags) -> Result<()> {
        let node = self
            .pmap
            .get_mut(id)
            .or_else(|| self.tmap.get_mut(id))
            .ok_or_else(|| crate::error::MembershipError::NodeNotFound(id.to_string()))?;
        node.flags = node.flags.set(flags);
        self.staff_ic();
        Ok(())
    }

    /// Clear flags on a node in place.
    pub fn clear_node_flags(&mut self, id: &str, flags: SnodeFlags) -> Result<()> {
        let node = self
            .pmap
            .get_mut(id)
            .or_else(|| self.tmap.get_mut(id))
            .ok_or_else(|| crate::error::MembershipError::NodeNotFound(id.to_string()))?;
        node.flags = node.flags.clear(flags);
        self.staff_ic();
        Ok(())
    }

    /// True when the node carries a maintenance-family flag.
    pub fn present_in_maint(&self, id: &str) -> bool {
        self.get_node(id).map(|n| n.in_maintenance()).unwrap_or(false)
    }

    /// Recompute IC membership: the primary plus the lexicographically first
    /// electable, non-maintenance proxies up to [`IC_SIZE`].
    pub fn staff_ic(&mut self) {
        let mut ic = BTreeSet::new();
        ic.insert(self.primary_id.clone());
        for p in self.pmap.values() {
            if ic.len() >= IC_SIZE {
                break;
            }
            if p.in_maintenance() || p.non_electable() || ic.contains(&p.id) {
                continue;
            }
            ic.insert(p.id.clone());
        }
        self.ic = ic;
    }

    /// Reject a map advertised by a joining node when it belongs to a
    /// different cluster.
    pub fn validate_uuid(&self, incoming: &Smap, local: &str, peer: &str) -> Result<()> {
        validate_uuid(&self.uuid, &incoming.uuid, local, peer)
    }

    /// Detect an endpoint collision: some *other* live node already occupies
    /// one of the candidate's endpoints.
    pub fn check_duplicate(&self, nsi: &Snode) -> Result<()> {
        for node in self.pmap.values().chain(self.tmap.values()) {
            if node.id == nsi.id {
                continue;
            }
            if node.public_net == nsi.public_net || node.control_net == nsi.control_net {
                return Err(Error::Integrity(IntegrityError::DuplicateId {
                    id: nsi.id.clone(),
                    existing: node.name_ex(),
                    incoming: nsi.name_ex(),
                }));
            }
        }
        Ok(())
    }

    /// Extended display form, e.g. `Smap v9[U-abc, p3, t4]`.
    pub fn string_ex(&self) -> String {
        format!(
            "Smap v{}[{}, p{}, t{}]",
            self.version,
            self.uuid,
            self.pmap.len(),
            self.tmap.len()
        )
    }
}

impl RevType for Smap {
    const KIND: RevKind = RevKind::Smap;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetAddr, NodeRole};

    fn proxy(id: &str, port: u16) -> Snode {
        Snode::new(id, NodeRole::Proxy, NetAddr::new("127.0.0.1", port))
    }

    fn target(id: &str, port: u16) -> Snode {
        Snode::new(id, NodeRole::Target, NetAddr::new("127.0.0.1", port))
    }

    fn smap3x2() -> Smap {
        let mut smap = Smap::new("U-1", proxy("p1", 8080));
        smap.put_node(proxy("p2", 8081), SnodeFlags::default());
        smap.put_node(proxy("p3", 8082), SnodeFlags::default());
        smap.put_node(target("t1", 9090), SnodeFlags::default());
        smap.put_node(target("t2", 9091), SnodeFlags::default());
        smap
    }

    #[test]
    fn test_primary_is_a_proxy_and_maps_disjoint() {
        let smap = smap3x2();
        assert!(smap.pmap.contains_key(&smap.primary_id));
        for id in smap.tmap.keys() {
            assert!(!smap.pmap.contains_key(id));
        }
    }

    #[test]
    fn test_put_node_reports_exists() {
        let mut smap = smap3x2();
        assert!(!smap.put_node(target("t3", 9092), SnodeFlags::default()));
        assert!(smap.put_node(target("t3", 9093), SnodeFlags::default()));
    }

    #[test]
    fn test_active_targets_excludes_maintenance() {
        let mut smap = smap3x2();
        assert_eq!(smap.count_active_targets(), 2);
        smap.set_node_flags("t1", SnodeFlags::MAINTENANCE).unwrap();
        assert_eq!(smap.count_active_targets(), 1);
        assert_eq!(smap.count_targets(), 2);
        smap.clear_node_flags("t1", SnodeFlags::MAINTENANCE_MASK)
            .unwrap();
        assert_eq!(smap.count_active_targets(), 2);
    }

    #[test]
    fn test_staff_ic_deterministic() {
        let a = smap3x2();
        let b = smap3x2();
        assert_eq!(a.ic, b.ic);
        assert!(a.ic.contains("p1"));
        assert_eq!(a.ic.len(), IC_SIZE.min(a.count_proxies()));
    }

    #[test]
    fn test_staff_ic_skips_non_electable() {
        let mut smap = Smap::new("U-1", proxy("p1", 8080));
        let mut ne = proxy("p0", 8079);
        ne.flags = ne.flags.set(SnodeFlags::NON_ELECTABLE);
        smap.put_node(ne, SnodeFlags::default());
        smap.put_node(proxy("p2", 8081), SnodeFlags::default());
        assert!(!smap.ic.contains("p0"));
        assert!(smap.ic.contains("p1"));
        assert!(smap.ic.contains("p2"));
    }

    #[test]
    fn test_validate_uuid() {
        let smap = smap3x2();
        let other = Smap::new("U-2", proxy("px", 8888));
        assert!(smap.validate_uuid(&other, "p1", "px").is_err());
        let same = Smap::new("U-1", proxy("px", 8888));
        assert!(smap.validate_uuid(&same, "p1", "px").is_ok());
    }

    #[test]
    fn test_check_duplicate_endpoint() {
        let smap = smap3x2();
        // same endpoint as t1, different ID
        let imposter = target("t9", 9090);
        assert!(smap.check_duplicate(&imposter).is_err());
        // same ID does not count as an endpoint collision here
        let renewal = target("t1", 9090);
        assert!(smap.check_duplicate(&renewal).is_ok());
    }

    #[test]
    fn test_del_node_restaffs_ic() {
        let mut smap = smap3x2();
        assert!(smap.ic.contains("p2"));
        smap.del_node("p2");
        assert!(!smap.ic.contains("p2"));
        assert_eq!(smap.count_proxies(), 2);
    }
}
