//! The membership controller running on the primary proxy.
//!
//! Every Smap-mutating verb funnels through [`MembershipController`], which
//! applies it under the cluster-map store's modify lock, decides whether the
//! change requires a rebalance (bumping the RMD inside the same critical
//! section), and hands the committed revisions to the metasyncer.

use crate::config::ClusterConfig;
use crate::error::{Error, IntegrityError, MembershipError, Result};
use crate::meta::{BucketMd, Modifier, RebMd, RevPair, Smap, SmapSource, VersionedStore};
use crate::membership::keepalive::KeepaliveTracker;
use crate::metasync::Metasyncer;
use crate::metrics::ControlMetrics;
use crate::network::msg::ControlMsg;
use crate::network::transport::Transport;
use crate::notify::{NotifCallback, NotifListener, NotifRegistry};
use crate::types::{Action, JoinVerb, NodeId, NodeRegMeta, RmNodeOpts, Snode, SnodeFlags};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// The three metadata stores of one node.
#[derive(Debug)]
pub struct MetaOwner {
    pub smap: VersionedStore<Smap>,
    pub rmd: VersionedStore<RebMd>,
    pub bmd: VersionedStore<BucketMd>,
    /// Sticky "some target reported an interrupted rebalance" bit, OR-ed in
    /// on every target join and consumed by the next Smap commit.
    pub rebalance_pending: AtomicBool,
}

impl MetaOwner {
    pub fn new(smap: Smap, rmd: RebMd, bmd: BucketMd) -> Arc<Self> {
        Arc::new(Self {
            smap: VersionedStore::new(smap),
            rmd: VersionedStore::new(rmd),
            bmd: VersionedStore::new(bmd),
            rebalance_pending: AtomicBool::new(false),
        })
    }
}

impl SmapSource for MetaOwner {
    fn get_smap(&self) -> Arc<Smap> {
        self.smap.get()
    }
}

/// True iff the committed Smap delta adds an active target, removes an
/// active target, or flips a target's maintenance flag.
pub fn requires_rebalance(prev_active: &BTreeSet<NodeId>, cur: &Smap) -> bool {
    let cur_active: BTreeSet<NodeId> = cur.active_targets().map(|t| t.id.clone()).collect();
    *prev_active != cur_active
}

/// A round needs at least two participating targets and somewhere to place
/// objects.
fn can_run_rebalance(smap: &Smap) -> bool {
    smap.count_targets() >= 2 && smap.count_active_targets() >= 1
}

/// What a join produced.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The installed map, when the join mutated it.
    pub smap: Option<Arc<Smap>>,
    /// The rebalance the join triggered, if any.
    pub reb_id: Option<i64>,
}

pub struct MembershipController {
    pub(crate) si: Snode,
    pub(crate) config: ClusterConfig,
    pub(crate) owner: Arc<MetaOwner>,
    pub(crate) msyncer: Arc<Metasyncer>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) keepalive: KeepaliveTracker,
    pub(crate) notifs: Arc<NotifRegistry>,
    pub(crate) metrics: Arc<ControlMetrics>,

    pub(crate) node_started: AtomicBool,
    pub(crate) cluster_started: AtomicBool,
    pub(crate) in_primary_transition: AtomicBool,
    /// Joins that arrived before the cluster finished starting up.
    pub(crate) reg_pool: Mutex<Vec<(NodeRegMeta, bool)>>,
    /// Back-reference for callbacks that outlive a handler call.
    self_ref: Mutex<Weak<Self>>,
}

impl MembershipController {
    pub fn new(
        si: Snode,
        config: ClusterConfig,
        owner: Arc<MetaOwner>,
        msyncer: Arc<Metasyncer>,
        transport: Arc<dyn Transport>,
        notifs: Arc<NotifRegistry>,
        metrics: Arc<ControlMetrics>,
    ) -> Arc<Self> {
        debug_assert!(si.is_proxy());
        let keepalive = KeepaliveTracker::new(config.max_keepalive);
        let ctrl = Arc::new(Self {
            si,
            config,
            owner,
            msyncer,
            transport,
            keepalive,
            notifs,
            metrics,
            node_started: AtomicBool::new(true),
            cluster_started: AtomicBool::new(false),
            in_primary_transition: AtomicBool::new(false),
            reg_pool: Mutex::new(Vec::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *ctrl.self_ref.lock() = Arc::downgrade(&ctrl);
        ctrl
    }

    fn arc(&self) -> Arc<Self> {
        // set in new() before the value escapes
        self.self_ref.lock().upgrade().expect("controller self-ref")
    }

    pub fn node_started(&self) -> bool {
        self.node_started.load(Ordering::SeqCst)
    }

    pub fn cluster_started(&self) -> bool {
        self.cluster_started.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.owner.smap.get().is_primary(&self.si.id)
    }

    /// Mark startup complete and replay the buffered joins, each exactly
    /// once.
    pub async fn mark_cluster_started(&self) {
        if self.cluster_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool: Vec<_> = std::mem::take(&mut *self.reg_pool.lock());
        if pool.is_empty() {
            return;
        }
        info!(node = %self.si, buffered = pool.len(), "replaying startup join pool");
        for (reg, non_electable) in pool {
            if let Err(e) = self
                .handle_join(JoinVerb::SelfRegister, reg, non_electable)
                .await
            {
                warn!(node = %self.si, error = %e, "buffered join replay failed");
            }
        }
    }

    /// Forward a mutating request to the primary; used whenever this proxy
    /// is not it.
    pub async fn forward_to_primary(&self, msg: ControlMsg, verb: &str) -> Result<ControlMsg> {
        let smap = self.owner.smap.get();
        let primary = smap
            .primary()
            .filter(|p| p.id != self.si.id)
            .cloned()
            .ok_or_else(|| MembershipError::NotPrimary {
                self_id: self.si.name(),
                primary_id: smap.primary_id.clone(),
                verb: verb.to_string(),
            })?;
        debug!(node = %self.si, to = %primary, verb, "forwarding to primary");
        self.transport
            .call(&primary, msg, self.config.cplane_operation)
            .await
    }

    // ---- join / keepalive ----

    /// Handle one join-family verb (the POST `/cluster/{verb}` surface).
    pub async fn handle_join(
        &self,
        verb: JoinVerb,
        reg: NodeRegMeta,
        non_electable: bool,
    ) -> Result<ControlMsg> {
        // keepalives are silently dropped while the primary changes hands
        if self.in_primary_transition.load(Ordering::SeqCst) && verb == JoinVerb::Keepalive {
            return Ok(ControlMsg::Ok);
        }
        if !self.is_primary() {
            let msg = ControlMsg::Join {
                verb,
                meta: reg,
                non_electable,
            };
            return self.forward_to_primary(msg, verb.tag()).await;
        }
        self.metrics.post_count.inc();
        if verb == JoinVerb::Keepalive {
            self.metrics.keepalive_count.inc();
        }

        let nsi = reg.snode.clone();
        if verb == JoinVerb::SelfRegister && !self.cluster_started() {
            self.reg_pool.lock().push((reg, non_electable));
            // no distribution yet: put the node in the map quietly and let
            // the startup replay do the rest
            let flags = extra_flags(non_electable);
            let smap = self.owner.smap.modify(Modifier::new(|clone: &mut Smap| {
                clone.put_node(nsi.clone(), flags);
                Ok(())
            }))?;
            return Ok(self.join_reply(&nsi, Some(smap), None));
        }

        // cluster-integrity: the candidate must not belong to another cluster
        if self.node_started() {
            if let Some(in_bmd) = &reg.bmd {
                let bmd = self.owner.bmd.get();
                crate::meta::validate_uuid(&bmd.uuid, &in_bmd.uuid, &self.si.name(), &nsi.name())?;
            }
        }
        let smap = self.owner.smap.get();
        if let Some(in_smap) = &reg.smap {
            smap.validate_uuid(in_smap, &self.si.name(), &nsi.name())?;
        }
        // a different live node must not occupy the candidate's endpoints
        smap.check_duplicate(&nsi)?;

        // duplicate/renewal detection against the registered instance
        let osi = smap.get_node(&nsi.id).cloned();
        drop(smap);
        let update = match &osi {
            Some(osi) if !osi.eq_full(&nsi) => {
                if self.probe_alive(osi).await {
                    return Err(Error::Integrity(IntegrityError::DuplicateId {
                        id: nsi.id.clone(),
                        existing: osi.name_ex(),
                        incoming: nsi.name_ex(),
                    }));
                }
                warn!(node = %self.si, nsi = %nsi, "renewing registration (info changed)");
                true
            }
            Some(_) if verb == JoinVerb::Keepalive => {
                // same node, same endpoints: refresh liveness, no Smap change
                self.keepalive.heard_from(&nsi.id, false);
                return Ok(ControlMsg::Ok);
            }
            Some(_) => {
                info!(node = %self.si, nsi = %nsi, "already registered");
                // a target re-joining under its old identity still triggers
                // a rebalance: it may have missed rounds
                nsi.is_target()
            }
            None => {
                if verb == JoinVerb::Keepalive {
                    warn!(node = %self.si, nsi = %nsi, "keepalive from unknown node, adding back");
                }
                true
            }
        };

        if nsi.is_target() && self.node_started() && reg.reb {
            // sticky needs-rebalance bit advertised by the target
            self.owner.rebalance_pending.store(true, Ordering::SeqCst);
        }
        if !update {
            return Ok(self.join_reply(&nsi, Some(self.owner.smap.get()), None));
        }
        self.keepalive.heard_from(&nsi.id, true);

        // pre-announce the forthcoming change so targets can stand up their
        // get-from-neighbors machinery before the commit
        if nsi.is_target() && self.cluster_started() {
            let smap = self.owner.smap.get();
            if let Ok(pair) = RevPair::from_rev(&*smap, "start-gfn") {
                self.msyncer.clone().notify(true, vec![pair]).await;
            }
        }

        let force_reb = osi.is_some() && nsi.is_target();
        let outcome = self.update_and_distribute(
            &nsi,
            extra_flags(non_electable),
            verb.tag(),
            force_reb,
        )?;
        Ok(self.join_reply(&nsi, outcome.smap, outcome.reb_id))
    }

    /// Administrator-driven join: push current cluster metadata to the
    /// candidate first, then register it. Returns the rebalance ID right
    /// away rather than waiting for the round.
    pub async fn user_register(&self, nsi: Snode) -> Result<ControlMsg> {
        if !self.is_primary() {
            let msg = ControlMsg::Join {
                verb: JoinVerb::UserRegister,
                meta: NodeRegMeta::bare(nsi),
                non_electable: false,
            };
            return self.forward_to_primary(msg, "user-register").await;
        }
        let smap = self.owner.smap.get();
        let bmd = self.owner.bmd.get();
        let pairs = vec![
            RevPair::from_rev(&*smap, "user-register")?,
            RevPair::from_rev(&*bmd, "user-register")?,
        ];
        drop(smap);
        let reply = self
            .transport
            .call(
                &nsi,
                ControlMsg::SyncMeta {
                    caller: self.si.id.clone(),
                    pairs,
                },
                self.config.cplane_operation,
            )
            .await
            .map_err(|e| {
                MembershipError::JoinFailed(format!(
                    "failed to reach {} at {}: {e}",
                    nsi.name(),
                    nsi.public_net
                ))
            })?;
        reply.expect_ok(&nsi.name())?;

        let reg = NodeRegMeta::bare(nsi);
        self.handle_join(JoinVerb::UserRegister, reg, false).await
    }

    fn join_reply(&self, nsi: &Snode, smap: Option<Arc<Smap>>, reb_id: Option<i64>) -> ControlMsg {
        let meta = if nsi.is_target() {
            Some(NodeRegMeta {
                snode: self.si.clone(),
                smap: smap.map(|s| (*s).clone()),
                bmd: Some((*self.owner.bmd.get()).clone()),
                reb: false,
            })
        } else {
            None
        };
        ControlMsg::JoinAccepted { meta, reb_id }
    }

    /// Probe a node's old endpoint; true when something answers there.
    async fn probe_alive(&self, osi: &Snode) -> bool {
        self.transport
            .call(
                osi,
                ControlMsg::Health { reb_status: false },
                self.config.max_keepalive,
            )
            .await
            .is_ok()
    }

    /// Commit a node insertion and distribute the new metadata. The RMD is
    /// bumped inside the same critical section when the delta calls for a
    /// rebalance (or when a known target re-joins, `force_reb`).
    fn update_and_distribute(
        &self,
        nsi: &Snode,
        flags: SnodeFlags,
        action: &str,
        force_reb: bool,
    ) -> Result<JoinOutcome> {
        let prev_active: Cell<BTreeSet<NodeId>> = Cell::new(BTreeSet::new());
        let rmd_out: Cell<Option<Arc<RebMd>>> = Cell::new(None);

        let modifier = Modifier::new(|clone: &mut Smap| {
            if !clone.is_primary(&self.si.id) {
                return Err(MembershipError::NotPrimary {
                    self_id: self.si.name(),
                    primary_id: clone.primary_id.clone(),
                    verb: format!("add {}", nsi.name()),
                }
                .into());
            }
            prev_active.set(clone.active_targets().map(|t| t.id.clone()).collect());
            clone.put_node(nsi.clone(), flags);
            Ok(())
        })
        .with_post(|installed: &Arc<Smap>| {
            if !nsi.is_target() {
                return;
            }
            let prev = prev_active.take();
            let pending = self.owner.rebalance_pending.swap(false, Ordering::SeqCst);
            if !can_run_rebalance(installed) {
                return;
            }
            if force_reb || pending || requires_rebalance(&prev, installed) {
                let res = self.owner.rmd.modify(Modifier::new(|clone: &mut RebMd| {
                    clone.target_ids = vec![nsi.id.clone()];
                    Ok(())
                }));
                if let Ok(rmd) = res {
                    rmd_out.set(Some(rmd));
                }
            }
        });

        let installed = self.owner.smap.modify(modifier)?;
        let rmd = rmd_out.take();

        // distribute: Smap + BMD always; RMD when bumped, and also to keep
        // proxies current (a newly joined proxy can become primary)
        let bmd = self.owner.bmd.get();
        let mut pairs = vec![
            RevPair::from_rev(&*installed, action)?,
            RevPair::from_rev(&*bmd, action)?,
        ];
        if let Some(rmd) = &rmd {
            pairs.push(RevPair::from_rev(&**rmd, action)?);
            self.register_reb_listener(rmd.reb_id(), &installed, None);
        } else if nsi.is_proxy() {
            let cur_rmd = self.owner.rmd.get();
            pairs.push(RevPair::from_rev(&*cur_rmd, action)?);
        }
        self.msyncer.clone().sync(pairs);

        Ok(JoinOutcome {
            smap: Some(installed),
            reb_id: rmd.map(|r| r.reb_id()),
        })
    }

    /// Register the notification listener for a rebalance round on the IC.
    pub(crate) fn register_reb_listener(
        &self,
        reb_id: i64,
        smap: &Smap,
        cb: Option<NotifCallback>,
    ) {
        let uuid = format!("g{reb_id}");
        let owners: Vec<NodeId> = smap.ic.iter().cloned().collect();
        let srcs: Vec<NodeId> = smap.tmap.keys().cloned().collect();
        let mut nl = NotifListener::new(uuid.clone(), "rebalance", owners, srcs);
        if let Some(cb) = cb {
            nl = nl.with_callback(cb);
        }
        if let Err(e) = self.notifs.add(nl) {
            debug!(node = %self.si, %uuid, error = %e, "listener already registered");
        }
    }

    // ---- maintenance / decommission / removal ----

    /// Handle the rm-node action family (`start-maintenance`,
    /// `decommission`, `shutdown-node`). Returns the rebalance ID when one
    /// was scheduled.
    pub async fn rm_node(&self, action: Action) -> Result<Option<i64>> {
        let opts = match &action {
            Action::StartMaintenance(o) | Action::Decommission(o) | Action::ShutdownNode(o) => {
                o.clone()
            }
            _ => return Err(Error::Internal(format!("invalid rm-node action {action:?}"))),
        };
        let smap = self.owner.smap.get();
        let si = smap
            .get_node(&opts.daemon_id)
            .cloned()
            .ok_or_else(|| MembershipError::NodeNotFound(opts.daemon_id.clone()))?;
        if smap.present_in_maint(&si.id) {
            return Err(MembershipError::AlreadyInMaintenance(si.id.clone()).into());
        }
        if si.id == self.si.id {
            return Err(
                MembershipError::NodeIsPrimary(si.id.clone(), action.kind().to_string()).into(),
            );
        }
        drop(smap);

        if si.is_proxy() {
            self.mark_maintenance(&si, &action)?;
            if matches!(action, Action::Decommission(_) | Action::ShutdownNode(_)) {
                self.call_rm_self(&action, &si, true).await?;
            }
            return Ok(None);
        }
        self.start_maintenance_target(&action, &si, &opts).await
    }

    /// Flag the node in the Smap and distribute.
    fn mark_maintenance(&self, si: &Snode, action: &Action) -> Result<()> {
        let flags = match action {
            Action::Decommission(_) => SnodeFlags::MAINTENANCE.set(SnodeFlags::DECOMMISSIONING),
            _ => SnodeFlags::MAINTENANCE,
        };
        let installed = self.owner.smap.modify(Modifier::new(|clone: &mut Smap| {
            if !clone.is_primary(&self.si.id) {
                return Err(MembershipError::NotPrimary {
                    self_id: self.si.name(),
                    primary_id: clone.primary_id.clone(),
                    verb: format!("maintain {}", si.id),
                }
                .into());
            }
            clone.set_node_flags(&si.id, flags)
        }))?;
        let pair = RevPair::from_rev(&*installed, action.kind())?;
        self.msyncer.clone().sync(vec![pair]);
        Ok(())
    }

    /// Flag a target for maintenance and, in the same critical section,
    /// schedule the rebalance it mandates. For decommission/shutdown the
    /// round's listener arranges the final removal on clean completion.
    async fn start_maintenance_target(
        &self,
        action: &Action,
        si: &Snode,
        opts: &RmNodeOpts,
    ) -> Result<Option<i64>> {
        let flags = match action {
            Action::Decommission(_) => SnodeFlags::MAINTENANCE.set(SnodeFlags::DECOMMISSIONING),
            _ => SnodeFlags::MAINTENANCE,
        };
        let prev_active: Cell<BTreeSet<NodeId>> = Cell::new(BTreeSet::new());
        let rmd_out: Cell<Option<Arc<RebMd>>> = Cell::new(None);
        let skip_reb = opts.skip_rebalance || !self.config.rebalance.enabled;

        let modifier = Modifier::new(|clone: &mut Smap| {
            if !clone.is_primary(&self.si.id) {
                return Err(MembershipError::NotPrimary {
                    self_id: self.si.name(),
                    primary_id: clone.primary_id.clone(),
                    verb: format!("maintain {}", si.id),
                }
                .into());
            }
            prev_active.set(clone.active_targets().map(|t| t.id.clone()).collect());
            clone.set_node_flags(&si.id, flags)
        })
        .with_post(|installed: &Arc<Smap>| {
            if skip_reb || !can_run_rebalance(installed) {
                return;
            }
            let prev = prev_active.take();
            if requires_rebalance(&prev, installed) {
                let target_id = si.id.clone();
                let res = self.owner.rmd.modify(Modifier::new(|clone: &mut RebMd| {
                    clone.target_ids = vec![target_id.clone()];
                    Ok(())
                }));
                if let Ok(rmd) = res {
                    rmd_out.set(Some(rmd));
                }
            }
        });

        let installed = self.owner.smap.modify(modifier)?;
        let rmd = rmd_out.take();

        let mut pairs = vec![RevPair::from_rev(&*installed, action.kind())?];
        if let Some(rmd) = &rmd {
            pairs.push(RevPair::from_rev(&**rmd, action.kind())?);
            let cb = if matches!(action, Action::Decommission(_) | Action::ShutdownNode(_)) {
                let this = self.arc();
                let action = action.clone();
                let si = si.clone();
                Some(Arc::new(move |nl: &NotifListener| {
                    this.remove_after_rebalance(nl, action.clone(), si.clone());
                }) as NotifCallback)
            } else {
                None
            };
            self.register_reb_listener(rmd.reb_id(), &installed, cb);
        }
        self.msyncer.clone().sync(pairs);

        if rmd.is_none() {
            // nothing to move around: remove immediately when asked to leave
            if matches!(action, Action::Decommission(_) | Action::ShutdownNode(_)) {
                self.call_rm_self(action, si, true).await?;
            }
            return Ok(None);
        }
        Ok(rmd.map(|r| r.reb_id()))
    }

    /// Terminal-status callback: remove the node only when the round
    /// finished cleanly (not aborted, no error).
    fn remove_after_rebalance(&self, nl: &NotifListener, action: Action, si: Snode) {
        if nl.aborted() || nl.err().is_some() {
            warn!(
                uuid = nl.uuid(),
                aborted = nl.aborted(),
                err = ?nl.err(),
                node = %si,
                "rebalance did not finish cleanly, keeping the node"
            );
            return;
        }
        info!(uuid = nl.uuid(), node = %si, "rebalance finished, removing node");
        let this = self.arc();
        tokio::spawn(async move {
            if let Err(e) = this.call_rm_self(&action, &si, true).await {
                warn!(node = %si, error = %e, "failed to remove node after rebalance");
            }
        });
    }

    /// Ask the node to remove itself (or shut down), then take it out of
    /// the Smap. Proceeds with the removal even when the node stays silent.
    pub async fn call_rm_self(
        &self,
        action: &Action,
        si: &Snode,
        skip_reb: bool,
    ) -> Result<Option<i64>> {
        const RETRIES: usize = 2;
        let smap = self.owner.smap.get();
        let node = smap
            .get_node(&si.id)
            .cloned()
            .ok_or_else(|| MembershipError::NodeNotFound(si.id.clone()))?;
        drop(smap);
        let msg = match action {
            Action::ShutdownNode(_) => ControlMsg::Act(Action::Shutdown),
            _ => ControlMsg::Unreg {
                id: node.id.clone(),
                caller_id: self.si.id.clone(),
            },
        };
        info!(node = %self.si, removing = %node, action = action.kind(), "removing node");
        for attempt in 0..RETRIES {
            match self
                .transport
                .call(&node, msg.clone(), self.config.cplane_operation)
                .await
            {
                Ok(_) => break,
                Err(e) => {
                    warn!(node = %node, error = %e, attempt, "node being removed fails to respond");
                    tokio::time::sleep(self.config.cplane_operation / 2).await;
                }
            }
        }
        // proceeding regardless: the node may already be gone
        self.unreg_node(action.kind(), &si.id, skip_reb)
    }

    /// Remove a node from the Smap; chained RMD bump unless `skip_reb`.
    pub fn unreg_node(&self, tag: &str, sid: &str, skip_reb: bool) -> Result<Option<i64>> {
        let prev_active: Cell<BTreeSet<NodeId>> = Cell::new(BTreeSet::new());
        let rmd_out: Cell<Option<Arc<RebMd>>> = Cell::new(None);

        let modifier = Modifier::new(|clone: &mut Smap| {
            if !clone.is_primary(&self.si.id) {
                return Err(MembershipError::NotPrimary {
                    self_id: self.si.name(),
                    primary_id: clone.primary_id.clone(),
                    verb: format!("remove {sid}"),
                }
                .into());
            }
            prev_active.set(clone.active_targets().map(|t| t.id.clone()).collect());
            if clone.del_node(sid).is_none() {
                return Err(MembershipError::NodeNotFound(sid.to_string()).into());
            }
            Ok(())
        })
        .with_post(|installed: &Arc<Smap>| {
            if skip_reb {
                return;
            }
            let prev = prev_active.take();
            if requires_rebalance(&prev, installed) && can_run_rebalance(installed) {
                let res = self
                    .owner
                    .rmd
                    .modify(Modifier::new(|_clone: &mut RebMd| Ok(())));
                if let Ok(rmd) = res {
                    rmd_out.set(Some(rmd));
                }
            }
        });

        let installed = self.owner.smap.modify(modifier)?;
        let rmd = rmd_out.take();
        self.keepalive.forget(sid);
        self.msyncer.forget_peer(sid);

        let mut pairs = vec![RevPair::from_rev(&*installed, tag)?];
        if let Some(rmd) = &rmd {
            pairs.push(RevPair::from_rev(&**rmd, tag)?);
            self.register_reb_listener(rmd.reb_id(), &installed, None);
        }
        self.msyncer.clone().sync(pairs);
        Ok(rmd.map(|r| r.reb_id()))
    }

    /// Handle `stop-maintenance`: clear the flags; may trigger a rebalance.
    pub async fn stop_maintenance(&self, opts: RmNodeOpts) -> Result<Option<i64>> {
        let smap = self.owner.smap.get();
        let si = smap
            .get_node(&opts.daemon_id)
            .cloned()
            .ok_or_else(|| MembershipError::NodeNotFound(opts.daemon_id.clone()))?;
        if !smap.present_in_maint(&si.id) {
            return Err(MembershipError::NotInMaintenance(si.id.clone()).into());
        }
        drop(smap);

        let prev_active: Cell<BTreeSet<NodeId>> = Cell::new(BTreeSet::new());
        let rmd_out: Cell<Option<Arc<RebMd>>> = Cell::new(None);
        let skip_reb = opts.skip_rebalance;

        let modifier = Modifier::new(|clone: &mut Smap| {
            if !clone.is_primary(&self.si.id) {
                return Err(MembershipError::NotPrimary {
                    self_id: self.si.name(),
                    primary_id: clone.primary_id.clone(),
                    verb: format!("stop-maintenance {}", si.id),
                }
                .into());
            }
            prev_active.set(clone.active_targets().map(|t| t.id.clone()).collect());
            clone.clear_node_flags(&si.id, SnodeFlags::MAINTENANCE_MASK)
        })
        .with_post(|installed: &Arc<Smap>| {
            if skip_reb {
                return;
            }
            let prev = prev_active.take();
            if requires_rebalance(&prev, installed) && can_run_rebalance(installed) {
                let res = self
                    .owner
                    .rmd
                    .modify(Modifier::new(|_clone: &mut RebMd| Ok(())));
                if let Ok(rmd) = res {
                    rmd_out.set(Some(rmd));
                }
            }
        });

        let installed = self.owner.smap.modify(modifier)?;
        let rmd = rmd_out.take();
        let mut pairs = vec![RevPair::from_rev(&*installed, "stop-maintenance")?];
        if let Some(rmd) = &rmd {
            pairs.push(RevPair::from_rev(&**rmd, "stop-maintenance")?);
            self.register_reb_listener(rmd.reb_id(), &installed, None);
        }
        self.msyncer.clone().sync(pairs);
        Ok(rmd.map(|r| r.reb_id()))
    }

    /// Handle a self-initiated removal (`DELETE /daemon/{id}`): the caller
    /// must be the node itself.
    pub fn handle_unreg(&self, id: &str, caller_id: &str) -> Result<()> {
        if caller_id != id {
            return Err(Error::Internal(format!(
                "expecting self-initiated removal ({caller_id} != {id})"
            )));
        }
        self.unreg_node("self-initiated-removal", id, false)
            .map(|_| ())
    }

    // ---- admin-triggered rebalance ----

    /// `xact-start kind=rebalance`: bump the RMD and distribute; the new
    /// version is the rebalance ID.
    pub fn rebalance_cluster(&self) -> Result<i64> {
        if !self.config.rebalance.enabled {
            return Err(crate::error::RebalanceError::Disabled.into());
        }
        let smap = self.owner.smap.get();
        let active = smap.count_active_targets();
        if active < 2 {
            return Err(crate::error::RebalanceError::NotEnoughTargets(active).into());
        }
        let rmd = self
            .owner
            .rmd
            .modify(Modifier::new(|_clone: &mut RebMd| Ok(())))?;
        self.register_reb_listener(rmd.reb_id(), &smap, None);
        let pair = RevPair::from_rev(&*rmd, "rebalance")?;
        self.msyncer.clone().sync(vec![pair]);
        Ok(rmd.reb_id())
    }
}

fn extra_flags(non_electable: bool) -> SnodeFlags {
    if non_electable {
        SnodeFlags::NON_ELECTABLE
    } else {
        SnodeFlags::default()
    }
}
