//! Node wiring: the proxy and target daemons.
//!
//! [`ProxyNode`] and [`TargetNode`] assemble the control-plane components
//! (metadata stores, metasyncer, membership controller, rebalance
//! coordinator) and dispatch incoming [`ControlMsg`] traffic to them. Both
//! implement [`MsgHandler`], so they plug into the framed-TCP server and the
//! in-process loopback transport alike.

use crate::config::ClusterConfig;
use crate::error::{Error, MembershipError, Result};
use crate::membership::{MembershipController, MetaOwner};
use crate::meta::{BucketMd, RebMd, RevKind, RevPair, Smap, SmapSource};
use crate::metasync::Metasyncer;
use crate::metrics::ControlMetrics;
use crate::network::msg::ControlMsg;
use crate::network::transport::{MsgHandler, Transport};
use crate::notify::{NotifListener, NotifRegistry};
use crate::rebalance::{Reb, RebArgs, TransportMover};
use crate::rebalance::mover::ObjectInventory;
use crate::types::{Action, JoinVerb, NodeRegMeta, Snode, WhatQuery, XactReq};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

fn err_reply(e: Error) -> ControlMsg {
    ControlMsg::from_err(&e)
}

/// Install a metasync batch into a node's stores; returns the RMD revision
/// when a strictly newer one was delivered.
fn install_pairs(
    owner: &MetaOwner,
    si: &Snode,
    caller: &str,
    pairs: Vec<RevPair>,
) -> Result<Option<Arc<RebMd>>> {
    // Smap and BMD first; RMD last, so a round never starts against a map
    // older than the revision that mandated it.
    let mut rmd_pair = None;
    for pair in pairs {
        match pair.kind {
            RevKind::Smap => {
                let incoming: Smap = pair.decode()?;
                let ver = incoming.version;
                if owner.smap.install_newer(incoming, &si.name(), caller)? {
                    debug!(node = %si, version = ver, action = %pair.action, "installed smap");
                }
            }
            RevKind::Bmd => {
                let incoming: BucketMd = pair.decode()?;
                owner.bmd.install_newer(incoming, &si.name(), caller)?;
            }
            RevKind::Rmd => rmd_pair = Some(pair),
        }
    }
    if let Some(pair) = rmd_pair {
        let incoming: RebMd = pair.decode()?;
        let arc = Arc::new(incoming.clone());
        if owner.rmd.install_newer(incoming, &si.name(), caller)? {
            return Ok(Some(arc));
        }
    }
    Ok(None)
}

// ---------------- proxy ----------------

/// A proxy daemon: gateway plus (when primary) the cluster control plane.
pub struct ProxyNode {
    pub si: Snode,
    pub config: ClusterConfig,
    pub owner: Arc<MetaOwner>,
    pub ctrl: Arc<MembershipController>,
    pub msyncer: Arc<Metasyncer>,
    pub notifs: Arc<NotifRegistry>,
    pub metrics: Arc<ControlMetrics>,
    transport: Arc<dyn Transport>,
    shutting_down: AtomicBool,
    /// Runtime configuration overrides received via `set-config`.
    config_overrides: RwLock<serde_json::Value>,
}

impl ProxyNode {
    /// Bootstrap the first (primary) proxy of a brand-new cluster.
    pub fn new_primary(
        si: Snode,
        config: ClusterConfig,
        cluster_uuid: &str,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let smap = Smap::new(cluster_uuid, si.clone());
        let owner = MetaOwner::new(
            smap,
            RebMd::new(cluster_uuid),
            BucketMd::new(cluster_uuid),
        );
        Self::assemble(si, config, owner, transport)
    }

    /// Create a non-primary proxy that will join an existing cluster.
    pub fn new_secondary(
        si: Snode,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        // empty UUID: adopted from the first installed revision
        let mut smap = Smap::new("", si.clone());
        smap.version = 0;
        let owner = MetaOwner::new(smap, RebMd::new(""), BucketMd::new(""));
        Self::assemble(si, config, owner, transport)
    }

    fn assemble(
        si: Snode,
        config: ClusterConfig,
        owner: Arc<MetaOwner>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let metrics = Arc::new(ControlMetrics::new());
        let notifs = Arc::new(NotifRegistry::new());
        let msyncer = Metasyncer::new(
            si.clone(),
            config.clone(),
            transport.clone(),
            owner.clone() as Arc<dyn SmapSource>,
            metrics.clone(),
        );
        let ctrl = MembershipController::new(
            si.clone(),
            config.clone(),
            owner.clone(),
            msyncer.clone(),
            transport.clone(),
            notifs.clone(),
            metrics.clone(),
        );
        Arc::new(Self {
            si,
            config,
            owner,
            ctrl,
            msyncer,
            notifs,
            metrics,
            transport,
            shutting_down: AtomicBool::new(false),
            config_overrides: RwLock::new(serde_json::Value::Null),
        })
    }

    /// Join an existing cluster through any of its proxies.
    pub async fn join_cluster(&self, via: &Snode) -> Result<()> {
        self.msyncer.become_non_primary();
        let reg = NodeRegMeta {
            snode: self.si.clone(),
            smap: Some((*self.owner.smap.get()).clone()),
            bmd: None,
            reb: false,
        };
        let reply = self
            .transport
            .call(
                via,
                ControlMsg::Join {
                    verb: JoinVerb::SelfRegister,
                    meta: reg,
                    non_electable: self.si.non_electable(),
                },
                self.config.cplane_operation,
            )
            .await?;
        match reply {
            ControlMsg::JoinAccepted { .. } | ControlMsg::Ok => Ok(()),
            other => other.reject(&via.name()).map(|_| ()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Dispatch an administrative cluster action.
    async fn handle_action(&self, action: Action) -> ControlMsg {
        // every mutating action except the ownership-table transfer runs on
        // the primary
        if !matches!(action, Action::SendOwnershipTbl { .. }) && !self.ctrl.is_primary() {
            let reply = self
                .ctrl
                .forward_to_primary(ControlMsg::Act(action), "cluster action")
                .await;
            return match reply {
                Ok(msg) => msg,
                Err(e) => err_reply(e),
            };
        }
        match action {
            Action::SetConfig(value) => self.set_config(value).await,
            Action::Shutdown => self.cluster_shutdown().await,
            Action::XactStart(req) => self.xact_start_stop(true, req).await,
            Action::XactStop(req) => self.xact_start_stop(false, req).await,
            Action::SendOwnershipTbl { dst_id } => self.send_own_tbl(&dst_id).await,
            Action::StartMaintenance(_) | Action::Decommission(_) | Action::ShutdownNode(_) => {
                match self.ctrl.rm_node(action).await {
                    Ok(Some(reb_id)) => ControlMsg::Blob {
                        value: serde_json::json!({ "reb_id": format!("g{reb_id}") }),
                    },
                    Ok(None) => ControlMsg::Ok,
                    Err(e) => err_reply(e),
                }
            }
            Action::StopMaintenance(opts) => match self.ctrl.stop_maintenance(opts).await {
                Ok(Some(reb_id)) => ControlMsg::Blob {
                    value: serde_json::json!({ "reb_id": format!("g{reb_id}") }),
                },
                Ok(None) => ControlMsg::Ok,
                Err(e) => err_reply(e),
            },
            Action::SetPrimary { id } => match self.ctrl.set_primary(&id).await {
                Ok(()) => ControlMsg::Ok,
                Err(e) => err_reply(e),
            },
        }
    }

    /// `set-config`: apply locally, then fan out to every node.
    async fn set_config(&self, value: serde_json::Value) -> ControlMsg {
        if !value.is_object() {
            return err_reply(Error::Config("set-config value must be an object".into()));
        }
        self.apply_config(&value);
        let smap = self.owner.smap.get();
        let nodes: Vec<Snode> = smap
            .pmap
            .values()
            .chain(smap.tmap.values())
            .filter(|n| n.id != self.si.id)
            .cloned()
            .collect();
        drop(smap);
        let results = crate::network::bcast::bcast_collect(
            self.transport.clone(),
            nodes,
            ControlMsg::DaemonAct(Action::SetConfig(value)),
            self.config.cplane_operation,
            self.config.max_bcast_parallel,
        )
        .await;
        for (node, res) in results {
            if let Err(e) = res {
                self.ctrl.keepalive.on_err(&node.id, &e);
                return err_reply(e);
            }
        }
        ControlMsg::Ok
    }

    fn apply_config(&self, value: &serde_json::Value) {
        let mut overrides = self.config_overrides.write();
        if overrides.is_null() {
            *overrides = serde_json::Value::Object(Default::default());
        }
        if let (Some(dst), Some(src)) = (overrides.as_object_mut(), value.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
    }

    /// Read a runtime configuration override applied via `set-config`.
    pub fn config_override(&self, key: &str) -> Option<serde_json::Value> {
        self.config_overrides.read().get(key).cloned()
    }

    /// Proxy-controlled cluster shutdown: every node, then self.
    async fn cluster_shutdown(&self) -> ControlMsg {
        info!(node = %self.si, "proxy-controlled cluster shutdown");
        let smap = self.owner.smap.get();
        let nodes: Vec<Snode> = smap
            .pmap
            .values()
            .chain(smap.tmap.values())
            .filter(|n| n.id != self.si.id)
            .cloned()
            .collect();
        drop(smap);
        crate::network::bcast::bcast_collect(
            self.transport.clone(),
            nodes,
            ControlMsg::DaemonAct(Action::Shutdown),
            self.config.cplane_operation,
            self.config.max_bcast_parallel,
        )
        .await;
        self.shutting_down.store(true, Ordering::SeqCst);
        ControlMsg::Ok
    }

    /// Start or stop a long-running activity cluster-wide.
    async fn xact_start_stop(&self, start: bool, mut req: XactReq) -> ControlMsg {
        if start && req.kind == "rebalance" {
            return match self.ctrl.rebalance_cluster() {
                Ok(reb_id) => ControlMsg::Blob {
                    value: serde_json::json!({ "id": format!("g{reb_id}") }),
                },
                Err(e) => err_reply(e),
            };
        }
        if req.id.is_empty() && start {
            req.id = uuid::Uuid::new_v4().simple().to_string();
        }
        let smap = self.owner.smap.get();
        let targets: Vec<Snode> = if req.node.is_empty() {
            smap.tmap.values().cloned().collect()
        } else {
            match smap.get_target(&req.node) {
                Some(t) => vec![t.clone()],
                None => {
                    return err_reply(
                        MembershipError::NodeNotFound(req.node.clone()).into(),
                    )
                }
            }
        };
        let action = if start {
            Action::XactStart(req.clone())
        } else {
            Action::XactStop(req.clone())
        };
        let results = crate::network::bcast::bcast_collect(
            self.transport.clone(),
            targets,
            ControlMsg::DaemonAct(action),
            self.config.cplane_operation,
            self.config.max_bcast_parallel,
        )
        .await;
        for (_node, res) in &results {
            if let Err(e) = res {
                return err_reply(Error::Internal(e.to_string()));
            }
        }
        if start {
            let srcs = results.iter().map(|(n, _)| n.id.clone()).collect();
            let owners = smap.ic.iter().cloned().collect();
            let nl = NotifListener::new(req.id.clone(), req.kind.clone(), owners, srcs);
            if let Err(e) = self.notifs.add(nl) {
                debug!(node = %self.si, error = %e, "listener exists");
            }
            return ControlMsg::Blob {
                value: serde_json::json!({ "id": req.id }),
            };
        }
        ControlMsg::Ok
    }

    /// Transfer the notification ownership table to an IC member.
    async fn send_own_tbl(&self, dst_id: &str) -> ControlMsg {
        let smap = self.owner.smap.get();
        let dst = match smap.get_proxy(dst_id) {
            Some(p) => p.clone(),
            None => return err_reply(MembershipError::NodeNotFound(dst_id.to_string()).into()),
        };
        if !smap.is_ic(dst_id) {
            return err_reply(Error::Internal(format!("{} is not an IC member", dst.name())));
        }
        if smap.is_ic(&self.si.id) && self.si.id != dst_id {
            let msg = ControlMsg::OwnershipTbl {
                caller: self.si.id.clone(),
                entries: self.notifs.ownership_table(),
            };
            return match self
                .transport
                .call(&dst, msg, self.config.cplane_operation)
                .await
            {
                Ok(_) => ControlMsg::Ok,
                Err(e) => err_reply(e),
            };
        }
        // not an IC member ourselves: hand the request to one that is
        for pid in smap.ic.iter().filter(|pid| *pid != dst_id) {
            if let Some(psi) = smap.get_proxy(pid) {
                let reply = self
                    .transport
                    .call(
                        psi,
                        ControlMsg::Act(Action::SendOwnershipTbl {
                            dst_id: dst_id.to_string(),
                        }),
                        self.config.cplane_operation,
                    )
                    .await;
                return match reply {
                    Ok(msg) => msg,
                    Err(e) => err_reply(e),
                };
            }
        }
        err_reply(Error::Internal("no IC member to forward to".to_string()))
    }

    fn daemon_query(&self, what: WhatQuery) -> ControlMsg {
        match what {
            WhatQuery::Stats => ControlMsg::Blob {
                value: serde_json::json!(self.metrics.snapshot()),
            },
            WhatQuery::Sysinfo => ControlMsg::Blob {
                value: serde_json::json!({
                    "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
                    "role": "proxy",
                }),
            },
            _ => err_reply(Error::Config(format!("invalid daemon query {what:?}"))),
        }
    }

    fn receive_pairs(&self, caller: &str, pairs: Vec<RevPair>) -> Result<()> {
        let rmd = install_pairs(&self.owner, &self.si, caller, pairs)?;
        let smap = self.owner.smap.get();
        // track primaryship: the map is authoritative
        if smap.is_primary(&self.si.id) {
            self.msyncer.become_primary();
        } else {
            self.msyncer.become_non_primary();
        }
        if let Some(rmd) = rmd {
            // IC members pick up the round's listener from the revision
            if smap.is_ic(&self.si.id) {
                let nl = NotifListener::new(
                    rmd.reb_id_string(),
                    "rebalance",
                    smap.ic.iter().cloned().collect(),
                    smap.tmap.keys().cloned().collect(),
                );
                if let Err(e) = self.notifs.add(nl) {
                    debug!(node = %self.si, error = %e, "listener exists");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MsgHandler for ProxyNode {
    async fn handle(&self, msg: ControlMsg) -> ControlMsg {
        if self.is_shutting_down() && !matches!(msg, ControlMsg::Health { .. }) {
            return err_reply(Error::Aborted);
        }
        match msg {
            ControlMsg::Join {
                verb: JoinVerb::UserRegister,
                meta,
                ..
            } => match self.ctrl.user_register(meta.snode).await {
                Ok(reply) => reply,
                Err(e) => err_reply(e),
            },
            ControlMsg::Join {
                verb,
                meta,
                non_electable,
            } => match self.ctrl.handle_join(verb, meta, non_electable).await {
                Ok(reply) => reply,
                Err(e) => err_reply(e),
            },
            ControlMsg::SyncMeta { caller, pairs } => {
                match self.receive_pairs(&caller, pairs) {
                    Ok(()) => ControlMsg::Ok,
                    Err(e) => err_reply(e),
                }
            }
            ControlMsg::PreAnnounce { caller, pairs } => {
                for pair in &pairs {
                    debug!(node = %self.si, from = %caller, action = %pair.action, "pre-announce");
                }
                ControlMsg::Ok
            }
            ControlMsg::Health { .. } => ControlMsg::HealthReply {
                smap_version: self.owner.smap.get().version,
                started: self.ctrl.cluster_started(),
                reb: None,
            },
            ControlMsg::Act(action) => self.handle_action(action).await,
            ControlMsg::DaemonAct(Action::Shutdown) => {
                self.shutting_down.store(true, Ordering::SeqCst);
                ControlMsg::Ok
            }
            ControlMsg::DaemonAct(Action::SetConfig(value)) => {
                self.apply_config(&value);
                ControlMsg::Ok
            }
            ControlMsg::DaemonAct(other) => {
                err_reply(Error::Config(format!("invalid daemon action {:?}", other.kind())))
            }
            ControlMsg::SetPrimary { id, prepare } => {
                match self.ctrl.handle_set_primary(&id, prepare) {
                    Ok(()) => ControlMsg::Ok,
                    Err(e) => err_reply(e),
                }
            }
            ControlMsg::DaemonQuery { what } => self.daemon_query(what),
            ControlMsg::XactNotif {
                caller,
                uuid,
                aborted,
                err,
            } => {
                debug!(node = %self.si, from = %caller, %uuid, aborted, "xact notification");
                self.notifs.on_finished(&uuid, aborted, err);
                ControlMsg::Ok
            }
            ControlMsg::OwnershipTbl { caller, entries } => {
                debug!(node = %self.si, from = %caller, n = entries.len(), "ownership table");
                self.notifs.merge_table(entries);
                ControlMsg::Ok
            }
            ControlMsg::Unreg { id, caller_id } => {
                if id == self.si.id {
                    // the primary asked us to leave
                    info!(node = %self.si, "leaving the cluster");
                    self.shutting_down.store(true, Ordering::SeqCst);
                    return ControlMsg::Ok;
                }
                if !self.ctrl.is_primary() {
                    let msg = ControlMsg::Unreg {
                        id: id.clone(),
                        caller_id,
                    };
                    return match self.ctrl.forward_to_primary(msg, "unregister").await {
                        Ok(reply) => reply,
                        Err(e) => err_reply(e),
                    };
                }
                match self.ctrl.handle_unreg(&id, &caller_id) {
                    Ok(()) => ControlMsg::Ok,
                    Err(e) => err_reply(e),
                }
            }
            other => err_reply(Error::Internal(format!(
                "proxy cannot handle message {other:?}"
            ))),
        }
    }
}

// ---------------- target ----------------

/// A target daemon: object storage plus the per-target rebalance
/// coordinator.
pub struct TargetNode {
    pub si: Snode,
    pub config: ClusterConfig,
    pub owner: Arc<MetaOwner>,
    pub reb: Arc<Reb>,
    pub inventory: Arc<dyn ObjectInventory>,
    pub metrics: Arc<ControlMetrics>,
    transport: Arc<dyn Transport>,
    shutting_down: AtomicBool,
    started: AtomicBool,
    config_overrides: RwLock<serde_json::Value>,
    /// Back-reference for handlers that spawn work outliving the call.
    self_ref: Mutex<Weak<Self>>,
}

impl TargetNode {
    pub fn new(
        si: Snode,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        inventory: Arc<dyn ObjectInventory>,
    ) -> Arc<Self> {
        let owner = MetaOwner::new(Smap::empty(), RebMd::new(""), BucketMd::new(""));
        let metrics = Arc::new(ControlMetrics::new());
        let mover = Arc::new(TransportMover::new(
            si.id.clone(),
            transport.clone(),
            config.max_keepalive,
        ));
        let reb = Reb::new(
            si.clone(),
            config.clone(),
            transport.clone(),
            mover,
            inventory.clone(),
            owner.clone() as Arc<dyn SmapSource>,
            metrics.clone(),
        );
        let node = Arc::new(Self {
            si,
            config,
            owner,
            reb,
            inventory,
            metrics,
            transport,
            shutting_down: AtomicBool::new(false),
            started: AtomicBool::new(true),
            config_overrides: RwLock::new(serde_json::Value::Null),
            self_ref: Mutex::new(Weak::new()),
        });
        *node.self_ref.lock() = Arc::downgrade(&node);
        node
    }

    fn arc(&self) -> Arc<Self> {
        // set in new() before the value escapes
        self.self_ref.lock().upgrade().expect("target self-ref")
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Self-register with the cluster through `via` (usually the primary).
    pub async fn join_cluster(&self, via: &Snode, resume_reb: bool) -> Result<()> {
        let reg = NodeRegMeta {
            snode: self.si.clone(),
            smap: {
                let smap = self.owner.smap.get();
                (smap.version > 0).then(|| (*smap).clone())
            },
            bmd: {
                let bmd = self.owner.bmd.get();
                (!bmd.uuid.is_empty()).then(|| (*bmd).clone())
            },
            reb: resume_reb,
        };
        let reply = self
            .transport
            .call(
                via,
                ControlMsg::Join {
                    verb: JoinVerb::SelfRegister,
                    meta: reg,
                    non_electable: false,
                },
                self.config.cplane_operation,
            )
            .await?;
        match reply {
            ControlMsg::JoinAccepted { meta: Some(meta), .. } => {
                if let Some(smap) = meta.smap {
                    self.owner
                        .smap
                        .install_newer(smap, &self.si.name(), &meta.snode.name())?;
                }
                if let Some(bmd) = meta.bmd {
                    self.owner
                        .bmd
                        .install_newer(bmd, &self.si.name(), &meta.snode.name())?;
                }
                Ok(())
            }
            ControlMsg::JoinAccepted { meta: None, .. } | ControlMsg::Ok => Ok(()),
            other => other.reject(&via.name()).map(|_| ()),
        }
    }

    /// Send one keepalive beat to the primary.
    pub async fn keepalive_once(&self) -> Result<()> {
        let smap = self.owner.smap.get();
        let primary = smap
            .primary()
            .cloned()
            .ok_or_else(|| MembershipError::NotPrimary {
                self_id: self.si.name(),
                primary_id: "<none>".to_string(),
                verb: "keepalive".to_string(),
            })?;
        drop(smap);
        let reg = NodeRegMeta {
            snode: self.si.clone(),
            smap: Some((*self.owner.smap.get()).clone()),
            bmd: None,
            reb: false,
        };
        let reply = self
            .transport
            .call(
                &primary,
                ControlMsg::Join {
                    verb: JoinVerb::Keepalive,
                    meta: reg,
                    non_electable: false,
                },
                self.config.max_keepalive,
            )
            .await?;
        match reply {
            ControlMsg::Ok | ControlMsg::JoinAccepted { .. } => Ok(()),
            other => other.reject(&primary.name()).map(|_| ()),
        }
    }

    /// Spawn the periodic keepalive beat. Stops once the node starts
    /// shutting down; transient send failures are left to the next beat.
    pub fn start_keepalive(&self) -> tokio::task::JoinHandle<()> {
        let this = self.arc();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.config.stats_time).await;
                if this.is_shutting_down() {
                    return;
                }
                if let Err(e) = this.keepalive_once().await {
                    debug!(node = %this.si, error = %e, "keepalive beat failed");
                }
            }
        })
    }

    /// Install a received batch; a strictly newer RMD starts a round.
    fn receive_pairs(&self, caller: &str, pairs: Vec<RevPair>) -> Result<()> {
        let rmd = install_pairs(&self.owner, &self.si, caller, pairs)?;
        if let Some(rmd) = rmd {
            self.spawn_round(rmd);
        }
        Ok(())
    }

    fn spawn_round(&self, rmd: Arc<RebMd>) {
        let smap = self.owner.smap.get();
        if smap.get_target(&self.si.id).is_none() {
            warn!(node = %self.si, "not in the cluster map, skipping rebalance");
            return;
        }
        let args = RebArgs {
            smap,
            rmd: rmd.clone(),
        };
        let this = self.arc();
        tokio::spawn(async move {
            let res = this.reb.clone().run_round(args).await;
            let (aborted, err) = match &res {
                Ok(()) => (false, None),
                Err(Error::Aborted) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            this.notify_ic(rmd.reb_id_string(), aborted, err).await;
        });
    }

    /// Report a terminal activity status to every IC member.
    async fn notify_ic(&self, uuid: String, aborted: bool, err: Option<String>) {
        let smap = self.owner.smap.get();
        for pid in smap.ic.iter() {
            let Some(psi) = smap.get_proxy(pid) else { continue };
            let msg = ControlMsg::XactNotif {
                caller: self.si.id.clone(),
                uuid: uuid.clone(),
                aborted,
                err: err.clone(),
            };
            if let Err(e) = self
                .transport
                .call(psi, msg, self.config.cplane_operation)
                .await
            {
                debug!(node = %self.si, to = %psi, error = %e, "xact notification failed");
            }
        }
    }

    fn daemon_query(&self, what: WhatQuery) -> ControlMsg {
        match what {
            WhatQuery::Stats => ControlMsg::Blob {
                value: serde_json::json!(self.metrics.snapshot()),
            },
            WhatQuery::Sysinfo => ControlMsg::Blob {
                value: serde_json::json!({
                    "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
                    "role": "target",
                    "objects": self.inventory.len(),
                }),
            },
            WhatQuery::Mountpaths => ControlMsg::Blob {
                value: serde_json::json!({ "available": ["/"], "disabled": [] }),
            },
            WhatQuery::Xaction => ControlMsg::Blob {
                value: serde_json::json!(self.reb.status()),
            },
            WhatQuery::RemoteCluster => ControlMsg::Blob {
                value: serde_json::json!({}),
            },
            _ => err_reply(Error::Config(format!("invalid daemon query {what:?}"))),
        }
    }

    fn apply_config(&self, value: &serde_json::Value) {
        let mut overrides = self.config_overrides.write();
        if overrides.is_null() {
            *overrides = serde_json::Value::Object(Default::default());
        }
        if let (Some(dst), Some(src)) = (overrides.as_object_mut(), value.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
    }

    /// Read a runtime configuration override applied via `set-config`.
    pub fn config_override(&self, key: &str) -> Option<serde_json::Value> {
        self.config_overrides.read().get(key).cloned()
    }

    fn handle_daemon_action(&self, action: Action) -> ControlMsg {
        match action {
            Action::Shutdown => {
                self.shutting_down.store(true, Ordering::SeqCst);
                ControlMsg::Ok
            }
            Action::SetConfig(value) => {
                self.apply_config(&value);
                ControlMsg::Ok
            }
            Action::XactStop(req) if req.kind == "rebalance" => {
                self.reb.abort("administratively stopped");
                ControlMsg::Ok
            }
            Action::XactStart(req) if req.kind == "resilver" => {
                // local-only resilver: the data plane is external, so the
                // activity completes as soon as it is acknowledged
                let this = self.arc();
                let uuid = req.id.clone();
                tokio::spawn(async move {
                    this.notify_ic(uuid, false, None).await;
                });
                ControlMsg::Ok
            }
            Action::XactStart(req) | Action::XactStop(req) => {
                debug!(node = %self.si, kind = %req.kind, "no-op xaction verb");
                ControlMsg::Ok
            }
            other => err_reply(Error::Config(format!(
                "invalid daemon action {:?}",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl MsgHandler for TargetNode {
    async fn handle(&self, msg: ControlMsg) -> ControlMsg {
        // a shutting-down daemon keeps answering health probes and stage
        // pushes so peers can finish their rounds against it
        if self.is_shutting_down()
            && !matches!(msg, ControlMsg::Health { .. } | ControlMsg::StagePush { .. })
        {
            return err_reply(Error::Aborted);
        }
        match msg {
            ControlMsg::SyncMeta { caller, pairs } => match self.receive_pairs(&caller, pairs) {
                Ok(()) => ControlMsg::Ok,
                Err(e) => err_reply(e),
            },
            ControlMsg::PreAnnounce { caller, pairs } => {
                for pair in &pairs {
                    debug!(node = %self.si, from = %caller, action = %pair.action, "pre-announce");
                }
                ControlMsg::Ok
            }
            ControlMsg::Health { reb_status } => ControlMsg::HealthReply {
                smap_version: self.owner.smap.get().version,
                started: self.started.load(Ordering::SeqCst),
                reb: reb_status.then(|| self.reb.status()),
            },
            ControlMsg::StagePush {
                caller,
                reb_id,
                stage,
            } => {
                self.reb.handle_stage_push(&caller, reb_id, stage);
                ControlMsg::Ok
            }
            ControlMsg::ObjPut {
                caller,
                reb_id,
                name,
                data,
            } => self.reb.handle_obj_put(&caller, reb_id, name, data),
            ControlMsg::DaemonAct(action) => self.handle_daemon_action(action),
            ControlMsg::DaemonQuery { what } => self.daemon_query(what),
            ControlMsg::SetPrimary { id, prepare } => {
                // targets track the handover through their local map
                if prepare {
                    return ControlMsg::Ok;
                }
                let res = self.owner.smap.modify(crate::meta::Modifier::new(
                    |clone: &mut Smap| {
                        if clone.get_proxy(&id).is_none() {
                            return Err(MembershipError::NodeNotFound(id.clone()).into());
                        }
                        clone.primary_id = id.clone();
                        clone.staff_ic();
                        Ok(())
                    },
                ));
                match res {
                    Ok(_) => ControlMsg::Ok,
                    Err(e) => err_reply(e),
                }
            }
            ControlMsg::Unreg { id, .. } if id == self.si.id => {
                info!(node = %self.si, "leaving the cluster");
                self.shutting_down.store(true, Ordering::SeqCst);
                ControlMsg::Ok
            }
            other => err_reply(Error::Internal(format!(
                "target cannot handle message {other:?}"
            ))),
        }
    }
}
