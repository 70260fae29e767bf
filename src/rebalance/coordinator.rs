//! The per-target rebalance coordinator.
//!
//! One [`Reb`] lives on every target for the lifetime of the process and
//! runs one round at a time. A round is identified by its RebID (the RMD
//! version it started from) and advances through the stages of
//! [`Stage`](crate::rebalance::Stage) monotonically; peers learn about each
//! other's progress from push notifications and status polls.

use crate::config::ClusterConfig;
use crate::error::{Error, RebalanceError, Result};
use crate::meta::{RebMd, Smap, SmapSource};
use crate::metrics::ControlMetrics;
use crate::network::bcast::bcast;
use crate::network::msg::ControlMsg;
use crate::network::transport::Transport;
use crate::placement::hrw_target;
use crate::rebalance::mover::{AckTab, Mover, ObjectInventory};
use crate::rebalance::{RebStatus, Stage, StageTracker};
use crate::types::Snode;
use bytes::Bytes;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many objects a target transmits concurrently during Traverse.
const MAX_SEND_PARALLEL: usize = 8;

/// Re-probe rounds tolerated in the Fin phase before giving up.
const MAX_FIN_RETRIES: usize = 3;

/// Inputs of one round: the cluster map to rebalance towards and the RMD
/// revision that mandated it.
#[derive(Clone)]
pub struct RebArgs {
    pub smap: Arc<Smap>,
    pub rmd: Arc<RebMd>,
}

impl RebArgs {
    pub fn reb_id(&self) -> i64 {
        self.rmd.reb_id()
    }
}

/// The rebalance coordinator of one target.
pub struct Reb {
    si: Snode,
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
    mover: Arc<dyn Mover>,
    inventory: Arc<dyn ObjectInventory>,
    smap_src: Arc<dyn SmapSource>,
    metrics: Arc<ControlMetrics>,

    /// Peer progress, fed by pushes and polls.
    stages: StageTracker,
    /// Outstanding per-destination ACKs of the current round.
    acks: AckTab,

    reb_id: AtomicI64,
    stage: AtomicU8,
    /// Smap version the current round started from.
    reb_smap_version: AtomicI64,
    aborted: AtomicBool,
    running: AtomicBool,
    objs_tx: AtomicI64,
    objs_rx: AtomicI64,
    abort_token: RwLock<CancellationToken>,
}

impl Reb {
    pub fn new(
        si: Snode,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        mover: Arc<dyn Mover>,
        inventory: Arc<dyn ObjectInventory>,
        smap_src: Arc<dyn SmapSource>,
        metrics: Arc<ControlMetrics>,
    ) -> Arc<Self> {
        debug_assert!(si.is_target());
        Arc::new(Self {
            si,
            config,
            transport,
            mover,
            inventory,
            smap_src,
            metrics,
            stages: StageTracker::new(),
            acks: AckTab::new(),
            reb_id: AtomicI64::new(0),
            stage: AtomicU8::new(Stage::Done as u8),
            reb_smap_version: AtomicI64::new(0),
            aborted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            objs_tx: AtomicI64::new(0),
            objs_rx: AtomicI64::new(0),
            abort_token: RwLock::new(CancellationToken::new()),
        })
    }

    /// The round currently (or last) run.
    pub fn reb_id(&self) -> i64 {
        self.reb_id.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> Stage {
        stage_from_u8(self.stage.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn log_hdr(&self) -> String {
        format!("{} g{}", self.si.name(), self.reb_id())
    }

    /// Current status, as served by the health probe.
    pub fn status(&self) -> RebStatus {
        let stage = self.stage();
        RebStatus {
            targets: self.acks.targets_awaited(),
            smap_version: self.smap_src.get_smap().version,
            reb_version: self.reb_smap_version.load(Ordering::SeqCst),
            reb_id: self.reb_id(),
            stage,
            aborted: self.is_aborted(),
            running: self.is_running(),
            quiescent: stage > Stage::Traverse && self.acks.is_empty(),
            objs_tx: self.objs_tx.load(Ordering::SeqCst).max(0) as u64,
            objs_rx: self.objs_rx.load(Ordering::SeqCst).max(0) as u64,
        }
    }

    // ---- round driver ----

    /// Run one round to completion. Returns `Err(Aborted)` when the round
    /// was aborted locally or by a peer.
    pub async fn run_round(self: Arc<Self>, args: RebArgs) -> Result<()> {
        if !self.config.rebalance.enabled {
            return Err(RebalanceError::Disabled.into());
        }
        let id = args.reb_id();
        let cur = self.reb_id();
        if id <= cur {
            return Err(RebalanceError::StaleRound {
                incoming: id,
                current: cur,
            }
            .into());
        }
        // participants are all targets in the map; a node in maintenance
        // still runs the round to push its objects out
        if args.smap.count_targets() < 2 || args.smap.count_active_targets() == 0 {
            return Err(
                RebalanceError::NotEnoughTargets(args.smap.count_active_targets()).into(),
            );
        }

        // round setup
        self.reb_id.store(id, Ordering::SeqCst);
        self.reb_smap_version
            .store(args.smap.version, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.objs_tx.store(0, Ordering::SeqCst);
        self.objs_rx.store(0, Ordering::SeqCst);
        self.acks.clear();
        *self.abort_token.write() = CancellationToken::new();
        self.set_stage(Stage::Init).await;
        self.metrics.reb_rounds.inc();
        info!(reb = %self.log_hdr(), smap_version = args.smap.version, "rebalance round starting");

        let res = self.clone().drive(args).await;

        self.running.store(false, Ordering::SeqCst);
        if self.is_aborted() {
            self.stage.store(Stage::Aborted as u8, Ordering::SeqCst);
            warn!(reb = %self.log_hdr(), "rebalance round aborted");
            return Err(Error::Aborted);
        }
        res?;
        self.set_stage(Stage::Done).await;
        info!(
            reb = %self.log_hdr(),
            objs_tx = self.objs_tx.load(Ordering::SeqCst),
            objs_rx = self.objs_rx.load(Ordering::SeqCst),
            "rebalance round done"
        );
        Ok(())
    }

    async fn drive(self: Arc<Self>, args: RebArgs) -> Result<()> {
        // Init: make sure every peer is up before moving data.
        let errs = self
            .clone()
            .bcast_peers(args.clone(), Self::ping_target)
            .await;
        if errs > 0 || self.is_aborted() {
            self.abort("bootstrap ping failed");
            return Ok(());
        }

        // Traverse: peers must be ready to receive before we transmit.
        self.set_stage(Stage::Traverse).await;
        let errs = self.clone().bcast_peers(args.clone(), Self::rx_ready).await;
        if errs > 0 || self.is_aborted() {
            self.abort("peers not rx-ready");
            return Ok(());
        }
        self.clone().traverse(args.clone()).await;
        if self.is_aborted() {
            return Ok(());
        }

        // EC namespace rebuild slot; nothing to rebuild without EC metadata,
        // but the stage stays observable so peer sequences compare cleanly.
        self.set_stage(Stage::EcNamespace).await;

        // WaitAck
        self.set_stage(Stage::WaitAck).await;
        self.wait_acks(&args).await;
        if self.is_aborted() {
            return Ok(());
        }

        // Fin: wait for everyone else, re-probing on partial failures.
        self.set_stage(Stage::Fin).await;
        for attempt in 0..=MAX_FIN_RETRIES {
            if self.is_aborted() {
                return Ok(());
            }
            let errs = self
                .clone()
                .bcast_peers(args.clone(), Self::wait_fin_extended)
                .await;
            if errs == 0 {
                return Ok(());
            }
            if attempt == MAX_FIN_RETRIES {
                self.abort("peers failed to reach fin");
                return Ok(());
            }
            warn!(reb = %self.log_hdr(), errs, "fin phase incomplete, re-probing");
        }
        Ok(())
    }

    /// Scan the local inventory and transmit every object whose new owner is
    /// a different target. Sends run concurrently, bounded; the pending-ACK
    /// sets drain as replies arrive while the round sits in WaitAck.
    async fn traverse(self: Arc<Self>, args: RebArgs) {
        let reb_id = args.reb_id();
        let sem = Arc::new(Semaphore::new(MAX_SEND_PARALLEL));
        let mut sends: JoinSet<()> = JoinSet::new();

        for name in self.inventory.names() {
            if self.is_aborted() {
                break;
            }
            let owner = match hrw_target(&args.smap, &name) {
                Ok(t) => t.clone(),
                Err(e) => {
                    error!(reb = %self.log_hdr(), %name, error = %e, "no placement, aborting");
                    self.abort_and_broadcast(&args).await;
                    break;
                }
            };
            if owner.id == self.si.id {
                continue;
            }
            self.acks.add(&owner.id, &name);
            let reb = self.clone();
            let sem = sem.clone();
            let args = args.clone();
            sends.spawn(async move {
                let Ok(_permit) = sem.acquire().await else { return };
                reb.send_one(&args, reb_id, owner, name).await;
            });
        }
        // the scan is exhausted; detach the drain so WaitAck can observe
        // pending sets emptying out
        tokio::spawn(async move { while sends.join_next().await.is_some() {} });
    }

    async fn send_one(&self, args: &RebArgs, reb_id: i64, dst: Snode, name: String) {
        if self.is_aborted() {
            return;
        }
        // deleted between traverse and send: success, nothing to move
        let Some(data) = self.inventory.read(&name) else {
            self.acks.ack(&dst.id, &name);
            return;
        };
        let size = data.len() as u64;
        match self.mover.send_obj(&dst, reb_id, &name, data).await {
            Ok(()) => {
                self.inventory.remove(&name);
                self.acks.ack(&dst.id, &name);
                self.objs_tx.fetch_add(1, Ordering::SeqCst);
                self.metrics.reb_objs_tx.inc();
                self.metrics.reb_bytes_tx.add(size);
                if self.config.verbose >= 4 {
                    debug!(reb = %self.log_hdr(), %name, dst = %dst, "moved");
                }
            }
            Err(e) => {
                error!(reb = %self.log_hdr(), %name, dst = %dst, error = %e,
                    "send failed, aborting round");
                self.abort_and_broadcast(args).await;
            }
        }
    }

    /// Block in WaitAck until every pending set drains, or every pending
    /// peer has itself reached Fin (at which point missing ACKs are
    /// logically satisfied: the peer no longer needs them).
    async fn wait_acks(&self, args: &RebArgs) {
        let sleep = self.config.cplane_operation;
        let max_wait = self.config.rebalance.dest_retry_time;
        let mut waited = Duration::ZERO;
        let reb_id = args.reb_id();
        loop {
            if self.is_aborted() {
                return;
            }
            let awaited = self.acks.targets_awaited();
            if awaited.is_empty() {
                return;
            }
            let all_fin = awaited
                .iter()
                .all(|peer| self.stages.is_in_stage(peer, reb_id, Stage::Fin));
            if all_fin {
                debug!(reb = %self.log_hdr(), pending = self.acks.pending_total(),
                    "pending peers all reached fin, acks logically satisfied");
                return;
            }
            if waited >= max_wait {
                error!(reb = %self.log_hdr(), pending = self.acks.pending_total(),
                    "timed out waiting for acks");
                self.abort("ack wait timed out");
                return;
            }
            if self.aborted_after(sleep).await.is_err() {
                return;
            }
            waited += sleep;
        }
    }

    // ---- abort ----

    /// Abort the local round. Edge-triggered and idempotent; every sleeping
    /// wait wakes through the round's cancellation token.
    pub fn abort(&self, reason: &str) {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(reb = %self.log_hdr(), reason, "aborting rebalance");
            self.abort_token.read().cancel();
        }
    }

    /// Abort locally and tell every other target to do the same.
    pub async fn abort_and_broadcast(&self, args: &RebArgs) {
        let already = self.is_aborted();
        self.abort("global abort");
        if already {
            return;
        }
        let msg = ControlMsg::StagePush {
            caller: self.si.id.clone(),
            reb_id: args.reb_id(),
            stage: Stage::Aborted,
        };
        let peers = self.other_targets(&args.smap);
        let transport = self.transport.clone();
        let timeout = self.config.cplane_operation;
        bcast(peers, self.config.max_bcast_parallel, move |tsi| {
            let transport = transport.clone();
            let msg = msg.clone();
            async move { transport.call(&tsi, msg, timeout).await.is_ok() }
        })
        .await;
    }

    /// Sleep `d` unless the round aborts first.
    pub async fn aborted_after(&self, d: Duration) -> Result<()> {
        let token = self.abort_token.read().clone();
        tokio::select! {
            _ = token.cancelled() => Err(Error::Aborted),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    // ---- incoming ----

    /// Handle a pushed stage notification from a peer.
    ///
    /// An abort learned through a push is propagated locally without an
    /// outgoing broadcast (the sender already did it); a *newer-round* push
    /// likewise only kills the stale local round.
    pub fn handle_stage_push(&self, caller: &str, reb_id: i64, stage: Stage) {
        self.stages.set(caller, reb_id, stage);
        let local = self.reb_id();
        if !self.is_running() {
            return;
        }
        if stage == Stage::Aborted && reb_id >= local {
            warn!(reb = %self.log_hdr(), %caller, peer_reb = reb_id, "peer aborted, following");
            self.abort("peer pushed abort");
        } else if reb_id > local {
            warn!(reb = %self.log_hdr(), %caller, peer_reb = reb_id, "peer runs a newer round");
            self.abort("superseded by a newer round");
        }
    }

    /// Handle one received object; the reply is the ACK.
    pub fn handle_obj_put(
        &self,
        caller: &str,
        reb_id: i64,
        name: String,
        data: Vec<u8>,
    ) -> ControlMsg {
        let size = data.len() as u64;
        self.inventory.put(name.clone(), Bytes::from(data));
        self.objs_rx.fetch_add(1, Ordering::SeqCst);
        self.metrics.reb_objs_rx.inc();
        self.metrics.reb_bytes_rx.add(size);
        if self.config.verbose >= 4 {
            debug!(reb = %self.log_hdr(), %name, from = caller, from_reb = reb_id, "received");
        }
        ControlMsg::ObjAck { name }
    }

    // ---- peer probing (broadcast callbacks) ----

    /// Probe that a peer is up at all. Four attempts spaced by the base RPC
    /// timeout; gives up early when a newer Smap supersedes the round.
    async fn ping_target(self: Arc<Self>, tsi: Snode, args: RebArgs) -> bool {
        let sleep = self.config.cplane_operation;
        let ver = args.smap.version;
        for i in 0..4 {
            match self
                .transport
                .call(
                    &tsi,
                    ControlMsg::Health { reb_status: false },
                    self.config.max_keepalive,
                )
                .await
            {
                Ok(_) => {
                    if i > 0 {
                        info!(reb = %self.log_hdr(), peer = %tsi, "is online");
                    }
                    return true;
                }
                Err(e) if !e.is_unreachable() => {
                    error!(reb = %self.log_hdr(), peer = %tsi, error = %e,
                        "health probe rejected, aborting");
                    return false;
                }
                Err(e) => {
                    warn!(reb = %self.log_hdr(), peer = %tsi, error = %e, "waiting for peer");
                }
            }
            tokio::time::sleep(sleep).await;
            if self.smap_src.get_smap().version > ver {
                return false;
            }
        }
        error!(reb = %self.log_hdr(), peer = %tsi, "timed out waiting for peer");
        false
    }

    /// Wait for a peer to get ready to receive objects (reach Traverse).
    async fn rx_ready(self: Arc<Self>, tsi: Snode, args: RebArgs) -> bool {
        let sleep = self.config.cplane_operation * 2;
        let max_wait =
            self.config.rebalance.dest_retry_time + self.config.rebalance.dest_retry_time / 2;
        let mut waited = Duration::ZERO;
        let reb_id = args.reb_id();
        while waited < max_wait {
            if self.stages.is_in_stage(&tsi.id, reb_id, Stage::Traverse) {
                // pushed notification arrived; no need to poll
                return true;
            }
            let (_, ok) = self.check_glob_status(&tsi, Stage::Traverse, &args).await;
            if ok {
                return true;
            }
            if self.aborted_after(sleep).await.is_err() {
                debug!(reb = %self.log_hdr(), peer = %tsi, "abort rx-ready");
                return false;
            }
            waited += sleep;
        }
        error!(reb = %self.log_hdr(), peer = %tsi, "timed out waiting for rx-ready");
        false
    }

    /// Wait for a peer to reach Fin. A peer stuck in WaitAck counts as done
    /// when it is provably not waiting for any ACK from us.
    async fn wait_fin_extended(self: Arc<Self>, tsi: Snode, args: RebArgs) -> bool {
        let sleep = self.config.cplane_operation;
        let sleep_retry = self.config.keepalive_retry;
        let max_wait = self.config.rebalance.dest_retry_time;
        let mut waited = Duration::ZERO;
        let reb_id = args.reb_id();
        while waited < max_wait {
            if self.aborted_after(sleep).await.is_err() {
                debug!(reb = %self.log_hdr(), peer = %tsi, "abort wack");
                return false;
            }
            waited += sleep;
            if self.stages.is_in_stage(&tsi.id, reb_id, Stage::Fin) {
                return true;
            }
            let (status, ok) = self.check_glob_status(&tsi, Stage::Fin, &args).await;
            if ok {
                return true;
            }
            if self.is_aborted() {
                return false;
            }
            let Some(status) = status else { continue };
            // peer in wait-ack: is it waiting for ACKs from me?
            let w4me = status.targets.iter().any(|id| *id == self.si.id);
            if !w4me {
                info!(reb = %self.log_hdr(), peer = %tsi, stage = %status.stage,
                    "ok (not waiting for me)");
                return true;
            }
            debug!(reb = %self.log_hdr(), peer = %tsi, stage = %status.stage, "keep wack");
            tokio::time::sleep(sleep_retry).await;
            waited += sleep_retry;
        }
        error!(reb = %self.log_hdr(), peer = %tsi, "timed out waiting for fin");
        false
    }

    /// Poll a peer's rebalance status and enforce the round's epoch rules;
    /// may abort the current round. Returns the status (when obtained) and
    /// whether the peer has reached `desired`.
    async fn check_glob_status(
        &self,
        tsi: &Snode,
        desired: Stage,
        args: &RebArgs,
    ) -> (Option<RebStatus>, bool) {
        let probe = ControlMsg::Health { reb_status: true };
        let mut reply = self
            .transport
            .call(tsi, probe.clone(), self.config.max_keepalive)
            .await;
        if reply.is_err() {
            if self
                .aborted_after(self.config.keepalive_retry)
                .await
                .is_err()
            {
                return (None, false);
            }
            // retry once
            reply = self
                .transport
                .call(tsi, probe, self.config.max_keepalive)
                .await;
        }
        let status = match reply {
            Err(e) => {
                error!(reb = %self.log_hdr(), peer = %tsi, error = %e,
                    "status probe failed, aborting");
                self.abort_and_broadcast(args).await;
                return (None, false);
            }
            Ok(ControlMsg::HealthReply { reb: Some(s), .. }) => s,
            Ok(ControlMsg::HealthReply { reb: None, .. }) => {
                // peer not rebalancing yet; let it catch up
                return (None, false);
            }
            Ok(_) => {
                error!(reb = %self.log_hdr(), peer = %tsi, "unexpected status reply, aborting");
                self.abort_and_broadcast(args).await;
                return (None, false);
            }
        };
        let local = self.reb_id();
        // enforce the global round epoch
        if status.reb_id > local {
            error!(reb = %self.log_hdr(), peer = %tsi, peer_reb = status.reb_id,
                "peer runs a newer round, aborting");
            self.abort_and_broadcast(args).await;
            return (Some(status), false);
        }
        if status.reb_id < local {
            warn!(reb = %self.log_hdr(), peer = %tsi, peer_reb = status.reb_id,
                "peer runs an older round, keep waiting");
            return (Some(status), false);
        }
        // same round, peer aborted: follow without re-broadcasting
        if status.aborted {
            warn!(reb = %self.log_hdr(), peer = %tsi, "peer aborted the round, following");
            self.abort("peer aborted");
            return (Some(status), false);
        }
        self.stages.set(&tsi.id, status.reb_id, status.stage);
        if status.stage >= desired {
            return (Some(status), true);
        }
        debug!(reb = %self.log_hdr(), peer = %tsi, at = %status.stage, want = %desired,
            "not yet at the right stage");
        (Some(status), false)
    }

    // ---- fan-out plumbing ----

    fn other_targets(&self, smap: &Smap) -> Vec<Snode> {
        smap.tmap
            .values()
            .filter(|t| t.id != self.si.id)
            .cloned()
            .collect()
    }

    async fn bcast_peers<F, Fut>(self: Arc<Self>, args: RebArgs, cb: F) -> usize
    where
        F: Fn(Arc<Reb>, Snode, RebArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let peers = self.other_targets(&args.smap);
        self.metrics.bcast_inflight.inc();
        let reb = self.clone();
        let errs = bcast(peers, self.config.max_bcast_parallel, move |tsi| {
            cb(reb.clone(), tsi, args.clone())
        })
        .await;
        self.metrics.bcast_inflight.dec();
        errs
    }

    /// Install a stage locally and push it to every other target.
    async fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
        let reb_id = self.reb_id();
        let smap = self.smap_src.get_smap();
        let peers = self.other_targets(&smap);
        if peers.is_empty() {
            return;
        }
        let msg = ControlMsg::StagePush {
            caller: self.si.id.clone(),
            reb_id,
            stage,
        };
        let transport = self.transport.clone();
        let timeout = self.config.cplane_operation;
        // best-effort: pushes only short-circuit polling
        bcast(peers, self.config.max_bcast_parallel, move |tsi| {
            let transport = transport.clone();
            let msg = msg.clone();
            async move { transport.call(&tsi, msg, timeout).await.is_ok() }
        })
        .await;
    }
}

fn stage_from_u8(v: u8) -> Stage {
    match v {
        x if x == Stage::Init as u8 => Stage::Init,
        x if x == Stage::Traverse as u8 => Stage::Traverse,
        x if x == Stage::EcNamespace as u8 => Stage::EcNamespace,
        x if x == Stage::WaitAck as u8 => Stage::WaitAck,
        x if x == Stage::Fin as u8 => Stage::Fin,
        x if x == Stage::Done as u8 => Stage::Done,
        _ => Stage::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip_u8() {
        for stage in [
            Stage::Init,
            Stage::Traverse,
            Stage::EcNamespace,
            Stage::WaitAck,
            Stage::Fin,
            Stage::Done,
            Stage::Aborted,
        ] {
            assert_eq!(stage_from_u8(stage as u8), stage);
        }
    }
}
