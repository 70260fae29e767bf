//! Metadata replication (metasync).
//!
//! The primary pushes every committed metadata revision to all other nodes.
//! Delivery is at-least-once with per-peer progress tracking: a peer is only
//! sent revisions strictly newer than what it has acknowledged, one batch
//! per round trip, in increasing version order per metadata kind.
//!
//! Unreachable peers are retried with exponential backoff bounded by the
//! keepalive window. The metasyncer never evicts anybody: persistent
//! failures are reported through the degraded-peer callback and left to the
//! membership controller.

use crate::config::ClusterConfig;
use crate::meta::{RevKind, RevPair, SmapSource};
use crate::metrics::ControlMetrics;
use crate::network::msg::ControlMsg;
use crate::network::transport::Transport;
use crate::types::{NodeId, Snode};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Callback invoked when a peer keeps rejecting or timing out.
pub type DegradedPeerCb = Arc<dyn Fn(&NodeId) + Send + Sync>;

/// The revision replicator running on the primary.
pub struct Metasyncer {
    si: Snode,
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
    smap_src: Arc<dyn SmapSource>,
    metrics: Arc<ControlMetrics>,

    /// Highest acknowledged version per peer per metadata kind.
    acked: DashMap<NodeId, HashMap<RevKind, i64>>,
    /// Per-peer send serialization, preserving per-kind version order.
    peer_locks: DashMap<NodeId, Arc<AsyncMutex<()>>>,
    /// Cleared by `become_non_primary`.
    primary: AtomicBool,
    degraded_cb: parking_lot::RwLock<Option<DegradedPeerCb>>,
}

impl Metasyncer {
    pub fn new(
        si: Snode,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        smap_src: Arc<dyn SmapSource>,
        metrics: Arc<ControlMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            si,
            config,
            transport,
            smap_src,
            metrics,
            acked: DashMap::new(),
            peer_locks: DashMap::new(),
            primary: AtomicBool::new(true),
            degraded_cb: parking_lot::RwLock::new(None),
        })
    }

    /// Install the degraded-peer callback.
    pub fn on_degraded(&self, cb: DegradedPeerCb) {
        *self.degraded_cb.write() = Some(cb);
    }

    /// Stop initiating new syncs (incoming ones are unaffected; receiving is
    /// the node's business, not the syncer's).
    pub fn become_non_primary(&self) {
        if self.primary.swap(false, Ordering::SeqCst) {
            info!(node = %self.si, "metasyncer: becoming non-primary");
        }
    }

    /// Resume the primary role (after winning a handover).
    pub fn become_primary(&self) {
        self.primary.store(true, Ordering::SeqCst);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Replicate a batch of `(revision, message)` pairs to every other node
    /// currently in the Smap. Returns a handle resolving to the number of
    /// peers that could not be reached even after retries.
    pub fn sync(self: Arc<Self>, pairs: Vec<RevPair>) -> JoinHandle<usize> {
        let syncer = self.clone();
        tokio::spawn(async move { syncer.do_sync(pairs, true).await })
    }

    /// Fire-and-forget fan-out used to pre-announce forthcoming changes
    /// (e.g. start-GFN before a target join commits). With `wait` the call
    /// returns after one delivery attempt per peer; errors are not retried.
    pub async fn notify(self: Arc<Self>, wait: bool, pairs: Vec<RevPair>) {
        let syncer = self.clone();
        let fut = async move { syncer.do_sync(pairs, false).await };
        if wait {
            fut.await;
        } else {
            tokio::spawn(fut);
        }
    }

    async fn do_sync(self: Arc<Self>, pairs: Vec<RevPair>, is_sync: bool) -> usize {
        if !self.is_primary() {
            warn!(node = %self.si, "sync requested on a non-primary, dropping");
            return 0;
        }
        let smap = self.smap_src.get_smap();
        let peers: Vec<Snode> = smap
            .pmap
            .values()
            .chain(smap.tmap.values())
            .filter(|node| node.id != self.si.id)
            .cloned()
            .collect();
        if peers.is_empty() {
            return 0;
        }
        self.metrics.sync_count.inc();
        debug!(node = %self.si, peers = peers.len(), pairs = pairs.len(), "metasync");

        let mut set = JoinSet::new();
        for peer in peers {
            let syncer = self.clone();
            let pairs = pairs.clone();
            set.spawn(async move { syncer.sync_one(peer, pairs, is_sync).await });
        }
        let mut failed = 0;
        while let Some(res) = set.join_next().await {
            if !res.unwrap_or(false) {
                failed += 1;
            }
        }
        if failed > 0 {
            self.metrics.sync_fail_count.add(failed as u64);
        }
        failed
    }

    /// Deliver one batch to one peer; true on success.
    async fn sync_one(self: Arc<Self>, peer: Snode, pairs: Vec<RevPair>, is_sync: bool) -> bool {
        let lock = self
            .peer_locks
            .entry(peer.id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        // send only revisions strictly newer than what the peer has acked;
        // pre-announcements carry the current (already-delivered) versions
        // and bypass progress tracking entirely
        let pending: Vec<RevPair> = if is_sync {
            let acked = self.acked.get(&peer.id);
            pairs
                .into_iter()
                .filter(|p| match &acked {
                    Some(a) => a.get(&p.kind).map_or(true, |v| p.version > *v),
                    None => true,
                })
                .collect()
        } else {
            pairs
        };
        if pending.is_empty() {
            return true;
        }

        let msg = if is_sync {
            ControlMsg::SyncMeta {
                caller: self.si.id.clone(),
                pairs: pending.clone(),
            }
        } else {
            ControlMsg::PreAnnounce {
                caller: self.si.id.clone(),
                pairs: pending.clone(),
            }
        };
        let mut backoff = self.config.cplane_operation;
        let deadline = tokio::time::Instant::now() + self.config.max_keepalive * 4;
        loop {
            match self
                .transport
                .call(&peer, msg.clone(), self.config.cplane_operation)
                .await
                .and_then(|reply| reply.expect_ok(&peer.name()))
            {
                Ok(()) => {
                    if is_sync {
                        let mut acked = self.acked.entry(peer.id.clone()).or_default();
                        for p in &pending {
                            let v = acked.entry(p.kind).or_insert(0);
                            *v = (*v).max(p.version);
                        }
                    }
                    return true;
                }
                Err(e) => {
                    if !is_sync {
                        debug!(peer = %peer, error = %e, "notify delivery failed");
                        return false;
                    }
                    if !self.is_primary() {
                        return false;
                    }
                    // a peer the primary has since removed is dropped from
                    // the retry set
                    if self.smap_src.get_smap().get_node(&peer.id).is_none() {
                        debug!(peer = %peer, "peer left the cluster, dropping retries");
                        self.acked.remove(&peer.id);
                        return false;
                    }
                    if tokio::time::Instant::now() + backoff > deadline {
                        warn!(peer = %peer, error = %e, "metasync delivery failed, reporting degraded");
                        if let Some(cb) = self.degraded_cb.read().clone() {
                            cb(&peer.id);
                        }
                        return false;
                    }
                    warn!(peer = %peer, error = %e, backoff = ?backoff, "metasync retry");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_keepalive);
                }
            }
        }
    }

    /// Forget a peer's progress (it re-registers from scratch).
    pub fn forget_peer(&self, id: &str) {
        self.acked.remove(id);
        self.peer_locks.remove(id);
    }

    /// Highest version of `kind` acknowledged by `peer`.
    pub fn acked_version(&self, peer: &str, kind: RevKind) -> Option<i64> {
        self.acked.get(peer).and_then(|m| m.get(&kind).copied())
    }
}
