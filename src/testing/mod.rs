//! Testing utilities for the cluster control plane.
//!
//! The centerpiece is [`TestCluster`], an in-process cluster fixture wiring
//! real [`ProxyNode`]s and [`TargetNode`]s over the loopback transport, so
//! end-to-end membership and rebalance scenarios run without sockets.
//! [`ScriptedPeer`] stands in for a target when a test needs to dictate the
//! exact status a peer reports.

mod metasync_tests;
mod reb_epoch_tests;

use crate::config::ClusterConfig;
use crate::network::msg::ControlMsg;
use crate::network::transport::{LoopbackTransport, MsgHandler};
use crate::node::{ProxyNode, TargetNode};
use crate::placement::hrw_target;
use crate::rebalance::mover::{MemInventory, ObjectInventory};
use crate::rebalance::{RebStatus, Stage};
use crate::types::{NetAddr, NodeId, NodeRole, Snode};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Node identity helpers shared by the fixtures.
pub fn proxy_snode(i: usize) -> Snode {
    Snode::new(
        format!("p{i}"),
        NodeRole::Proxy,
        NetAddr::new("127.0.0.1", 8080 + i as u16),
    )
}

pub fn target_snode(i: usize) -> Snode {
    Snode::new(
        format!("t{i}"),
        NodeRole::Target,
        NetAddr::new("127.0.0.1", 9090 + i as u16),
    )
}

/// Poll `cond` until it holds or `timeout` elapses; true when it held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An in-process cluster over the loopback transport.
pub struct TestCluster {
    pub transport: Arc<LoopbackTransport>,
    pub config: ClusterConfig,
    pub proxies: Vec<Arc<ProxyNode>>,
    pub targets: Vec<Arc<TargetNode>>,
}

impl TestCluster {
    /// Start a cluster with `n_proxies` (first one primary) and `n_targets`
    /// targets, waiting for the initial joins to settle.
    pub async fn start(n_proxies: usize, n_targets: usize) -> Self {
        assert!(n_proxies >= 1);
        let transport = LoopbackTransport::new();
        let config = ClusterConfig::fast_for_tests();

        let p1 = proxy_snode(1);
        let primary = ProxyNode::new_primary(
            p1.clone(),
            config.clone(),
            "U-test",
            transport.clone(),
        );
        transport.register(p1.id.clone(), primary.clone());
        primary.ctrl.mark_cluster_started().await;

        let mut cluster = Self {
            transport,
            config,
            proxies: vec![primary],
            targets: Vec::new(),
        };
        for i in 2..=n_proxies {
            cluster.add_proxy(i).await;
        }
        for i in 1..=n_targets {
            cluster.add_target(i).await;
        }
        // let metadata converge and any join-triggered rounds run out
        // before the test proper
        let smap_v = cluster.primary().owner.smap.get().version;
        let rmd_v = cluster.primary().owner.rmd.get().version;
        let converged = wait_until(Duration::from_secs(5), || async {
            cluster.targets.iter().all(|t| {
                t.owner.smap.get().version == smap_v
                    && t.owner.rmd.get().version == rmd_v
                    && t.reb.reb_id() == rmd_v
                    && !t.reb.is_running()
            }) && cluster
                .proxies
                .iter()
                .all(|p| p.owner.smap.get().version == smap_v)
        })
        .await;
        assert!(converged, "test cluster failed to converge at startup");
        cluster
    }

    pub fn primary(&self) -> &Arc<ProxyNode> {
        &self.proxies[0]
    }

    pub fn target(&self, id: &str) -> &Arc<TargetNode> {
        self.targets
            .iter()
            .find(|t| t.si.id == id)
            .unwrap_or_else(|| panic!("no target {id}"))
    }

    pub async fn add_proxy(&mut self, i: usize) -> Arc<ProxyNode> {
        let psi = proxy_snode(i);
        let proxy = ProxyNode::new_secondary(psi.clone(), self.config.clone(), self.transport.clone());
        self.transport.register(psi.id.clone(), proxy.clone());
        proxy
            .join_cluster(&self.proxies[0].si)
            .await
            .expect("proxy join");
        self.proxies.push(proxy.clone());
        proxy
    }

    pub async fn add_target(&mut self, i: usize) -> Arc<TargetNode> {
        let tsi = target_snode(i);
        let target = TargetNode::new(
            tsi.clone(),
            self.config.clone(),
            self.transport.clone(),
            MemInventory::new(),
        );
        self.transport.register(tsi.id.clone(), target.clone());
        target
            .join_cluster(&self.proxies[0].si, false)
            .await
            .expect("target join");
        self.targets.push(target.clone());
        target
    }

    /// Seed `n` objects, each placed on its current HRW owner.
    pub fn seed_objects(&self, n: usize) -> Vec<String> {
        let smap = self.primary().owner.smap.get();
        let mut names = Vec::with_capacity(n);
        for i in 0..n {
            let name = format!("bucket/obj-{i:04}");
            let owner = hrw_target(&smap, &name).expect("placement");
            self.target(&owner.id)
                .inventory
                .put(name.clone(), Bytes::from(format!("payload-{i}")));
            names.push(name);
        }
        names
    }

    /// Wait until every (non-leaving) target's coordinator is idle.
    pub async fn wait_rounds_settled(&self, timeout: Duration) -> bool {
        wait_until(timeout, || async {
            self.targets
                .iter()
                .filter(|t| !t.is_shutting_down())
                .all(|t| !t.reb.is_running())
        })
        .await
    }

    /// Wait for round `reb_id` to reach `Done` on every running target.
    pub async fn wait_round_done(&self, reb_id: i64, timeout: Duration) -> bool {
        wait_until(timeout, || async {
            self.targets
                .iter()
                .filter(|t| !t.is_shutting_down())
                .all(|t| {
                    t.reb.reb_id() == reb_id
                        && !t.reb.is_running()
                        && t.reb.stage() == Stage::Done
                })
        })
        .await
    }

    /// Assert that each of `names` lives on exactly one target, and that the
    /// target is its HRW owner under the primary's current map.
    pub fn assert_placement(&self, names: &[String]) {
        let smap = self.primary().owner.smap.get();
        for name in names {
            let owner = hrw_target(&smap, name).expect("placement").id.clone();
            let holders: Vec<NodeId> = self
                .targets
                .iter()
                .filter(|t| t.inventory.contains(name))
                .map(|t| t.si.id.clone())
                .collect();
            assert_eq!(
                holders,
                vec![owner.clone()],
                "object {name} should live only on {owner}"
            );
        }
    }
}

/// A fake target with a scripted rebalance status and a log of everything it
/// receives. Used to pin down the coordinator's epoch rules.
pub struct ScriptedPeer {
    pub id: NodeId,
    pub status: RwLock<Option<RebStatus>>,
    pub received: Mutex<Vec<ControlMsg>>,
}

impl ScriptedPeer {
    pub fn new(id: impl Into<NodeId>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            status: RwLock::new(None),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Script the status returned to `reb_status` probes.
    pub fn set_status(&self, status: RebStatus) {
        *self.status.write() = Some(status);
    }

    /// Count received abort pushes.
    pub fn abort_pushes(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|m| matches!(m, ControlMsg::StagePush { stage: Stage::Aborted, .. }))
            .count()
    }
}

#[async_trait]
impl MsgHandler for ScriptedPeer {
    async fn handle(&self, msg: ControlMsg) -> ControlMsg {
        self.received.lock().push(msg.clone());
        match msg {
            ControlMsg::Health { reb_status } => ControlMsg::HealthReply {
                smap_version: self
                    .status
                    .read()
                    .as_ref()
                    .map(|s| s.smap_version)
                    .unwrap_or(0),
                started: true,
                reb: if reb_status {
                    self.status.read().clone()
                } else {
                    None
                },
            },
            ControlMsg::ObjPut { name, .. } => ControlMsg::ObjAck { name },
            _ => ControlMsg::Ok,
        }
    }
}

/// A neutral status for scripting peers.
pub fn scripted_status(reb_id: i64, stage: Stage) -> RebStatus {
    RebStatus {
        targets: Vec::new(),
        smap_version: 1,
        reb_version: 1,
        reb_id,
        stage,
        aborted: stage == Stage::Aborted,
        running: !stage.is_terminal(),
        quiescent: stage > Stage::Traverse,
        objs_tx: 0,
        objs_rx: 0,
    }
}
