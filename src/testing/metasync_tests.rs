//! Metasyncer behavior against scripted peers.

#[cfg(test)]
mod tests {
    use crate::meta::{RevKind, RevPair, RevType};
    use crate::network::msg::ControlMsg;
    use crate::testing::{wait_until, TestCluster};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test(flavor = "multi_thread")]
    async fn test_progress_tracking_skips_delivered_versions() {
        let cluster = TestCluster::start(1, 2).await;
        let msyncer = &cluster.primary().msyncer;
        let smap = cluster.primary().owner.smap.get();

        // the joins already delivered the current map to both targets
        let tracked = wait_until(LONG, || async {
            msyncer.acked_version("t1", RevKind::Smap) == Some(smap.version())
        })
        .await;
        assert!(tracked);
        let acked = msyncer.acked_version("t1", RevKind::Smap);

        // re-syncing the same version is a no-op that still succeeds
        let pair = RevPair::from_rev(&*smap, "noop").unwrap();
        let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(msyncer.acked_version("t1", RevKind::Smap), acked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_degraded_peer_reported_not_evicted() {
        let cluster = TestCluster::start(1, 2).await;
        let msyncer = cluster.primary().msyncer.clone();

        let degraded = Arc::new(AtomicUsize::new(0));
        let degraded2 = degraded.clone();
        msyncer.on_degraded(Arc::new(move |id| {
            assert_eq!(id, "t2");
            degraded2.fetch_add(1, Ordering::SeqCst);
        }));

        cluster.transport.sever("t2");
        // force a fresh revision so t2 has something undelivered
        let smap = {
            let installed = cluster
                .primary()
                .owner
                .smap
                .modify(crate::meta::Modifier::new(|_clone| Ok(())))
                .unwrap();
            installed
        };
        let pair = RevPair::from_rev(&*smap, "test-bump").unwrap();
        let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
        assert_eq!(failed, 1);
        assert_eq!(degraded.load(Ordering::SeqCst), 1);

        // the peer is still in the map: metasync never evicts
        assert!(cluster.primary().owner.smap.get().get_target("t2").is_some());

        // once reachable again, the next sync catches the peer up
        cluster.transport.restore("t2");
        let pair = RevPair::from_rev(&*smap, "catch-up").unwrap();
        let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
        assert_eq!(failed, 0);
        let caught_up = wait_until(LONG, || async {
            cluster.target("t2").owner.smap.get().version == smap.version
        })
        .await;
        assert!(caught_up);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_peer_delivery_order_is_increasing() {
        use crate::membership::MetaOwner;
        use crate::meta::{BucketMd, Modifier, RebMd, Smap, SmapSource};
        use crate::metasync::Metasyncer;
        use crate::network::transport::LoopbackTransport;
        use crate::testing::{proxy_snode, target_snode, ScriptedPeer};
        use crate::types::SnodeFlags;

        let transport = LoopbackTransport::new();
        let peer = ScriptedPeer::new("t1");
        transport.register("t1", peer.clone());

        let mut smap = Smap::new("U-order", proxy_snode(1));
        smap.put_node(target_snode(1), SnodeFlags::default());
        let owner = MetaOwner::new(smap, RebMd::new("U-order"), BucketMd::new("U-order"));
        let msyncer = Metasyncer::new(
            proxy_snode(1),
            crate::ClusterConfig::fast_for_tests(),
            transport,
            owner.clone() as Arc<dyn SmapSource>,
            Arc::new(crate::metrics::ControlMetrics::new()),
        );

        // three consecutive revisions, synced one after the other
        for _ in 0..3 {
            let installed = owner
                .smap
                .modify(Modifier::new(|_clone: &mut Smap| Ok(())))
                .unwrap();
            let pair = RevPair::from_rev(&*installed, "bump").unwrap();
            let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
            assert_eq!(failed, 0);
        }

        // the peer observed strictly increasing smap versions
        let versions: Vec<i64> = peer
            .received
            .lock()
            .iter()
            .filter_map(|m| match m {
                ControlMsg::SyncMeta { pairs, .. } => {
                    pairs.iter().find(|p| p.kind == RevKind::Smap).map(|p| p.version)
                }
                _ => None,
            })
            .collect();
        assert_eq!(versions.len(), 3);
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_become_non_primary_stops_initiating() {
        let cluster = TestCluster::start(1, 1).await;
        let msyncer = cluster.primary().msyncer.clone();
        msyncer.become_non_primary();

        let smap = cluster.primary().owner.smap.get();
        let pair = RevPair::from_rev(&*smap, "late").unwrap();
        let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
        assert_eq!(failed, 0); // dropped without attempting anything
        assert!(!msyncer.is_primary());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_proxy_receives_rmd() {
        let mut cluster = TestCluster::start(1, 2).await;
        cluster.seed_objects(8);
        // give the cluster a non-trivial RMD first
        cluster.primary().ctrl.rebalance_cluster().unwrap();
        cluster.wait_rounds_settled(LONG).await;
        let rmd_v = cluster.primary().owner.rmd.get().version;
        assert!(rmd_v > 0);

        // a newly joined proxy can become primary in a second: it must be
        // handed the current RMD along with the map
        let proxy = cluster.add_proxy(2).await;
        let synced = wait_until(LONG, || async {
            proxy.owner.rmd.get().version == rmd_v
        })
        .await;
        assert!(synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_revision_rejected_on_receive() {
        let cluster = TestCluster::start(1, 1).await;
        let target = cluster.target("t1");
        let version = target.owner.smap.get().version;

        // replaying an old revision must not regress the target's map
        let mut stale = (*cluster.primary().owner.smap.get()).clone();
        stale.version = 1;
        let pair = RevPair::from_rev(&stale, "stale").unwrap();
        let reply = crate::network::transport::MsgHandler::handle(
            &**target,
            ControlMsg::SyncMeta {
                caller: "p1".to_string(),
                pairs: vec![pair],
            },
        )
        .await;
        assert!(matches!(reply, ControlMsg::Ok));
        assert_eq!(target.owner.smap.get().version, version);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_foreign_cluster_uuid_rejected() {
        let cluster = TestCluster::start(1, 1).await;
        let target = cluster.target("t1");

        let mut foreign = (*cluster.primary().owner.smap.get()).clone();
        foreign.uuid = "U-other".to_string();
        foreign.version += 10;
        let pair = RevPair::from_rev(&foreign, "foreign").unwrap();
        let reply = crate::network::transport::MsgHandler::handle(
            &**target,
            ControlMsg::SyncMeta {
                caller: "px".to_string(),
                pairs: vec![pair],
            },
        )
        .await;
        match reply {
            ControlMsg::Err { code, message } => {
                assert_eq!(code, 409);
                assert!(message.contains("UUID mismatch"), "{message}");
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removed_peer_dropped_from_retry() {
        let cluster = TestCluster::start(1, 2).await;
        let msyncer = cluster.primary().msyncer.clone();
        cluster.transport.sever("t1");

        // remove t1 while it is unreachable; the pending retries drop it
        cluster
            .primary()
            .ctrl
            .unreg_node("test-removal", "t1", true)
            .unwrap();
        let installed = cluster.primary().owner.smap.get();
        assert!(installed.get_target("t1").is_none());

        let pair = RevPair::from_rev(&*installed, "after-removal").unwrap();
        let failed = msyncer.clone().sync(vec![pair]).await.unwrap();
        // t2 got it; t1 is no longer a peer at all
        assert_eq!(failed, 0);
        assert_eq!(msyncer.acked_version("t1", RevKind::Smap), None);
    }
}
