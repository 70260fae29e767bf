//! Rebalance epoch rules, pinned down with scripted peers.
//!
//! A real target runs its round against fake peers whose status replies are
//! dictated by the test, which makes the abort-propagation rules exactly
//! reproducible.

#[cfg(test)]
mod tests {
    use crate::meta::{RevPair, Smap};
    use crate::network::msg::ControlMsg;
    use crate::network::transport::{LoopbackTransport, MsgHandler};
    use crate::node::TargetNode;
    use crate::rebalance::mover::MemInventory;
    use crate::rebalance::Stage;
    use crate::testing::{proxy_snode, scripted_status, target_snode, wait_until, ScriptedPeer};
    use crate::types::SnodeFlags;
    use crate::ClusterConfig;
    use std::sync::Arc;
    use std::time::Duration;

    const LONG: Duration = Duration::from_secs(10);

    /// One real target (`t1`) plus two scripted peers in a three-target map.
    struct EpochFixture {
        transport: Arc<LoopbackTransport>,
        target: Arc<TargetNode>,
        t2: Arc<ScriptedPeer>,
        t3: Arc<ScriptedPeer>,
        smap: Smap,
    }

    impl EpochFixture {
        fn new() -> Self {
            let transport = LoopbackTransport::new();
            let config = ClusterConfig::fast_for_tests();

            let mut smap = Smap::new("U-epoch", proxy_snode(1));
            for i in 1..=3 {
                smap.put_node(target_snode(i), SnodeFlags::default());
            }
            smap.version = 5;

            let target = TargetNode::new(
                target_snode(1),
                config,
                transport.clone(),
                MemInventory::new(),
            );
            transport.register("t1", target.clone());
            let t2 = ScriptedPeer::new("t2");
            let t3 = ScriptedPeer::new("t3");
            transport.register("t2", t2.clone());
            transport.register("t3", t3.clone());

            Self {
                transport,
                target,
                t2,
                t3,
                smap,
            }
        }

        /// Deliver a metasync batch installing the map and an RMD of
        /// version `reb_id`, which starts round `reb_id` on the target.
        async fn start_round(&self, reb_id: i64) {
            let mut rmd = crate::meta::RebMd::new("U-epoch");
            rmd.version = reb_id;
            let pairs = vec![
                RevPair::from_rev(&self.smap, "test").unwrap(),
                RevPair::from_rev(&rmd, "test").unwrap(),
            ];
            let reply = self
                .target
                .handle(ControlMsg::SyncMeta {
                    caller: "p1".to_string(),
                    pairs,
                })
                .await;
            assert!(matches!(reply, ControlMsg::Ok), "{reply:?}");
        }
    }

    // S5 -- a peer on a newer round aborts the local round, with an
    // outgoing abort broadcast
    #[tokio::test(flavor = "multi_thread")]
    async fn test_epoch_newer_peer_aborts_and_broadcasts() {
        let fx = EpochFixture::new();
        // both peers claim to be on round 6 already
        fx.t2.set_status(scripted_status(6, Stage::Traverse));
        fx.t3.set_status(scripted_status(6, Stage::Traverse));

        fx.start_round(5).await;

        let aborted = wait_until(LONG, || async {
            fx.target.reb.is_aborted() && !fx.target.reb.is_running()
        })
        .await;
        assert!(aborted, "round 5 should abort against round-6 peers");
        assert_eq!(fx.target.reb.stage(), Stage::Aborted);

        // the abort was broadcast to the other targets
        let broadcast = wait_until(LONG, || async {
            fx.t2.abort_pushes() > 0 && fx.t3.abort_pushes() > 0
        })
        .await;
        assert!(broadcast, "abort must be re-broadcast on a poll-discovered newer round");
    }

    // boundary -- an abort learned via push propagates locally without an
    // outgoing broadcast
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_abort_not_rebroadcast() {
        let fx = EpochFixture::new();
        // peers report the same round, parked in wait-ack and claiming to
        // wait for our ACKs, which keeps the local fin phase alive
        let mut waiting = scripted_status(5, Stage::WaitAck);
        waiting.targets = vec!["t1".to_string()];
        fx.t2.set_status(waiting.clone());
        fx.t3.set_status(waiting);

        fx.start_round(5).await;
        let running = wait_until(LONG, || async { fx.target.reb.is_running() }).await;
        assert!(running);

        // t2 pushes its abort of round 5
        let reply = fx
            .target
            .handle(ControlMsg::StagePush {
                caller: "t2".to_string(),
                reb_id: 5,
                stage: Stage::Aborted,
            })
            .await;
        assert!(matches!(reply, ControlMsg::Ok));

        let aborted = wait_until(LONG, || async {
            fx.target.reb.is_aborted() && !fx.target.reb.is_running()
        })
        .await;
        assert!(aborted);

        // no outgoing abort: the pushing peer already told everyone
        assert_eq!(fx.t2.abort_pushes(), 0);
        assert_eq!(fx.t3.abort_pushes(), 0);
    }

    // equal round + peer status "aborted" follows without re-broadcast
    #[tokio::test(flavor = "multi_thread")]
    async fn test_polled_same_round_abort_follows_quietly() {
        let fx = EpochFixture::new();
        fx.t2.set_status(scripted_status(5, Stage::Aborted));
        fx.t3.set_status(scripted_status(5, Stage::Traverse));

        fx.start_round(5).await;

        let aborted = wait_until(LONG, || async {
            fx.target.reb.is_aborted() && !fx.target.reb.is_running()
        })
        .await;
        assert!(aborted);
        assert_eq!(fx.t2.abort_pushes(), 0);
        assert_eq!(fx.t3.abort_pushes(), 0);
    }

    // a lagging peer is waited for, not aborted on
    #[tokio::test(flavor = "multi_thread")]
    async fn test_older_peer_tolerated_until_catchup() {
        let fx = EpochFixture::new();
        // peers start out behind, then catch up to round 5 and run through
        fx.t2.set_status(scripted_status(4, Stage::Done));
        fx.t3.set_status(scripted_status(4, Stage::Done));

        fx.start_round(5).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // still running, nobody aborted anything
        assert!(!fx.target.reb.is_aborted());

        fx.t2.set_status(scripted_status(5, Stage::Fin));
        fx.t3.set_status(scripted_status(5, Stage::Fin));

        let done = wait_until(LONG, || async {
            !fx.target.reb.is_running() && fx.target.reb.stage() == Stage::Done
        })
        .await;
        assert!(done, "round should finish once the peers catch up");
        assert!(!fx.target.reb.is_aborted());
    }

    // unreachable peer: one retry, then abort-and-broadcast
    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_peer_aborts_round() {
        let fx = EpochFixture::new();
        let mut waiting = scripted_status(5, Stage::WaitAck);
        waiting.targets = vec!["t1".to_string()];
        fx.t2.set_status(waiting.clone());
        fx.t3.set_status(waiting);

        fx.start_round(5).await;
        let running = wait_until(LONG, || async { fx.target.reb.is_running() }).await;
        assert!(running);

        // t3 drops off the network mid-round
        fx.transport.sever("t3");
        let aborted = wait_until(LONG, || async { fx.target.reb.is_aborted() }).await;
        assert!(aborted);
        // the surviving peer hears about it
        let told = wait_until(LONG, || async { fx.t2.abort_pushes() > 0 }).await;
        assert!(told);
    }

    // push-notified progress short-circuits polling
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_stage_short_circuits_probes() {
        let fx = EpochFixture::new();
        // no scripted statuses at all: polls return "not rebalancing yet"
        fx.start_round(5).await;

        // pushes alone drive the peers' observed progress to fin
        for peer in ["t2", "t3"] {
            for stage in [Stage::Traverse, Stage::WaitAck, Stage::Fin] {
                let reply = fx
                    .target
                    .handle(ControlMsg::StagePush {
                        caller: peer.to_string(),
                        reb_id: 5,
                        stage,
                    })
                    .await;
                assert!(matches!(reply, ControlMsg::Ok));
            }
        }

        let done = wait_until(LONG, || async {
            !fx.target.reb.is_running() && fx.target.reb.stage() == Stage::Done
        })
        .await;
        assert!(done, "pushed stages alone should complete the round");
    }
}
