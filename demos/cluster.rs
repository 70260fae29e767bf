//! Spin up a small in-process cluster, grow it, and watch the rebalance.
//!
//! Run with:
//! ```sh
//! cargo run --example cluster
//! ```

use bytes::Bytes;
use shoal::config::ClusterConfig;
use shoal::network::LoopbackTransport;
use shoal::node::{ProxyNode, TargetNode};
use shoal::placement::hrw_target;
use shoal::rebalance::mover::{MemInventory, ObjectInventory};
use shoal::types::{NetAddr, NodeRole, Snode};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> shoal::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shoal=info")),
        )
        .init();

    let transport = LoopbackTransport::new();
    let config = ClusterConfig::fast_for_tests();

    // bootstrap the primary
    let p1 = Snode::new("p1", NodeRole::Proxy, NetAddr::new("127.0.0.1", 8080));
    let primary = ProxyNode::new_primary(p1.clone(), config.clone(), "U-demo", transport.clone());
    transport.register("p1", primary.clone());
    primary.ctrl.mark_cluster_started().await;

    // two targets join and get seeded with objects
    let mut targets = Vec::new();
    for i in 1..=2u16 {
        let tsi = Snode::new(
            format!("t{i}"),
            NodeRole::Target,
            NetAddr::new("127.0.0.1", 9090 + i),
        );
        let target = TargetNode::new(
            tsi,
            config.clone(),
            transport.clone(),
            MemInventory::new(),
        );
        transport.register(format!("t{i}"), target.clone());
        target.join_cluster(&p1, false).await?;
        let _ = target.start_keepalive();
        targets.push(target);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let smap = primary.owner.smap.get();
    for i in 0..1000 {
        let name = format!("bucket/obj-{i:04}");
        let owner = hrw_target(&smap, &name)?;
        for t in &targets {
            if t.si.id == owner.id {
                t.inventory.put(name.clone(), Bytes::from(vec![0u8; 128]));
            }
        }
    }
    print_layout("before", &targets);

    // a third target joins; the membership controller bumps the rebalance
    // descriptor and every target runs the round
    let tsi = Snode::new("t3", NodeRole::Target, NetAddr::new("127.0.0.1", 9093));
    let t3 = TargetNode::new(tsi, config.clone(), transport.clone(), MemInventory::new());
    transport.register("t3", t3.clone());
    t3.join_cluster(&p1, false).await?;
    let _ = t3.start_keepalive();
    targets.push(t3);

    // wait for the round to run out
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if targets.iter().all(|t| !t.reb.is_running()) {
            break;
        }
    }
    print_layout("after", &targets);

    let total: usize = targets.iter().map(|t| t.inventory.len()).sum();
    println!("total objects: {total} (reb g{})", primary.owner.rmd.get().version);
    Ok(())
}

fn print_layout(tag: &str, targets: &[Arc<TargetNode>]) {
    print!("{tag:>7}:");
    for t in targets {
        print!("  {} -> {:4} objects", t.si.id, t.inventory.len());
    }
    println!();
}
