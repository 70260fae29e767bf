//! Bounded-parallelism broadcast fan-out.
//!
//! One task per peer, capped by a shared semaphore so a large cluster does
//! not turn every broadcast into a connection storm. Callback results are
//! aggregated with an atomic counter; errors are counted, never hidden.

use crate::error::Result;
use crate::network::msg::ControlMsg;
use crate::network::transport::Transport;
use crate::types::Snode;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Fan `cb` out over `nodes`, at most `max_parallel` in flight. Returns the
/// number of peers for which `cb` returned false.
pub async fn bcast<F, Fut>(nodes: Vec<Snode>, max_parallel: usize, cb: F) -> usize
where
    F: Fn(Snode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(max_parallel.max(1)));
    let failed = Arc::new(AtomicUsize::new(0));
    let cb = Arc::new(cb);
    let mut set = JoinSet::new();
    for node in nodes {
        let sem = sem.clone();
        let failed = failed.clone();
        let cb = cb.clone();
        set.spawn(async move {
            // a closed semaphore cannot happen here; treat it as failure
            let Ok(_permit) = sem.acquire().await else {
                failed.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if !cb(node).await {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    while set.join_next().await.is_some() {}
    failed.load(Ordering::Relaxed)
}

/// Fan one request out over `nodes` and collect every peer's reply.
pub async fn bcast_collect(
    transport: Arc<dyn Transport>,
    nodes: Vec<Snode>,
    msg: ControlMsg,
    timeout: Duration,
    max_parallel: usize,
) -> Vec<(Snode, Result<ControlMsg>)> {
    let sem = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut set = JoinSet::new();
    for node in nodes {
        let sem = sem.clone();
        let transport = transport.clone();
        let msg = msg.clone();
        set.spawn(async move {
            let _permit = sem.acquire().await;
            let res = transport.call(&node, msg, timeout).await;
            (node, res)
        });
    }
    let mut out = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(pair) = joined {
            out.push(pair);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetAddr, NodeRole};
    use std::sync::atomic::AtomicUsize;

    fn nodes(n: usize) -> Vec<Snode> {
        (0..n)
            .map(|i| {
                Snode::new(
                    format!("t{i}"),
                    NodeRole::Target,
                    NetAddr::new("127.0.0.1", 9000 + i as u16),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bcast_counts_failures() {
        let failed = bcast(nodes(10), 4, |node| async move { node.id != "t3" && node.id != "t7" }).await;
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_bcast_respects_parallelism_bound() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (inflight2, peak2) = (inflight.clone(), peak.clone());
        let failed = bcast(nodes(16), 3, move |_| {
            let inflight = inflight2.clone();
            let peak = peak2.clone();
            async move {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                true
            }
        })
        .await;
        assert_eq!(failed, 0);
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bcast_empty() {
        assert_eq!(bcast(Vec::new(), 4, |_| async { true }).await, 0);
    }
}
