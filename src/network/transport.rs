//! The transport seam.
//!
//! Everything above this layer calls peers through the [`Transport`] trait
//! and serves requests through the [`MsgHandler`] trait. Production wiring
//! uses the framed-TCP client/server pair; tests wire nodes together with
//! [`LoopbackTransport`], which keeps the whole cluster in one process.

use crate::error::{Error, NetworkError, Result};
use crate::network::msg::ControlMsg;
use crate::types::{NodeId, Snode};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;

/// Server-side message dispatch.
#[async_trait]
pub trait MsgHandler: Send + Sync + 'static {
    /// Handle one request; errors are returned as [`ControlMsg::Err`].
    async fn handle(&self, msg: ControlMsg) -> ControlMsg;
}

/// Client-side peer calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `msg` to `dst` and await one reply within `timeout`.
    async fn call(&self, dst: &Snode, msg: ControlMsg, timeout: Duration) -> Result<ControlMsg>;
}

/// In-process transport connecting registered handlers directly.
///
/// Supports cutting individual nodes off (to exercise retry/duplicate-probe
/// paths) without tearing their handlers down.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: DashMap<NodeId, Arc<dyn MsgHandler>>,
    severed: DashSet<NodeId>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node's handler under its ID.
    pub fn register(&self, id: impl Into<NodeId>, handler: Arc<dyn MsgHandler>) {
        self.nodes.insert(id.into(), handler);
    }

    /// Detach a node entirely.
    pub fn deregister(&self, id: &str) {
        self.nodes.remove(id);
        self.severed.remove(id);
    }

    /// Make a node unreachable while keeping it registered.
    pub fn sever(&self, id: &str) {
        self.severed.insert(id.to_string());
    }

    /// Restore a severed node.
    pub fn restore(&self, id: &str) {
        self.severed.remove(id);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn call(&self, dst: &Snode, msg: ControlMsg, timeout: Duration) -> Result<ControlMsg> {
        if self.severed.contains(dst.sid()) {
            return Err(Error::Network(NetworkError::ConnectionFailed {
                addr: dst.control_net.to_addr_string(),
                reason: "unreachable".to_string(),
            }));
        }
        let handler = match self.nodes.get(dst.sid()) {
            Some(h) => h.clone(),
            None => {
                return Err(Error::Network(NetworkError::ConnectionFailed {
                    addr: dst.control_net.to_addr_string(),
                    reason: "no such node".to_string(),
                }))
            }
        };
        match tokio::time::timeout(timeout, handler.handle(msg)).await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetAddr, NodeRole};

    struct Echo;

    #[async_trait]
    impl MsgHandler for Echo {
        async fn handle(&self, msg: ControlMsg) -> ControlMsg {
            match msg {
                ControlMsg::Health { .. } => ControlMsg::HealthReply {
                    smap_version: 7,
                    started: true,
                    reb: None,
                },
                _ => ControlMsg::Ok,
            }
        }
    }

    fn node(id: &str) -> Snode {
        Snode::new(id, NodeRole::Target, NetAddr::new("127.0.0.1", 9000))
    }

    #[tokio::test]
    async fn test_loopback_call() {
        let tp = LoopbackTransport::new();
        tp.register("t1", Arc::new(Echo));
        let reply = tp
            .call(
                &node("t1"),
                ControlMsg::Health { reb_status: false },
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(matches!(reply, ControlMsg::HealthReply { smap_version: 7, .. }));
    }

    #[tokio::test]
    async fn test_unknown_node_fails() {
        let tp = LoopbackTransport::new();
        let err = tp
            .call(&node("t9"), ControlMsg::Ok, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_sever_and_restore() {
        let tp = LoopbackTransport::new();
        tp.register("t1", Arc::new(Echo));
        tp.sever("t1");
        assert!(tp
            .call(&node("t1"), ControlMsg::Ok, Duration::from_millis(100))
            .await
            .is_err());
        tp.restore("t1");
        assert!(tp
            .call(&node("t1"), ControlMsg::Ok, Duration::from_millis(100))
            .await
            .is_ok());
    }
}
