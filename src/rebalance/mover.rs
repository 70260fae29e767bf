//! Object transmission seams and ACK bookkeeping.
//!
//! The on-disk object layout is out of scope; targets see their objects
//! through [`ObjectInventory`] and move them through [`Mover`]. Both have
//! in-process implementations used by tests and by the default wiring.

use crate::error::{Error, NetworkError, Result};
use crate::network::msg::ControlMsg;
use crate::network::transport::Transport;
use crate::types::{NodeId, Snode};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A target's view of its local object inventory.
pub trait ObjectInventory: Send + Sync + 'static {
    /// Names of all local objects, snapshot at call time.
    fn names(&self) -> Vec<String>;

    /// Read an object. `None` when it no longer exists.
    fn read(&self, name: &str) -> Option<Bytes>;

    /// Commit an object locally.
    fn put(&self, name: String, data: Bytes);

    /// Remove an object (after a successful move).
    fn remove(&self, name: &str) -> Option<Bytes>;

    fn contains(&self, name: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory inventory.
#[derive(Debug, Default)]
pub struct MemInventory {
    objs: DashMap<String, Bytes>,
}

impl MemInventory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ObjectInventory for MemInventory {
    fn names(&self) -> Vec<String> {
        self.objs.iter().map(|e| e.key().clone()).collect()
    }

    fn read(&self, name: &str) -> Option<Bytes> {
        self.objs.get(name).map(|e| e.value().clone())
    }

    fn put(&self, name: String, data: Bytes) {
        self.objs.insert(name, data);
    }

    fn remove(&self, name: &str) -> Option<Bytes> {
        self.objs.remove(name).map(|(_, v)| v)
    }

    fn contains(&self, name: &str) -> bool {
        self.objs.contains_key(name)
    }

    fn len(&self) -> usize {
        self.objs.len()
    }
}

/// Object transmission: one object per framed message, receiver ACKs on
/// successful commit to its own storage.
#[async_trait]
pub trait Mover: Send + Sync + 'static {
    /// Transmit one object to `dst` within round `reb_id`. `Ok` means the
    /// receiver committed and ACKed.
    async fn send_obj(&self, dst: &Snode, reb_id: i64, name: &str, data: Bytes) -> Result<()>;
}

/// [`Mover`] over the control transport.
pub struct TransportMover {
    self_id: NodeId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl TransportMover {
    pub fn new(self_id: impl Into<NodeId>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            transport,
            timeout,
        }
    }
}

#[async_trait]
impl Mover for TransportMover {
    async fn send_obj(&self, dst: &Snode, reb_id: i64, name: &str, data: Bytes) -> Result<()> {
        let msg = ControlMsg::ObjPut {
            caller: self.self_id.clone(),
            reb_id,
            name: name.to_string(),
            data: data.to_vec(),
        };
        let reply = self.transport.call(dst, msg, self.timeout).await?;
        match reply {
            ControlMsg::ObjAck { name: acked } if acked == name => Ok(()),
            ControlMsg::ObjAck { name: acked } => Err(Error::Network(
                NetworkError::UnexpectedResponse(format!("{dst}: acked {acked:?} for {name:?}")),
            )),
            other => other.reject(&dst.name()).map(|_| ()),
        }
    }
}

/// Per-destination pending-ACK bookkeeping of the sending side.
#[derive(Debug, Default)]
pub struct AckTab {
    pending: Mutex<HashMap<NodeId, HashSet<String>>>,
}

impl AckTab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object as awaiting an ACK from `dst`.
    pub fn add(&self, dst: &str, name: &str) {
        self.pending
            .lock()
            .entry(dst.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Resolve one ACK. Empty per-destination sets are dropped.
    pub fn ack(&self, dst: &str, name: &str) {
        let mut pending = self.pending.lock();
        if let Some(set) = pending.get_mut(dst) {
            set.remove(name);
            if set.is_empty() {
                pending.remove(dst);
            }
        }
    }

    /// Total number of outstanding ACKs.
    pub fn pending_total(&self) -> usize {
        self.pending.lock().values().map(|s| s.len()).sum()
    }

    /// Destinations with at least one outstanding ACK.
    pub fn targets_awaited(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.pending.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_basics() {
        let inv = MemInventory::new();
        assert!(inv.is_empty());
        inv.put("a/1".to_string(), Bytes::from_static(b"x"));
        inv.put("a/2".to_string(), Bytes::from_static(b"y"));
        assert_eq!(inv.len(), 2);
        assert!(inv.contains("a/1"));
        assert_eq!(inv.read("a/2").unwrap(), Bytes::from_static(b"y"));
        assert!(inv.remove("a/1").is_some());
        assert!(inv.read("a/1").is_none());
    }

    #[test]
    fn test_ack_tab() {
        let acks = AckTab::new();
        acks.add("t2", "a/1");
        acks.add("t2", "a/2");
        acks.add("t3", "b/1");
        assert_eq!(acks.pending_total(), 3);
        assert_eq!(acks.targets_awaited(), vec!["t2".to_string(), "t3".to_string()]);

        acks.ack("t2", "a/1");
        acks.ack("t2", "a/2");
        assert_eq!(acks.targets_awaited(), vec!["t3".to_string()]);

        acks.ack("t3", "b/1");
        assert!(acks.is_empty());

        // unknown ack is a no-op
        acks.ack("t9", "zzz");
        assert!(acks.is_empty());
    }
}
