//! Notification listeners and the information council (IC).
//!
//! Every long-lived cluster activity (rebalance, resilver, a
//! maintenance-triggered removal) registers a [`NotifListener`] on the
//! primary. Metasync carries the listener identity alongside the revision
//! that started the activity, so every IC-member proxy observes completion;
//! the terminal callback fires exactly once, on the first terminal status.

use crate::error::{Error, Result};
use crate::types::NodeId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback fired once when the listened-to activity terminates.
pub type NotifCallback = Arc<dyn Fn(&NotifListener) + Send + Sync>;

/// Terminal outcome of a long-lived activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifOutcome {
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// One registered listener.
pub struct NotifListener {
    /// Activity UUID (for a rebalance: `g<RebID>`).
    uuid: String,
    /// Activity kind tag.
    kind: String,
    /// IC members that own this listener.
    owners: Vec<NodeId>,
    /// Nodes expected to report in.
    srcs: Vec<NodeId>,
    finished: AtomicBool,
    outcome: Mutex<NotifOutcome>,
    f: Option<NotifCallback>,
}

impl NotifListener {
    pub fn new(
        uuid: impl Into<String>,
        kind: impl Into<String>,
        owners: Vec<NodeId>,
        srcs: Vec<NodeId>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            kind: kind.into(),
            owners,
            srcs,
            finished: AtomicBool::new(false),
            outcome: Mutex::new(NotifOutcome::default()),
            f: None,
        }
    }

    /// Attach the terminal callback.
    pub fn with_callback(mut self, f: NotifCallback) -> Self {
        self.f = Some(f);
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn owners(&self) -> &[NodeId] {
        &self.owners
    }

    pub fn srcs(&self) -> &[NodeId] {
        &self.srcs
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.outcome.lock().aborted
    }

    pub fn err(&self) -> Option<String> {
        self.outcome.lock().err.clone()
    }
}

impl std::fmt::Debug for NotifListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifListener")
            .field("uuid", &self.uuid)
            .field("kind", &self.kind)
            .field("finished", &self.finished())
            .finish()
    }
}

/// Serializable identity of a listener; this is what rides in metasync and
/// in the `send-ownership-tbl` transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifEntry {
    pub uuid: String,
    pub kind: String,
    pub owners: Vec<NodeId>,
    pub srcs: Vec<NodeId>,
    pub finished: bool,
    #[serde(default)]
    pub outcome: NotifOutcome,
}

/// Listener registry of one proxy.
#[derive(Debug, Default)]
pub struct NotifRegistry {
    listeners: DashMap<String, Arc<NotifListener>>,
}

impl NotifRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; rejects a duplicate UUID.
    pub fn add(&self, nl: NotifListener) -> Result<Arc<NotifListener>> {
        let uuid = nl.uuid().to_string();
        let nl = Arc::new(nl);
        match self.listeners.entry(uuid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Internal(format!(
                "notification listener {uuid:?} already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(nl.clone());
                Ok(nl)
            }
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<NotifListener>> {
        self.listeners.get(uuid).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver a terminal status. The callback fires only on the first call
    /// per listener; later calls are ignored.
    pub fn on_finished(&self, uuid: &str, aborted: bool, err: Option<String>) {
        let Some(nl) = self.get(uuid) else {
            debug!(uuid, "terminal status for an unknown listener");
            return;
        };
        if nl
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *nl.outcome.lock() = NotifOutcome {
            aborted,
            err: err.clone(),
        };
        if aborted || err.is_some() {
            warn!(uuid, aborted, ?err, kind = nl.kind(), "activity terminated abnormally");
        } else {
            debug!(uuid, kind = nl.kind(), "activity finished");
        }
        if let Some(f) = nl.f.as_ref() {
            f(&nl);
        }
    }

    /// Snapshot the ownership table for transfer to another IC member.
    pub fn ownership_table(&self) -> Vec<NotifEntry> {
        self.listeners
            .iter()
            .map(|e| NotifEntry {
                uuid: e.uuid.clone(),
                kind: e.kind.clone(),
                owners: e.owners.clone(),
                srcs: e.srcs.clone(),
                finished: e.finished(),
                outcome: e.outcome.lock().clone(),
            })
            .collect()
    }

    /// Merge a received ownership table (callbacks do not transfer; they
    /// exist only where they were registered).
    pub fn merge_table(&self, entries: Vec<NotifEntry>) {
        for entry in entries {
            if self.listeners.contains_key(&entry.uuid) {
                continue;
            }
            let nl = NotifListener::new(entry.uuid, entry.kind, entry.owners, entry.srcs);
            nl.finished.store(entry.finished, Ordering::SeqCst);
            *nl.outcome.lock() = entry.outcome;
            let _ = self.add(nl);
        }
    }

    /// Drop finished listeners (housekeeping).
    pub fn prune_finished(&self) {
        self.listeners.retain(|_, nl| !nl.finished());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_fires_once() {
        let reg = NotifRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let nl = NotifListener::new("g7", "rebalance", vec!["p1".into()], vec!["t1".into()])
            .with_callback(Arc::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }));
        reg.add(nl).unwrap();

        reg.on_finished("g7", false, None);
        reg.on_finished("g7", false, None);
        reg.on_finished("g7", true, Some("late".to_string()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let nl = reg.get("g7").unwrap();
        assert!(nl.finished());
        assert!(!nl.aborted()); // first terminal status won
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let reg = NotifRegistry::new();
        reg.add(NotifListener::new("g1", "rebalance", vec![], vec![]))
            .unwrap();
        assert!(reg
            .add(NotifListener::new("g1", "rebalance", vec![], vec![]))
            .is_err());
    }

    #[test]
    fn test_ownership_table_round_trip() {
        let reg = NotifRegistry::new();
        reg.add(NotifListener::new(
            "g3",
            "rebalance",
            vec!["p1".into(), "p2".into()],
            vec!["t1".into()],
        ))
        .unwrap();
        let table = reg.ownership_table();

        let other = NotifRegistry::new();
        other.merge_table(table);
        let nl = other.get("g3").unwrap();
        assert_eq!(nl.kind(), "rebalance");
        assert_eq!(nl.owners().len(), 2);
    }

    #[test]
    fn test_unknown_uuid_ignored() {
        let reg = NotifRegistry::new();
        reg.on_finished("nope", true, None); // no panic
    }

    #[test]
    fn test_prune() {
        let reg = NotifRegistry::new();
        reg.add(NotifListener::new("a", "x", vec![], vec![])).unwrap();
        reg.add(NotifListener::new("b", "x", vec![], vec![])).unwrap();
        reg.on_finished("a", false, None);
        reg.prune_finished();
        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
    }
}
