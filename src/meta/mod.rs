//! Versioned cluster metadata.
//!
//! Three metadata kinds, the cluster map ([`Smap`]), the rebalance
//! descriptor ([`RebMd`]) and the bucket map ([`BucketMd`]), share one
//! storage discipline: immutable copy-on-write snapshots behind a
//! [`VersionedStore`], mutated only through [`VersionedStore::modify`] and
//! replicated by the metasyncer.
//!
//! Reads are lock-free on the installed `Arc` snapshot; a store's exclusive
//! lock is held only across a modify. A version is bumped by the store
//! itself on every successful install, so monotonicity is structural rather
//! than a convention modifiers must remember.

mod bmd;
mod rmd;
mod smap;

pub use bmd::{BucketMd, BucketProps};
pub use rmd::RebMd;
pub use smap::{Smap, IC_SIZE};

use crate::error::{Error, IntegrityError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Metadata kind discriminator, used for per-peer sync progress tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevKind {
    Smap,
    Rmd,
    Bmd,
}

impl fmt::Display for RevKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevKind::Smap => write!(f, "smap"),
            RevKind::Rmd => write!(f, "rmd"),
            RevKind::Bmd => write!(f, "bmd"),
        }
    }
}

/// A replicated, versioned metadata document.
pub trait RevType:
    Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
    /// The kind tag of this metadata.
    const KIND: RevKind;

    /// Monotonic version.
    fn version(&self) -> i64;

    /// Set the version. Called only by [`VersionedStore`].
    fn set_version(&mut self, v: i64);

    /// Cluster UUID the document belongs to ("" before initialization).
    fn uuid(&self) -> &str;
}

/// Read access to the current cluster map.
///
/// Components that would otherwise hold back-pointers to the owning node
/// (metasyncer, rebalance coordinator) receive this seam instead.
pub trait SmapSource: Send + Sync + 'static {
    fn get_smap(&self) -> Arc<Smap>;
}

/// Reject metadata advertising a different cluster UUID.
///
/// An empty UUID on either side means "not initialized yet" and passes.
pub fn validate_uuid(
    local_uuid: &str,
    incoming_uuid: &str,
    local: &str,
    peer: &str,
) -> Result<()> {
    if local_uuid.is_empty() || incoming_uuid.is_empty() || local_uuid == incoming_uuid {
        return Ok(());
    }
    Err(Error::Integrity(IntegrityError::UuidMismatch {
        local: local.to_string(),
        local_uuid: local_uuid.to_string(),
        peer: peer.to_string(),
        peer_uuid: incoming_uuid.to_string(),
    }))
}

/// A staged mutation of a metadata snapshot.
///
/// `pre` runs on the clone and may reject the whole mutation; `post` runs on
/// the freshly installed snapshot while the store lock is still held (this is
/// where a chained mutation of another kind belongs, e.g. bumping the
/// rebalance descriptor inside a cluster-map commit); `fin` runs after the
/// lock is released and is where metasync is typically invoked.
pub struct Modifier<'a, T> {
    pre: Box<dyn FnMut(&mut T) -> Result<()> + 'a>,
    post: Option<Box<dyn FnMut(&Arc<T>) + 'a>>,
    fin: Option<Box<dyn FnOnce(Arc<T>) + 'a>>,
}

impl<'a, T> Modifier<'a, T> {
    /// Create a modifier from its `pre` step.
    pub fn new(pre: impl FnMut(&mut T) -> Result<()> + 'a) -> Self {
        Self {
            pre: Box::new(pre),
            post: None,
            fin: None,
        }
    }

    /// Attach a `post` step (runs under the store lock).
    pub fn with_post(mut self, post: impl FnMut(&Arc<T>) + 'a) -> Self {
        self.post = Some(Box::new(post));
        self
    }

    /// Attach a `fin` step (runs after the lock is released).
    pub fn with_final(mut self, fin: impl FnOnce(Arc<T>) + 'a) -> Self {
        self.fin = Some(Box::new(fin));
        self
    }
}

/// Copy-on-write store of one metadata kind.
///
/// Prior snapshots remain readable by in-flight readers; old versions are
/// never destroyed explicitly, only unreferenced.
#[derive(Debug)]
pub struct VersionedStore<T> {
    /// Serializes modifies; never held across I/O.
    modify_lock: Mutex<()>,
    cur: RwLock<Arc<T>>,
}

impl<T: RevType> VersionedStore<T> {
    /// Create a store holding `initial` as the current snapshot.
    pub fn new(initial: T) -> Self {
        Self {
            modify_lock: Mutex::new(()),
            cur: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current immutable snapshot.
    pub fn get(&self) -> Arc<T> {
        self.cur.read().clone()
    }

    /// Current version.
    pub fn version(&self) -> i64 {
        self.cur.read().version()
    }

    /// Apply a staged mutation. The clone is installed iff `pre` succeeds;
    /// its version is set to `current + 1` by the store.
    pub fn modify(&self, mut m: Modifier<'_, T>) -> Result<Arc<T>> {
        let installed = {
            let _guard = self.modify_lock.lock();
            let cur = self.get();
            let mut clone = (*cur).clone();
            (m.pre)(&mut clone)?;
            clone.set_version(cur.version() + 1);
            let installed = Arc::new(clone);
            *self.cur.write() = installed.clone();
            if let Some(post) = m.post.as_mut() {
                post(&installed);
            }
            installed
        };
        if let Some(fin) = m.fin.take() {
            fin(installed.clone());
        }
        Ok(installed)
    }

    /// Install a replica received from the primary.
    ///
    /// Returns `Ok(true)` when installed, `Ok(false)` when the incoming
    /// version is not strictly newer (idempotent re-delivery), and an
    /// integrity error on UUID mismatch.
    pub fn install_newer(&self, incoming: T, local: &str, peer: &str) -> Result<bool> {
        let _guard = self.modify_lock.lock();
        let cur = self.get();
        validate_uuid(cur.uuid(), incoming.uuid(), local, peer)?;
        if incoming.version() <= cur.version() {
            return Ok(false);
        }
        *self.cur.write() = Arc::new(incoming);
        Ok(true)
    }
}

/// One `(revision, action)` pair as shipped by the metasyncer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevPair {
    /// Metadata kind.
    pub kind: RevKind,
    /// Document version, duplicated out of the payload for progress tracking.
    pub version: i64,
    /// Cluster UUID of the document.
    pub uuid: String,
    /// The JSON-encoded document itself.
    pub payload: serde_json::Value,
    /// The action that produced this revision (log/notification tag).
    pub action: String,
}

impl RevPair {
    /// Build a pair from a metadata snapshot.
    pub fn from_rev<T: RevType>(rev: &T, action: &str) -> Result<RevPair> {
        Ok(RevPair {
            kind: T::KIND,
            version: rev.version(),
            uuid: rev.uuid().to_string(),
            payload: serde_json::to_value(rev)?,
            action: action.to_string(),
        })
    }

    /// Decode the payload back into its typed document.
    pub fn decode<T: RevType>(&self) -> Result<T> {
        debug_assert_eq!(self.kind, T::KIND);
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetAddr, NodeRole, Snode};

    fn pnode(id: &str) -> Snode {
        Snode::new(id, NodeRole::Proxy, NetAddr::new("127.0.0.1", 8080))
    }

    fn store() -> VersionedStore<Smap> {
        VersionedStore::new(Smap::new("U-test", pnode("p1")))
    }

    #[test]
    fn test_modify_installs_and_bumps() {
        let s = store();
        let v0 = s.version();
        let installed = s
            .modify(Modifier::new(|clone: &mut Smap| {
                clone.put_node(pnode("p2"), Default::default());
                Ok(())
            }))
            .unwrap();
        assert_eq!(installed.version(), v0 + 1);
        assert_eq!(s.version(), v0 + 1);
        assert!(s.get().get_proxy("p2").is_some());
    }

    #[test]
    fn test_modify_pre_error_keeps_snapshot() {
        let s = store();
        let before = s.get();
        let res = s.modify(Modifier::new(|_clone: &mut Smap| {
            Err(Error::Internal("nope".to_string()))
        }));
        assert!(res.is_err());
        let after = s.get();
        assert_eq!(before.version(), after.version());
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_old_snapshot_remains_readable() {
        let s = store();
        let old = s.get();
        s.modify(Modifier::new(|clone: &mut Smap| {
            clone.put_node(pnode("p2"), Default::default());
            Ok(())
        }))
        .unwrap();
        // the reader holding `old` still sees the pre-modify world
        assert!(old.get_proxy("p2").is_none());
        assert!(s.get().get_proxy("p2").is_some());
    }

    #[test]
    fn test_post_and_final_ordering() {
        let s = store();
        let order = std::cell::RefCell::new(Vec::new());
        s.modify(
            Modifier::new(|_: &mut Smap| Ok(()))
                .with_post(|_| order.borrow_mut().push("post"))
                .with_final(|_| order.borrow_mut().push("final")),
        )
        .unwrap();
        assert_eq!(*order.borrow(), ["post", "final"]);
    }

    #[test]
    fn test_install_newer() {
        let s = store();
        let mut newer = (*s.get()).clone();
        newer.set_version(s.version() + 5);
        assert!(s.install_newer(newer.clone(), "p1", "px").unwrap());
        // re-delivery of the same version is a no-op
        assert!(!s.install_newer(newer, "p1", "px").unwrap());
    }

    #[test]
    fn test_install_rejects_foreign_uuid() {
        let s = store();
        let mut foreign = Smap::new("U-other", pnode("p9"));
        foreign.set_version(100);
        let err = s.install_newer(foreign, "p1", "p9").unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_rev_pair_round_trip() {
        let smap = Smap::new("U-test", pnode("p1"));
        let pair = RevPair::from_rev(&smap, "reg-proxy").unwrap();
        assert_eq!(pair.kind, RevKind::Smap);
        assert_eq!(pair.version, smap.version());
        let back: Smap = pair.decode().unwrap();
        assert_eq!(back.uuid(), "U-test");
    }
}
