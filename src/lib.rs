//! Cluster control plane for a proxy/target distributed object store.
//!
//! This crate implements the subsystem that establishes and maintains
//! agreement on cluster membership and object placement:
//!
//! - **Membership**: a primary-proxy-mediated protocol (join / keepalive /
//!   maintenance / decommission / primary handover)
//! - **Versioned metadata**: the cluster map (`Smap`), the rebalance
//!   descriptor (`RMD`) and the bucket map (`BMD`), replicated by the
//!   **metasyncer** so all nodes stay monotonically consistent
//! - **Rebalance**: a per-target state machine coordinating cluster-wide
//!   data movement after membership changes
//! - **Placement**: highest-random-weight hashing mapping object names onto
//!   targets
//!
//! # Architecture
//!
//! ```text
//!          clients
//!             │
//!             ▼
//! ┌─────────────────────┐  forward    ┌──────────────────────┐
//! │   any proxy         │────────────▶│   primary proxy      │
//! │   (gateway, HRW)    │             │  MembershipController│
//! └─────────────────────┘             │  Smap / RMD / BMD    │
//!                                     └──────────┬───────────┘
//!                                                │ metasync
//!                      ┌─────────────────────────┼─────────────┐
//!                      ▼                         ▼             ▼
//!               ┌────────────┐            ┌────────────┐ ┌────────────┐
//!               │  target t1 │◀──────────▶│  target t2 │ │  proxy p2  │
//!               │  Reb round │  objects + │  Reb round │ │  (IC)      │
//!               └────────────┘  stage px  └────────────┘ └────────────┘
//! ```
//!
//! Mutating verbs are serialized by the primary through copy-on-write
//! metadata stores; committed revisions fan out via the metasyncer; targets
//! react to a new rebalance descriptor by running a round of the rebalance
//! state machine, synchronizing stages with their peers through push
//! notifications and status polls.
//!
//! # Example
//!
//! ```rust,no_run
//! use shoal::config::ClusterConfig;
//! use shoal::network::LoopbackTransport;
//! use shoal::node::{ProxyNode, TargetNode};
//! use shoal::rebalance::MemInventory;
//! use shoal::types::{NetAddr, NodeRole, Snode};
//!
//! # async fn run() -> shoal::error::Result<()> {
//! let transport = LoopbackTransport::new();
//! let config = ClusterConfig::default();
//!
//! let p1 = Snode::new("p1", NodeRole::Proxy, NetAddr::new("10.0.0.1", 8080));
//! let primary = ProxyNode::new_primary(p1.clone(), config.clone(), "U-cluster", transport.clone());
//! transport.register("p1", primary.clone());
//! primary.ctrl.mark_cluster_started().await;
//!
//! let t1 = Snode::new("t1", NodeRole::Target, NetAddr::new("10.0.0.2", 9090));
//! let target = TargetNode::new(t1, config, transport.clone(), MemInventory::new());
//! transport.register("t1", target.clone());
//! target.join_cluster(&p1, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod membership;
pub mod meta;
pub mod metasync;
pub mod metrics;
pub mod network;
pub mod node;
pub mod notify;
pub mod placement;
pub mod promote;
pub mod rebalance;
pub mod testing;
pub mod types;

// Re-export the types most callers need
pub use config::{ClusterConfig, RebalanceConfig};
pub use error::{Error, Result};
pub use meta::{BucketMd, RebMd, RevKind, RevPair, Smap, SmapSource, VersionedStore};
pub use node::{ProxyNode, TargetNode};
pub use placement::{hrw_proxy, hrw_target};
pub use rebalance::{Reb, RebArgs, RebStatus, Stage};
pub use types::{Action, JoinVerb, NetAddr, NodeId, NodeRole, Snode, SnodeFlags};
