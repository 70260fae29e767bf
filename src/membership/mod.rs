//! Cluster membership.
//!
//! The primary proxy serializes every membership verb (join, keepalive,
//! maintenance, decommission, primary handover) through the cluster-map
//! store and distributes the results via metasync.

pub mod controller;
pub mod handover;
pub mod keepalive;
pub mod query;

pub use controller::{requires_rebalance, JoinOutcome, MembershipController, MetaOwner};
pub use keepalive::KeepaliveTracker;
