//! The bucket map.
//!
//! Mostly opaque to the control plane; it participates in metasync so bucket
//! visibility stays coherent with membership changes, and it carries the
//! per-bucket access mask.

use crate::access::AccessAttrs;
use crate::meta::{RevKind, RevType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Properties persisted per bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketProps {
    /// Backend provider tag (e.g. "ais").
    pub provider: String,
    /// Access-control bitmask.
    pub access: AccessAttrs,
}

impl Default for BucketProps {
    fn default() -> Self {
        Self {
            provider: "ais".to_string(),
            access: AccessAttrs::read_write(),
        }
    }
}

/// Versioned bucket metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketMd {
    pub version: i64,
    pub uuid: String,
    pub buckets: BTreeMap<String, BucketProps>,
}

impl BucketMd {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            version: 1,
            uuid: uuid.into(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BucketProps> {
        self.buckets.get(name)
    }

    /// Add a bucket; returns false when it already exists.
    pub fn add(&mut self, name: impl Into<String>, props: BucketProps) -> bool {
        use std::collections::btree_map::Entry;
        match self.buckets.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(props);
                true
            }
        }
    }

    pub fn del(&mut self, name: &str) -> bool {
        self.buckets.remove(name).is_some()
    }

    /// Replace a bucket's access mask.
    pub fn set_access(&mut self, name: &str, access: AccessAttrs) -> bool {
        match self.buckets.get_mut(name) {
            Some(props) => {
                props.access = access;
                true
            }
            None => false,
        }
    }
}

impl RevType for BucketMd {
    const KIND: RevKind = RevKind::Bmd;

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }
}
