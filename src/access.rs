//! Per-bucket access-control bitmask.
//!
//! A 64-bit mask with one named bit per operation, persisted in bucket
//! properties and evaluated on every request path. Masks are modified with
//! [`modify_access`] using the `allow` / `deny` operations.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit access bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessAttrs(pub u64);

macro_rules! access_bits {
    ($($(#[$doc:meta])* ($const:ident, $name:literal, $shift:expr);)+) => {
        impl AccessAttrs {
            $(
                $(#[$doc])*
                pub const $const: AccessAttrs = AccessAttrs(1 << $shift);
            )+

            /// All named bits with their operation names, in bit order.
            pub const NAMED: &'static [(AccessAttrs, &'static str)] = &[
                $((AccessAttrs::$const, $name),)+
            ];
        }
    };
}

access_bits! {
    // object
    (GET, "GET", 0);
    (OBJ_HEAD, "HEAD-OBJECT", 1);
    (PUT, "PUT", 2);
    (APPEND, "APPEND", 3);
    (DOWNLOAD, "DOWNLOAD", 4);
    (OBJ_DELETE, "DELETE-OBJECT", 5);
    (OBJ_RENAME, "RENAME-OBJECT", 6);
    (PROMOTE, "PROMOTE", 7);
    // bucket
    (BCK_HEAD, "HEAD-BUCKET", 8);
    (OBJ_LIST, "LIST-OBJECTS", 9);
    (BCK_RENAME, "RENAME-BUCKET", 10);
    (PATCH, "PATCH", 11);
    (MAKE_NCOPIES, "MAKE-NCOPIES", 12);
    (EC, "EC", 13);
    (SYNC_BUCKET, "SYNC-BUCKET", 14);
    (BCK_DELETE, "DELETE-BUCKET", 15);
    // cluster
    (BCK_CREATE, "CREATE-BUCKET", 16);
    (BCK_LIST, "LIST-BUCKETS", 17);
    (ADMIN, "ADMIN", 18);
}

/// Operation string that grants bits.
pub const ALLOW_ACCESS: &str = "allow";
/// Operation string that revokes bits.
pub const DENY_ACCESS: &str = "deny";

impl AccessAttrs {
    /// No access at all.
    pub fn none() -> AccessAttrs {
        AccessAttrs(0)
    }

    /// Every bit set.
    pub fn all() -> AccessAttrs {
        AccessAttrs(u64::MAX)
    }

    /// Read-only preset.
    pub fn read_only() -> AccessAttrs {
        AccessAttrs(Self::GET.0 | Self::OBJ_HEAD.0 | Self::BCK_HEAD.0 | Self::OBJ_LIST.0)
    }

    /// Read-write preset.
    pub fn read_write() -> AccessAttrs {
        AccessAttrs(
            Self::read_only().0
                | Self::PUT.0
                | Self::APPEND.0
                | Self::DOWNLOAD.0
                | Self::OBJ_DELETE.0
                | Self::OBJ_RENAME.0,
        )
    }

    /// Everything below the cluster-scoped bits.
    pub fn cluster_scoped_cutoff() -> AccessAttrs {
        AccessAttrs(Self::BCK_CREATE.0 - 1)
    }

    /// Check whether all bits of `other` are granted.
    pub fn contains(self, other: AccessAttrs) -> bool {
        self.0 & other.0 == other.0
    }

    /// Name of a single-bit mask, for diagnostics.
    pub fn op_name(bit: AccessAttrs) -> &'static str {
        for &(b, name) in Self::NAMED {
            if b == bit {
                return name;
            }
        }
        "<unknown access>"
    }

    /// Check a required access against a granted mask.
    pub fn check(self, required: AccessAttrs) -> crate::error::Result<()> {
        if self.contains(required) {
            return Ok(());
        }
        Err(crate::error::Error::Config(format!(
            "access denied: {} not granted",
            required
        )))
    }
}

impl fmt::Display for AccessAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "No access");
        }
        let mut first = true;
        for (bit, name) in Self::NAMED {
            if self.contains(*bit) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Apply an `allow`/`deny` operation to a mask. Any other operation string
/// is rejected.
pub fn modify_access(cur: AccessAttrs, action: &str, bits: AccessAttrs) -> Result<AccessAttrs> {
    if action == ALLOW_ACCESS {
        return Ok(AccessAttrs(cur.0 | bits.0));
    }
    if action != DENY_ACCESS {
        return Err(Error::Config(format!(
            "unknown make-access action {action:?}"
        )));
    }
    Ok(AccessAttrs(cur.0 & !bits.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_then_deny_equals_deny() {
        // idempotence across any starting mask
        for m in [
            AccessAttrs::none(),
            AccessAttrs::read_only(),
            AccessAttrs::read_write(),
            AccessAttrs::all(),
        ] {
            let b = AccessAttrs(AccessAttrs::PUT.0 | AccessAttrs::EC.0);
            let allowed = modify_access(m, ALLOW_ACCESS, b).unwrap();
            let via_allow = modify_access(allowed, DENY_ACCESS, b).unwrap();
            let direct = modify_access(m, DENY_ACCESS, b).unwrap();
            assert_eq!(via_allow, direct);
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        let res = modify_access(AccessAttrs::none(), "grant", AccessAttrs::GET);
        assert!(res.is_err());
    }

    #[test]
    fn test_presets() {
        let ro = AccessAttrs::read_only();
        assert!(ro.contains(AccessAttrs::GET));
        assert!(ro.contains(AccessAttrs::OBJ_LIST));
        assert!(!ro.contains(AccessAttrs::PUT));

        let rw = AccessAttrs::read_write();
        assert!(rw.contains(ro));
        assert!(rw.contains(AccessAttrs::OBJ_DELETE));
        assert!(!rw.contains(AccessAttrs::ADMIN));
    }

    #[test]
    fn test_display_lists_operations() {
        let m = AccessAttrs(AccessAttrs::GET.0 | AccessAttrs::PROMOTE.0);
        let s = m.to_string();
        assert_eq!(s, "GET,PROMOTE");
        assert_eq!(AccessAttrs::none().to_string(), "No access");
    }

    #[test]
    fn test_named_bits_distinct() {
        let mut seen = 0u64;
        for (bit, _) in AccessAttrs::NAMED {
            assert_eq!(seen & bit.0, 0, "overlapping access bit {bit:?}");
            seen |= bit.0;
        }
        assert_eq!(AccessAttrs::NAMED.len(), 19);
    }
}
