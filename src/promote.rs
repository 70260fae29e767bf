//! Directory promote: turn files under a local directory into objects.
//!
//! The filesystem walk and the actual object commit are external concerns;
//! this module decides *which* entries a given target promotes. With
//! `file_share` the directory is NFS/SMB-shared across all targets, so each
//! target walks the same tree and keeps only the names that place locally;
//! cluster-wide, every file is promoted exactly once.

use crate::error::Result;
use crate::meta::Smap;
use crate::placement::hrw_target;
use crate::types::PromoteArgs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where promoted objects go. The object data plane is out of scope, so the
/// sink is a seam.
pub trait PromoteSink: Send + Sync {
    /// Commit one file as an object. Implementations treat a missing source
    /// file as success (the file may vanish mid-walk).
    fn promote(&self, src: &Path, obj_name: &str, overwrite: bool, delete_src: bool)
        -> Result<()>;
}

/// Outcome counters of one promote run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromoteStats {
    /// Files promoted by this target.
    pub promoted: usize,
    /// Files skipped because they place on another target.
    pub skipped_non_local: usize,
}

/// Derive the destination object name of one walked file.
fn promoted_obj_name(fqn: &Path, src_dir: &Path, prefix: &str) -> Option<String> {
    let rel = fqn.strip_prefix(src_dir).ok()?;
    let rel = rel.to_str()?;
    if prefix.is_empty() {
        Some(rel.to_string())
    } else if prefix.ends_with('/') {
        Some(format!("{prefix}{rel}"))
    } else {
        Some(format!("{prefix}/{rel}"))
    }
}

fn walk(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                walk(&path, true, out)?;
            }
            continue;
        }
        out.push(path);
    }
    Ok(())
}

/// Run a promote on this target. `self_id` is the local target's node ID;
/// `smap` decides placement when `file_share` is set.
pub fn run_promote(
    args: &PromoteArgs,
    smap: &Smap,
    self_id: &str,
    sink: &dyn PromoteSink,
) -> Result<PromoteStats> {
    let src_dir = Path::new(&args.src_dir);
    info!(dir = %args.src_dir, recursive = args.recursive, file_share = args.file_share,
        "promoting directory");
    let mut files = Vec::new();
    walk(src_dir, args.recursive, &mut files)?;

    let mut stats = PromoteStats::default();
    for fqn in files {
        let Some(obj_name) = promoted_obj_name(&fqn, src_dir, &args.dst_obj_prefix) else {
            continue;
        };
        // file share: promote only the part of the namespace that lands here
        if args.file_share {
            let owner = hrw_target(smap, &obj_name)?;
            if owner.id != self_id {
                stats.skipped_non_local += 1;
                continue;
            }
        }
        sink.promote(&fqn, &obj_name, args.overwrite_dst, args.delete_src)?;
        debug!(file = %fqn.display(), obj = %obj_name, "promoted");
        stats.promoted += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetAddr, NodeRole, Snode, SnodeFlags};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::fs;

    #[derive(Default)]
    struct RecordingSink {
        promoted: Mutex<BTreeSet<String>>,
    }

    impl PromoteSink for RecordingSink {
        fn promote(
            &self,
            src: &Path,
            obj_name: &str,
            _overwrite: bool,
            _delete_src: bool,
        ) -> Result<()> {
            if !src.exists() {
                return Ok(()); // vanished mid-walk: tolerated
            }
            self.promoted.lock().insert(obj_name.to_string());
            Ok(())
        }
    }

    fn smap_with_targets(n: usize) -> Smap {
        let primary = Snode::new("p1", NodeRole::Proxy, NetAddr::new("127.0.0.1", 8080));
        let mut smap = Smap::new("U-1", primary);
        for i in 1..=n {
            smap.put_node(
                Snode::new(
                    format!("t{i}"),
                    NodeRole::Target,
                    NetAddr::new("127.0.0.1", 9000 + i as u16),
                ),
                SnodeFlags::default(),
            );
        }
        smap
    }

    fn seed_dir(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            let path = dir.path().join(f);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"data").unwrap();
        }
        dir
    }

    #[test]
    fn test_promote_flat() {
        let dir = seed_dir(&["a.bin", "b.bin", "sub/c.bin"]);
        let smap = smap_with_targets(1);
        let sink = RecordingSink::default();
        let args = PromoteArgs {
            src_dir: dir.path().to_str().unwrap().to_string(),
            recursive: false,
            ..Default::default()
        };
        let stats = run_promote(&args, &smap, "t1", &sink).unwrap();
        assert_eq!(stats.promoted, 2); // sub/ not descended
        assert!(sink.promoted.lock().contains("a.bin"));
    }

    #[test]
    fn test_promote_recursive_with_prefix() {
        let dir = seed_dir(&["a.bin", "sub/c.bin"]);
        let smap = smap_with_targets(1);
        let sink = RecordingSink::default();
        let args = PromoteArgs {
            src_dir: dir.path().to_str().unwrap().to_string(),
            dst_obj_prefix: "ingest".to_string(),
            recursive: true,
            ..Default::default()
        };
        let stats = run_promote(&args, &smap, "t1", &sink).unwrap();
        assert_eq!(stats.promoted, 2);
        let promoted = sink.promoted.lock();
        assert!(promoted.contains("ingest/a.bin"));
        assert!(promoted.contains("ingest/sub/c.bin"));
    }

    #[test]
    fn test_file_share_promotes_each_file_exactly_once() {
        // two targets walk the same shared directory
        let dir = seed_dir(&["f1", "f2", "f3", "f4"]);
        let smap = smap_with_targets(2);
        let args = PromoteArgs {
            src_dir: dir.path().to_str().unwrap().to_string(),
            recursive: false,
            file_share: true,
            ..Default::default()
        };

        let sink1 = RecordingSink::default();
        let sink2 = RecordingSink::default();
        let s1 = run_promote(&args, &smap, "t1", &sink1).unwrap();
        let s2 = run_promote(&args, &smap, "t2", &sink2).unwrap();

        // cluster-wide: each file promoted exactly once
        let p1 = sink1.promoted.lock();
        let p2 = sink2.promoted.lock();
        assert!(p1.is_disjoint(&p2));
        assert_eq!(p1.len() + p2.len(), 4);
        assert_eq!(s1.promoted + s2.promoted, 4);
        assert_eq!(s1.skipped_non_local + s2.skipped_non_local, 4);
    }

    #[test]
    fn test_no_file_share_promotes_everything() {
        let dir = seed_dir(&["f1", "f2"]);
        let smap = smap_with_targets(2);
        let sink = RecordingSink::default();
        let args = PromoteArgs {
            src_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        let stats = run_promote(&args, &smap, "t1", &sink).unwrap();
        assert_eq!(stats.promoted, 2);
        assert_eq!(stats.skipped_non_local, 0);
    }
}
