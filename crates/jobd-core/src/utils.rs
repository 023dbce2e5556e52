//! Host probes for job supervision
//!
//! Probes honor the same `JOBD_*` environment overrides the rest of the
//! crates use for scratch hosts: `JOBD_ASSUME_ROOT` forces the privilege
//! probe and `JOBD_CGROUP_ROOT` relocates the cgroup hierarchy.

use std::env;
use std::path::{Path, PathBuf};

/// Effective uid/gid of the supervising process.
pub fn effective_ids() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

/// Whether the supervisor can write cgroup interface files and drop child
/// credentials. `JOBD_ASSUME_ROOT=1` (or `0`) overrides the probe.
pub fn is_root() -> bool {
    match env::var("JOBD_ASSUME_ROOT") {
        Ok(v) => v == "1",
        Err(_) => effective_ids().0 == 0,
    }
}

/// Check that a cgroup v2 unified hierarchy is mounted at the configured
/// root.
pub fn has_cgroup_v2() -> bool {
    let root = env::var("JOBD_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"));
    Path::new(&root).join("cgroup.controllers").exists()
}
