//! jobd-cgroup: per-job cgroup v2 subtrees and limit translation
//!
//! Each job gets its own cgroup under `/sys/fs/cgroup/jobs/<id>/` with the
//! requested controllers delegated and limits applied. The open directory
//! handle is handed back so the child can be attached at spawn time.

pub mod cgroup;
pub mod limits;

pub use cgroup::{Cgroup, Snapshot};
pub use limits::{Limit, ResourceRequest};
