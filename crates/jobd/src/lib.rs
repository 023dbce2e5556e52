//! jobd: supervised job execution for Linux
//!
//! Clients hand over an executable, arguments, and a limit request; each job
//! runs in its own cgroup-v2 subtree with dropped privileges and an isolated
//! process group, stdout/stderr captured to disk, and ordered teardown on
//! exit or stop.
//!
//! # Modules
//!
//! - **fs**: per-job working directories and output sinks
//! - **job**: one supervised execution with its status lifecycle
//! - **registry**: process-wide index of live jobs
//!
//! # Example
//!
//! ```ignore
//! use jobd::{Registry, ResourceRequest, StartRequest};
//!
//! let registry = Registry::new();
//! let id = registry.start_job(&StartRequest {
//!     executable: "/bin/echo".to_string(),
//!     args: vec!["hello".to_string()],
//!     limits: ResourceRequest {
//!         cpu: Some("500m".to_string()),
//!         ..Default::default()
//!     },
//! })?;
//!
//! let (status, exit_code) = registry.wait_job(&id)?;
//! println!("{status} ({exit_code})");
//! ```

pub mod fs;
pub mod job;
pub mod registry;

pub use job::{Job, Status};
pub use registry::{ApiStatus, Registry, StartRequest};

pub use jobd_cgroup::{Cgroup, Limit, ResourceRequest, Snapshot};
pub use jobd_core::{JobError, Result};

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
