//! jobd-core: shared types and host probes for jobd
//!
//! This crate provides the foundational pieces used by all jobd sub-crates:
//! - Error types and Result alias
//! - Host probes (root privileges, cgroup v2 availability)

pub mod error;
pub mod utils;

pub use error::{JobError, Result};
