//! Error types for job supervision

use std::io;
use thiserror::Error;

/// Result type for job operations
pub type Result<T> = std::result::Result<T, JobError>;

/// Errors that can occur while supervising jobs
#[derive(Error, Debug)]
pub enum JobError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("teardown error: {0}")]
    Teardown(String),
}

impl JobError {
    /// Join a list of teardown sub-errors into a single composite error.
    /// Returns `None` when the list is empty.
    pub fn join_teardown(errs: Vec<String>) -> Option<JobError> {
        if errs.is_empty() {
            None
        } else {
            Some(JobError::Teardown(errs.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JobError::InvalidState("cannot start job twice".to_string());
        assert_eq!(err.to_string(), "invalid state: cannot start job twice");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = JobError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_join_teardown_empty() {
        assert!(JobError::join_teardown(Vec::new()).is_none());
    }

    #[test]
    fn test_join_teardown_multiple() {
        let err = JobError::join_teardown(vec![
            "kill pgid: no such process".to_string(),
            "cleanup cgroup: busy".to_string(),
        ])
        .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("kill pgid"));
        assert!(msg.contains("cleanup cgroup"));
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
