//! Process-wide index of live jobs

use jobd_core::{JobError, Result};
use log::info;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;
use std::thread;
use uuid::Uuid;

use crate::job::{Job, Status};
use jobd_cgroup::limits::{self, ResourceRequest};

/// Parameters for starting one job.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub limits: ResourceRequest,
}

/// Externally visible job status. The internal `Unknown` and `Started`
/// states are transient and map to `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    Unspecified,
    Running,
    Exited,
    Stopped,
    Failed,
}

impl From<Status> for ApiStatus {
    fn from(status: Status) -> ApiStatus {
        match status {
            Status::Running => ApiStatus::Running,
            Status::Exited => ApiStatus::Exited,
            Status::Stopped => ApiStatus::Stopped,
            Status::Failed => ApiStatus::Failed,
            Status::Unknown | Status::Started => ApiStatus::Unspecified,
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiStatus::Unspecified => "unspecified",
            ApiStatus::Running => "running",
            ApiStatus::Exited => "exited",
            ApiStatus::Stopped => "stopped",
            ApiStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Maps job identifiers to live jobs. Lookups take the read lock, so
/// status, stop, and sink-path queries never block one another; only
/// insertion takes the write lock. Records are retained for post-mortem
/// queries until the process exits.
pub struct Registry {
    jobs: RwLock<HashMap<String, Job>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Start a job from a request: generate an identifier, translate the
    /// limit request into cgroup tokens, start the job, and index it.
    /// A background observer logs the terminal status once the job is done.
    pub fn start_job(&self, req: &StartRequest) -> Result<String> {
        if req.executable.is_empty() {
            return Err(JobError::InvalidArgument("executable required".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let limits = limits::translate(&req.limits)?;

        let job = Job::new(&id, &req.executable, req.args.clone(), limits)?;
        job.start()?;

        {
            let mut jobs = self.jobs.write().unwrap_or_else(|poison| poison.into_inner());
            jobs.insert(id.clone(), job.clone());
        }

        let observer = job.clone();
        thread::spawn(move || {
            observer.wait();
            info!(
                "job {} done status={} exit={}",
                observer.id(),
                observer.status(),
                observer.exit_code()
            );
        });

        Ok(id)
    }

    /// Stop a job and report its terminal status.
    pub fn stop_job(&self, id: &str) -> Result<(ApiStatus, i32)> {
        let job = self
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        job.stop()?;
        Ok((job.status().into(), job.exit_code()))
    }

    /// Current status and exit code of a job.
    pub fn get_status(&self, id: &str) -> Result<(ApiStatus, i32)> {
        let job = self
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok((job.status().into(), job.exit_code()))
    }

    /// Block until the job's teardown has finished, then report its
    /// terminal status.
    pub fn wait_job(&self, id: &str) -> Result<(ApiStatus, i32)> {
        let job = self
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        job.wait();
        Ok((job.status().into(), job.exit_code()))
    }

    /// On-disk locations of a job's captured output.
    pub fn sink_paths(&self, id: &str) -> Result<(PathBuf, PathBuf)> {
        let job = self
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok((
            job.stdout_path().to_path_buf(),
            job.stderr_path().to_path_buf(),
        ))
    }

    pub fn job_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    fn get(&self, id: &str) -> Option<Job> {
        if id.is_empty() {
            return None;
        }
        self.jobs
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(id)
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
