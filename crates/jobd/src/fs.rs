//! Per-job working directories and output sinks

use jobd_core::Result;
use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const JOBS_BASE_DIR: &str = "/var/lib/jobs";
const STDOUT_FILENAME: &str = "stdout.log";
const STDERR_FILENAME: &str = "stderr.log";

/// Base directory holding every per-job directory.
pub fn jobs_base_dir() -> PathBuf {
    std::env::var("JOBD_JOBS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(JOBS_BASE_DIR))
}

/// Filesystem locations for one job. Computing the paths has no side
/// effects; `create` and `open_sinks` do the provisioning.
#[derive(Debug, Clone)]
pub struct JobDirs {
    pub dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl JobDirs {
    pub fn for_id(id: &str) -> Self {
        let dir = jobs_base_dir().join(id);
        let stdout_path = dir.join(STDOUT_FILENAME);
        let stderr_path = dir.join(STDERR_FILENAME);
        Self {
            dir,
            stdout_path,
            stderr_path,
        }
    }

    /// Create the per-job directory (and the base directory on first use).
    pub fn create(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.dir)?;
        Ok(())
    }

    /// Open both sinks create/write/append, mode 0640. The caller owns the
    /// handles and is responsible for closing them exactly once.
    pub fn open_sinks(&self) -> Result<(File, File)> {
        let stdout_sink = self.open_sink(&self.stdout_path)?;
        let stderr_sink = self.open_sink(&self.stderr_path)?;
        Ok((stdout_sink, stderr_sink))
    }

    fn open_sink(&self, path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(path)?;
        Ok(file)
    }
}
