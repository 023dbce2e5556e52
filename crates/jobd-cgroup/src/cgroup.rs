//! Cgroup v2 management for per-job resource limits

use jobd_core::{JobError, Result};
use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::limits::Limit;

const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";
const JOBS_SUBTREE: &str = "jobs";

/// Controllers we try to delegate to job cgroups.
const DESIRED_CONTROLLERS: [&str; 4] = ["cpu", "memory", "io", "pids"];

/// Interface files a limit is allowed to target.
const ALLOWED_LIMIT_KEYS: [&str; 3] = ["cpu.max", "memory.max", "io.max"];

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

fn cgroup_root_path() -> PathBuf {
    std::env::var("JOBD_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_V2_ROOT))
}

/// Parent directory holding every per-job cgroup.
pub fn jobs_root_path() -> PathBuf {
    cgroup_root_path().join(JOBS_SUBTREE)
}

/// Absolute path of the cgroup for one job id.
pub fn path_for(id: &str) -> PathBuf {
    jobs_root_path().join(id)
}

/// Point-in-time view of a job cgroup's interface files. Missing files
/// contribute zero/empty fields; a snapshot never fails outright.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub pids_current: u64,
    pub procs: Vec<i32>,
    pub cpu_max: String,
    pub memory_max: String,
    pub io_max: String,
    pub memory_current: u64,
    pub cpu_stat: HashMap<String, u64>,
}

/// One job's cgroup directory, plus an open handle to it.
///
/// The handle is what makes attachment atomic: the spawn path opens
/// `cgroup.procs` relative to this descriptor from inside the forked child,
/// so the executed program never runs outside its cgroup.
#[derive(Debug)]
pub struct Cgroup {
    id: String,
    path: PathBuf,
    dir: File,
}

impl Cgroup {
    /// Realize the cgroup for `id`: ensure the jobs subtree exists with the
    /// desired controllers delegated, create the per-job directory, apply
    /// `limits`, and open a directory handle for attachment.
    ///
    /// Any failure after the per-job directory was created removes it again
    /// before returning.
    pub fn create(id: &str, limits: &[Limit]) -> Result<Cgroup> {
        let jobs_root = jobs_root_path();
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&jobs_root)
            .map_err(|e| {
                JobError::Cgroup(format!(
                    "failed to create jobs subtree {}: {}",
                    jobs_root.display(),
                    e
                ))
            })?;

        enable_controllers(&jobs_root)?;

        let path = jobs_root.join(id);
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&path)
            .map_err(|e| {
                JobError::Cgroup(format!("failed to create cgroup {}: {}", path.display(), e))
            })?;

        match Self::populate(&path, limits) {
            Ok(dir) => Ok(Cgroup {
                id: id.to_string(),
                path,
                dir,
            }),
            Err(e) => {
                if let Err(rm_err) = remove_cgroup_dir(&path) {
                    log::warn!(
                        "failed to roll back cgroup {} after setup error: {}",
                        path.display(),
                        rm_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Apply limits and open the directory handle. Limit keys are validated
    /// up front so a rogue key rejects the whole request before any
    /// interface file is written.
    fn populate(path: &Path, limits: &[Limit]) -> Result<File> {
        for limit in limits {
            if !ALLOWED_LIMIT_KEYS.contains(&limit.key.as_str()) {
                return Err(JobError::Cgroup(format!(
                    "unsupported limit key: {}",
                    limit.key
                )));
            }
        }

        for limit in limits {
            let file = path.join(&limit.key);
            if !file.exists() {
                return Err(JobError::Cgroup(format!(
                    "controller not delegated: {} does not exist",
                    file.display()
                )));
            }
            fs::write(&file, format!("{}\n", limit.value)).map_err(|e| {
                JobError::Cgroup(format!("failed to write {}: {}", file.display(), e))
            })?;
        }

        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| {
                JobError::Cgroup(format!(
                    "failed to open cgroup directory {}: {}",
                    path.display(),
                    e
                ))
            })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Raw descriptor of the cgroup directory, for attach-at-spawn.
    pub fn dir_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }

    /// Kill every process in the cgroup through the kernel's `cgroup.kill`
    /// interface. A missing cgroup means nothing to kill.
    pub fn kill(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        fs::write(self.path.join("cgroup.kill"), "1").map_err(|e| {
            JobError::Cgroup(format!(
                "failed to write cgroup.kill in {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Remove the cgroup. Succeeds if it is already gone. Live occupants are
    /// killed through `cgroup.kill` and given up to two seconds to drain out
    /// of `cgroup.procs` before the directory is removed.
    pub fn delete(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let _ = self.kill();

        let procs = self.path.join("cgroup.procs");
        let deadline = Instant::now() + DRAIN_DEADLINE;
        loop {
            match fs::read_to_string(&procs) {
                Ok(s) if s.trim().is_empty() => break,
                Err(_) => break,
                Ok(_) => {}
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "cgroup {} still has processes after {:?}",
                    self.path.display(),
                    DRAIN_DEADLINE
                );
                break;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }

        remove_cgroup_dir(&self.path).map_err(|e| {
            JobError::Cgroup(format!(
                "failed to remove cgroup {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Read the cgroup's counters and limit files.
    pub fn snapshot(&self) -> Snapshot {
        let mut snap = Snapshot {
            path: self.path.clone(),
            ..Default::default()
        };

        if let Some(s) = read_trimmed(&self.path.join("pids.current")) {
            snap.pids_current = s.parse().unwrap_or(0);
        }
        if let Some(s) = read_trimmed(&self.path.join("cgroup.procs")) {
            snap.procs = s.lines().filter_map(|l| l.trim().parse().ok()).collect();
        }
        if let Some(s) = read_trimmed(&self.path.join("cpu.max")) {
            snap.cpu_max = s;
        }
        if let Some(s) = read_trimmed(&self.path.join("memory.max")) {
            snap.memory_max = s;
        }
        if let Some(s) = read_trimmed(&self.path.join("io.max")) {
            snap.io_max = s;
        }
        if let Some(s) = read_trimmed(&self.path.join("memory.current")) {
            snap.memory_current = s.parse().unwrap_or(0);
        }
        if let Some(s) = read_trimmed(&self.path.join("cpu.stat")) {
            for line in s.lines() {
                let mut parts = line.split_whitespace();
                if let (Some(key), Some(value)) = (parts.next(), parts.next())
                    && let Ok(value) = value.parse()
                {
                    snap.cpu_stat.insert(key.to_string(), value);
                }
            }
        }

        snap
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        let _ = self.delete();
    }
}

/// Delegate the desired controllers to children of the jobs subtree.
///
/// Without `+<controller>` tokens in the parent's `cgroup.subtree_control`,
/// the per-job interface files never appear, so failure here is fatal.
fn enable_controllers(jobs_root: &Path) -> Result<()> {
    let controllers_path = jobs_root.join("cgroup.controllers");
    let available = fs::read_to_string(&controllers_path).map_err(|e| {
        JobError::Cgroup(format!(
            "failed to read {}: {}",
            controllers_path.display(),
            e
        ))
    })?;
    let available: Vec<&str> = available.split_whitespace().collect();

    let wanted: Vec<&str> = DESIRED_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| available.contains(c))
        .collect();
    if wanted.is_empty() {
        return Err(JobError::Cgroup(format!(
            "no controllers available under {}",
            jobs_root.display()
        )));
    }

    let subtree_path = jobs_root.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&subtree_path).map_err(|e| {
        JobError::Cgroup(format!("failed to read {}: {}", subtree_path.display(), e))
    })?;
    let enabled: Vec<&str> = enabled.split_whitespace().collect();

    let missing: Vec<String> = wanted
        .iter()
        .filter(|c| !enabled.contains(*c))
        .map(|c| format!("+{}", c))
        .collect();
    if !missing.is_empty() {
        let tokens = format!("{}\n", missing.join(" "));
        fs::write(&subtree_path, tokens).map_err(|e| {
            JobError::Cgroup(format!(
                "failed to enable controllers in {}: {}",
                subtree_path.display(),
                e
            ))
        })?;
    }

    Ok(())
}

/// Remove a cgroup directory, recursing into child cgroups first.
///
/// The kernel reaps interface files on rmdir, so a drained cgroup removes
/// with a plain rmdir; ENOTEMPTY only happens on a scratch root holding
/// regular files.
fn remove_cgroup_dir(path: &Path) -> io::Result<()> {
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                remove_cgroup_dir(&entry.path())?;
            }
        }
    }

    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use std::env;
    use tempfile::tempdir;

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvVarGuard {
        fn new(key: &'static str, value: &str) -> Self {
            let prev = env::var(key).ok();
            unsafe {
                env::set_var(key, value);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            if let Some(ref value) = self.prev {
                unsafe {
                    env::set_var(self.key, value);
                }
            } else {
                unsafe {
                    env::remove_var(self.key);
                }
            }
        }
    }

    fn seed_scratch_root(root: &Path) {
        let jobs = root.join(JOBS_SUBTREE);
        fs::create_dir_all(&jobs).unwrap();
        fs::write(jobs.join("cgroup.controllers"), "cpu memory io pids\n").unwrap();
        fs::write(jobs.join("cgroup.subtree_control"), "").unwrap();
    }

    #[test]
    fn create_enables_missing_controllers() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());

        let cg = Cgroup::create("cg-create", &[]).unwrap();
        assert!(cg.exists());
        assert!(cg.dir_fd() >= 0);

        let tokens =
            fs::read_to_string(tmp.path().join("jobs").join("cgroup.subtree_control")).unwrap();
        assert_eq!(tokens.trim(), "+cpu +memory +io +pids");
    }

    #[test]
    fn create_skips_already_enabled_controllers() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());
        let subtree = tmp.path().join("jobs").join("cgroup.subtree_control");
        fs::write(&subtree, "cpu memory io pids\n").unwrap();

        let _cg = Cgroup::create("cg-enabled", &[]).unwrap();
        // Nothing was missing, so the file keeps its seeded contents.
        assert_eq!(
            fs::read_to_string(&subtree).unwrap().trim(),
            "cpu memory io pids"
        );
    }

    #[test]
    fn create_writes_limit_files() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());
        let job_dir = tmp.path().join("jobs").join("cg-limits");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("cpu.max"), "max 100000\n").unwrap();
        fs::write(job_dir.join("memory.max"), "max\n").unwrap();

        let limits = vec![
            Limit::new("cpu.max", "50000 100000"),
            Limit::new("memory.max", "104857600"),
        ];
        let _cg = Cgroup::create("cg-limits", &limits).unwrap();

        assert_eq!(
            fs::read_to_string(job_dir.join("cpu.max")).unwrap(),
            "50000 100000\n"
        );
        assert_eq!(
            fs::read_to_string(job_dir.join("memory.max")).unwrap(),
            "104857600\n"
        );
    }

    #[test]
    fn create_rejects_unsupported_limit_key_before_writing() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());
        let job_dir = tmp.path().join("jobs").join("cg-rogue");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("cpu.max"), "max 100000\n").unwrap();

        let limits = vec![
            Limit::new("cpu.max", "50000 100000"),
            Limit::new("io.rogue", "x"),
        ];
        let err = Cgroup::create("cg-rogue", &limits).unwrap_err();
        assert!(err.to_string().contains("unsupported limit key"));
        // The valid entry earlier in the list was not written either.
        assert!(!job_dir.exists());
    }

    #[test]
    fn create_reports_missing_interface_file() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());

        let limits = vec![Limit::new("memory.max", "104857600")];
        let err = Cgroup::create("cg-undelegated", &limits).unwrap_err();
        assert!(err.to_string().contains("controller not delegated"));
        assert!(!tmp.path().join("jobs").join("cg-undelegated").exists());
    }

    #[test]
    fn create_fails_without_any_controllers() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        let jobs = tmp.path().join(JOBS_SUBTREE);
        fs::create_dir_all(&jobs).unwrap();
        fs::write(jobs.join("cgroup.controllers"), "\n").unwrap();
        fs::write(jobs.join("cgroup.subtree_control"), "").unwrap();

        let err = Cgroup::create("cg-none", &[]).unwrap_err();
        assert!(err.to_string().contains("no controllers available"));
    }

    #[test]
    fn create_fails_without_unified_hierarchy() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());

        // No cgroup.controllers anywhere under the root.
        let err = Cgroup::create("cg-nov2", &[]).unwrap_err();
        assert!(err.to_string().contains("cgroup.controllers"));
    }

    #[test]
    fn kill_writes_the_kill_file() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());

        let cg = Cgroup::create("cg-kill", &[]).unwrap();
        cg.kill().unwrap();
        assert_eq!(
            fs::read_to_string(cg.path().join("cgroup.kill")).unwrap(),
            "1"
        );

        cg.delete().unwrap();
        // Nothing left to kill once the cgroup is gone.
        cg.kill().unwrap();
    }

    #[test]
    fn delete_succeeds_when_directory_is_gone() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());

        let cg = Cgroup::create("cg-gone", &[]).unwrap();
        cg.delete().unwrap();
        assert!(!cg.exists());
        // Idempotent.
        cg.delete().unwrap();
    }

    #[test]
    fn delete_removes_directory_with_interface_files() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());
        let job_dir = tmp.path().join("jobs").join("cg-files");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("cpu.max"), "max 100000\n").unwrap();

        let cg = Cgroup::create("cg-files", &[]).unwrap();
        cg.delete().unwrap();
        assert!(!job_dir.exists());
    }

    #[test]
    fn snapshot_defaults_on_missing_files() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());

        let cg = Cgroup::create("cg-empty-snap", &[]).unwrap();
        let snap = cg.snapshot();
        assert_eq!(snap.pids_current, 0);
        assert!(snap.procs.is_empty());
        assert!(snap.cpu_max.is_empty());
        assert_eq!(snap.memory_current, 0);
        assert!(snap.cpu_stat.is_empty());
    }

    #[test]
    fn snapshot_reads_counters() {
        let _lock = serial_guard();
        let tmp = tempdir().unwrap();
        let _env = EnvVarGuard::new("JOBD_CGROUP_ROOT", tmp.path().to_str().unwrap());
        seed_scratch_root(tmp.path());
        let job_dir = tmp.path().join("jobs").join("cg-snap");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("pids.current"), "3\n").unwrap();
        fs::write(job_dir.join("cgroup.procs"), "101\n102\n").unwrap();
        fs::write(job_dir.join("cpu.max"), "50000 100000\n").unwrap();
        fs::write(job_dir.join("memory.max"), "max\n").unwrap();
        fs::write(job_dir.join("memory.current"), "4096\n").unwrap();
        fs::write(
            job_dir.join("cpu.stat"),
            "usage_usec 900\nnr_throttled 2\nthrottled_usec 40\n",
        )
        .unwrap();

        let cg = Cgroup::create("cg-snap", &[]).unwrap();
        let snap = cg.snapshot();
        assert_eq!(snap.pids_current, 3);
        assert_eq!(snap.procs, vec![101, 102]);
        assert_eq!(snap.cpu_max, "50000 100000");
        assert_eq!(snap.memory_max, "max");
        assert_eq!(snap.memory_current, 4096);
        assert_eq!(snap.cpu_stat["usage_usec"], 900);
        assert_eq!(snap.cpu_stat["nr_throttled"], 2);

        // Empty the scratch procs file so the drop-time delete does not sit
        // in the drain loop.
        fs::write(job_dir.join("cgroup.procs"), "").unwrap();
    }
}
