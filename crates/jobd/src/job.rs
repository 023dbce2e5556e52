//! One supervised execution: cgroup-bound spawn, status lifecycle, waiter,
//! and ordered teardown

use jobd_cgroup::{Cgroup, Limit};
use jobd_core::{JobError, Result, utils};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once};
use std::thread;

use crate::fs::JobDirs;

/// At most this much of each sink is replayed into the service log.
const MAX_LOG_DUMP_BYTES: usize = 64 * 1024;

/// Credentials the child drops to when the supervisor runs as root.
const NOBODY_UID: libc::uid_t = 65534;
const NOBODY_GID: libc::gid_t = 65534;

/// Exit code when no process state was available.
pub const EXIT_CODE_UNKNOWN: i32 = -10;
/// Exit code when the job failed to start.
pub const EXIT_CODE_SPAWN_FAILED: i32 = -11;
/// Exit code when cgroup setup failed.
pub const EXIT_CODE_CGROUP_FAILED: i32 = -12;
/// Exit code when the child was killed by a signal.
pub const EXIT_CODE_KILLED_BY_SIGNAL: i32 = -13;

/// Lifecycle states of a job. Transitions are compare-and-swapped on a
/// single atomic word, so readers always see a consistent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Unknown = 0,
    Started = 1,
    Running = 2,
    Exited = 3,
    Stopped = 4,
    Failed = 5,
}

impl Status {
    fn from_i32(v: i32) -> Status {
        match v {
            1 => Status::Started,
            2 => Status::Running,
            3 => Status::Exited,
            4 => Status::Stopped,
            5 => Status::Failed,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Started => "started",
            Status::Running => "running",
            Status::Exited => "exited",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One-shot completion signal. Signaled at most once; once signaled, any
/// number of waiters observe it without further blocking.
struct DoneSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl DoneSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut done = lock(&self.done);
        if !*done {
            *done = true;
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .cv
                .wait(done)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    fn is_set(&self) -> bool {
        *lock(&self.done)
    }
}

/// A single supervised execution.
///
/// `Job` is a cheap-to-clone handle; the waiter thread, the registry, and
/// callers all share the same underlying record. Consumers never get
/// channels to the live process; output is persisted to the on-disk sinks
/// and the registry serves lookups. Constructing a job has no side effects;
/// `start` provisions the cgroup, directories, and child.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.inner.id).finish()
    }
}

struct JobInner {
    id: String,
    argv: Vec<String>,
    limits: Vec<Limit>,
    dirs: JobDirs,

    status: AtomicI32,
    exit_code: AtomicI32,
    stopped: AtomicBool,
    wait_once: Once,
    done: DoneSignal,

    cgroup: Mutex<Option<Cgroup>>,
    sinks: Mutex<Option<(File, File)>>,
    child: Mutex<Option<Child>>,
    pid: AtomicI32,
}

impl Job {
    /// Build a job record. Validates the identifier and executable but
    /// touches nothing on disk.
    pub fn new(id: &str, executable: &str, args: Vec<String>, limits: Vec<Limit>) -> Result<Job> {
        if id.is_empty() {
            return Err(JobError::InvalidArgument("job id required".to_string()));
        }
        if id.contains('/') || id == "." || id == ".." {
            return Err(JobError::InvalidArgument(format!(
                "job id must be a single path component: {:?}",
                id
            )));
        }
        if executable.is_empty() {
            return Err(JobError::InvalidArgument("executable required".to_string()));
        }

        let mut argv = vec![executable.to_string()];
        argv.extend(args);

        Ok(Job {
            inner: Arc::new(JobInner {
                dirs: JobDirs::for_id(id),
                id: id.to_string(),
                argv,
                limits,
                status: AtomicI32::new(Status::Unknown as i32),
                exit_code: AtomicI32::new(EXIT_CODE_UNKNOWN),
                stopped: AtomicBool::new(false),
                wait_once: Once::new(),
                done: DoneSignal::new(),
                cgroup: Mutex::new(None),
                sinks: Mutex::new(None),
                child: Mutex::new(None),
                pid: AtomicI32::new(0),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn exit_code(&self) -> i32 {
        self.inner.exit_code.load(Ordering::SeqCst)
    }

    pub fn stdout_path(&self) -> &Path {
        &self.inner.dirs.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.inner.dirs.stderr_path
    }

    /// Block until teardown has finished. Any number of concurrent waiters
    /// unblock together, and all side effects of teardown are visible once
    /// this returns.
    pub fn wait(&self) {
        self.inner.done.wait();
    }

    /// Non-blocking probe of the completion signal.
    pub fn is_done(&self) -> bool {
        self.inner.done.is_set()
    }

    /// Start the job: realize the cgroup, provision output sinks, spawn the
    /// child attached to the cgroup with dropped privileges in its own
    /// process group, and launch the waiter.
    ///
    /// Idempotence guard: only the `Unknown -> Started` transition may
    /// start; a second call fails with `InvalidState`. On any failure the
    /// job lands in `Failed` with the matching sentinel exit code, the
    /// completion signal fires, and everything created so far is torn down.
    pub fn start(&self) -> Result<()> {
        self.inner.launch()?;

        let waiter = self.clone();
        thread::spawn(move || waiter.inner.wait_for_exit());

        Ok(())
    }

    /// Stop the job. Idempotent; may race the waiter. Kills the whole
    /// process group (with a direct-kill fallback), writes `cgroup.kill` as
    /// a second, kernel-level guarantee, forces the status to `Stopped`,
    /// and does not return until teardown (including the cgroup delete) has
    /// run.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }
}

impl JobInner {
    /// Ordered start steps, each reversing the last on failure. The waiter
    /// is spawned by the caller once this returns success.
    fn launch(&self) -> Result<()> {
        if !self.try_transition(Status::Unknown, Status::Started) {
            return Err(JobError::InvalidState(format!(
                "cannot start job {}: current status={}",
                self.id,
                self.status()
            )));
        }

        let cgroup = match Cgroup::create(&self.id, &self.limits) {
            Ok(cg) => cg,
            Err(e) => {
                return Err(self.fail_start("failed to create cgroup", EXIT_CODE_CGROUP_FAILED, e));
            }
        };
        let cgroup_fd = cgroup.dir_fd();
        *lock(&self.cgroup) = Some(cgroup);

        if let Err(e) = self.dirs.create() {
            return Err(self.fail_start(
                "failed to prepare job directory",
                EXIT_CODE_SPAWN_FAILED,
                e,
            ));
        }
        let (stdout_sink, stderr_sink) = match self.dirs.open_sinks() {
            Ok(pair) => pair,
            Err(e) => {
                return Err(self.fail_start(
                    "failed to open output sinks",
                    EXIT_CODE_SPAWN_FAILED,
                    e,
                ));
            }
        };
        let child_io = stdout_sink
            .try_clone()
            .and_then(|out| stderr_sink.try_clone().map(|err| (out, err)));
        *lock(&self.sinks) = Some((stdout_sink, stderr_sink));
        let (stdout_for_child, stderr_for_child) = match child_io {
            Ok(pair) => pair,
            Err(e) => {
                return Err(self.fail_start(
                    "failed to duplicate output sinks",
                    EXIT_CODE_SPAWN_FAILED,
                    e.into(),
                ));
            }
        };

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_for_child))
            .stderr(Stdio::from(stderr_for_child));

        let drop_privileges = utils::is_root();
        if !drop_privileges {
            warn!(
                "job {}: not running as root, child keeps current credentials",
                self.id
            );
        }
        unsafe {
            cmd.pre_exec(move || child_setup(cgroup_fd, drop_privileges));
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(self.fail_start(
                    "failed to start target",
                    EXIT_CODE_SPAWN_FAILED,
                    e.into(),
                ));
            }
        };
        let pid = child.id() as i32;
        self.pid.store(pid, Ordering::SeqCst);
        *lock(&self.child) = Some(child);

        self.log_snapshot(pid);

        if !self.try_transition(Status::Started, Status::Running) {
            // The job is already executing; a lost transition is not fatal.
            warn!("job {} was unable to transition to running", self.id);
        }

        info!("job {}: started: {:?}", self.id, self.argv);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errs: Vec<String> = Vec::new();

        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            let pid = Pid::from_raw(pid);
            match getpgid(Some(pid)) {
                Ok(pgid) => {
                    if let Err(e) = killpg(pgid, Signal::SIGKILL)
                        && e != Errno::ESRCH
                    {
                        warn!("failed to kill process group for job {}: {}", self.id, e);
                        errs.push(format!("kill pgid: {}", e));
                    }
                }
                Err(_) => {
                    if let Err(e) = kill(pid, Signal::SIGKILL)
                        && e != Errno::ESRCH
                    {
                        warn!("failed to kill process for job {}: {}", self.id, e);
                        errs.push(format!("kill process: {}", e));
                    }
                }
            }
        }

        // Second, kernel-level kill guarantee: cgroup.kill reaches every
        // process in the cgroup even if the pgid signal missed some. The
        // one cgroup delete happens inside the teardown latch below.
        if let Err(e) = self.kill_cgroup() {
            warn!("failed to kill cgroup for job {}: {}", self.id, e);
            errs.push(format!("cgroup kill: {}", e));
        }

        self.set_status(Status::Stopped);

        // Teardown must complete before Stop returns; whoever enters the
        // latch first runs it, everyone else blocks until it is done.
        self.wait_once.call_once(|| self.do_wait());

        match JobError::join_teardown(errs) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn status(&self) -> Status {
        Status::from_i32(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as i32, Ordering::SeqCst);
    }

    fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    fn try_transition(&self, from: Status, to: Status) -> bool {
        let ok = self
            .status
            .compare_exchange(from as i32, to as i32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            debug!("job {}: status transition {} -> {}", self.id, from, to);
        } else {
            warn!(
                "job {}: failed status transition {} -> {} (current={})",
                self.id,
                from,
                to,
                self.status()
            );
        }
        ok
    }

    /// Record a start failure: force `Failed`, store the sentinel exit
    /// code, and run teardown through the latch so waiters never hang.
    fn fail_start(&self, reason: &str, code: i32, err: JobError) -> JobError {
        self.set_status(Status::Failed);
        self.set_exit_code(code);
        warn!("job {}: {}: {}", self.id, reason, err);

        self.wait_once.call_once(|| {
            self.close_sinks();
            self.release_cgroup();
            self.done.signal();
        });

        match code {
            EXIT_CODE_CGROUP_FAILED => JobError::Cgroup(format!("{}: {}", reason, err)),
            _ => JobError::Spawn(format!("{}: {}", reason, err)),
        }
    }

    fn wait_for_exit(&self) {
        self.wait_once.call_once(|| self.do_wait());
    }

    /// The single teardown path. Runs exactly once, under `wait_once`,
    /// whether reached from the waiter thread, a failed start, or `stop`.
    fn do_wait(&self) {
        let taken = lock(&self.child).take();
        let Some(mut child) = taken else {
            // No child was ever spawned; release whatever start managed to
            // create and wake the waiters.
            debug!(
                "job {}: nothing to reap (status={})",
                self.id,
                self.status()
            );
            self.close_sinks();
            self.release_cgroup();
            self.done.signal();
            return;
        };

        match child.wait() {
            Ok(exit) => {
                if let Some(signal) = exit.signal() {
                    info!("job {} was terminated by signal {}", self.id, signal);
                    self.set_exit_code(EXIT_CODE_KILLED_BY_SIGNAL);
                } else if let Some(code) = exit.code() {
                    info!("job {} exited with code {}", self.id, code);
                    self.set_exit_code(code);
                } else {
                    warn!("job {} exited without a reportable status", self.id);
                    self.set_exit_code(EXIT_CODE_UNKNOWN);
                }
            }
            Err(e) => {
                warn!("job {}: wait failed: {}", self.id, e);
                self.set_exit_code(EXIT_CODE_UNKNOWN);
            }
        }

        if self.stopped.load(Ordering::SeqCst) {
            // The stop flag wins even over a natural exit observed first.
            if self.status() != Status::Stopped {
                info!(
                    "job {} was externally stopped, overriding status to stopped",
                    self.id
                );
                self.set_status(Status::Stopped);
            }
        } else if self.status() != Status::Failed {
            self.set_status(Status::Exited);
        }

        self.close_sinks();

        self.dump_sink("STDOUT", &self.dirs.stdout_path);
        self.dump_sink("STDERR", &self.dirs.stderr_path);

        self.release_cgroup();
        self.done.signal();
    }

    /// Close both sinks exactly once. Failures are logged, never propagated.
    fn close_sinks(&self) {
        if let Some((stdout_sink, stderr_sink)) = lock(&self.sinks).take() {
            for (label, file) in [("stdout", stdout_sink), ("stderr", stderr_sink)] {
                let fd = file.into_raw_fd();
                if unsafe { libc::close(fd) } != 0 {
                    warn!(
                        "job {}: error closing {} sink: {}",
                        self.id,
                        label,
                        io::Error::last_os_error()
                    );
                }
            }
        }
    }

    /// Kernel-level kill of everything in the job's cgroup, leaving the
    /// cgroup itself for teardown.
    fn kill_cgroup(&self) -> Result<()> {
        match lock(&self.cgroup).as_ref() {
            Some(cg) => cg.kill(),
            None => Ok(()),
        }
    }

    /// Delete the cgroup and drop the directory handle.
    fn release_cgroup(&self) {
        if let Some(cg) = lock(&self.cgroup).take()
            && let Err(e) = cg.delete()
        {
            warn!("job {}: failed to clean up cgroup: {}", self.id, e);
        }
    }

    /// Replay the tail of one sink into the service log with framing.
    fn dump_sink(&self, label: &str, path: &Path) {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "job {}: failed to read {} log ({}): {}",
                    self.id,
                    label,
                    path.display(),
                    e
                );
                return;
            }
        };

        let tail = if data.len() > MAX_LOG_DUMP_BYTES {
            info!(
                "job {}: {} log truncated to last {} bytes",
                self.id, label, MAX_LOG_DUMP_BYTES
            );
            &data[data.len() - MAX_LOG_DUMP_BYTES..]
        } else {
            &data[..]
        };

        if tail.is_empty() {
            info!("job {}: {} log empty", self.id, label);
            return;
        }

        info!("job {}: ===== BEGIN {} =====", self.id, label);
        info!("{}", String::from_utf8_lossy(tail));
        info!("job {}: ===== END {} =====", self.id, label);
    }

    fn log_snapshot(&self, pid: i32) {
        let guard = lock(&self.cgroup);
        let Some(cg) = guard.as_ref() else {
            return;
        };
        let snap = cg.snapshot();
        let procs: Vec<i32> = snap.procs.iter().copied().take(4).collect();
        info!(
            "[cgroup] job={} pid={} path={} pids.current={} procs={:?} cpu.max={:?} mem.max={:?} \
             io.max={:?} mem.current={}B cpu.usage_usec={} throttled={} throttled_usec={}",
            self.id,
            pid,
            snap.path.display(),
            snap.pids_current,
            procs,
            snap.cpu_max,
            snap.memory_max,
            snap.io_max,
            snap.memory_current,
            snap.cpu_stat.get("usage_usec").copied().unwrap_or(0),
            snap.cpu_stat.get("nr_throttled").copied().unwrap_or(0),
            snap.cpu_stat.get("throttled_usec").copied().unwrap_or(0),
        );
    }
}

/// Child-side setup, run between fork and exec. Only async-signal-safe
/// calls are allowed here, so everything goes through raw libc.
fn child_setup(cgroup_fd: RawFd, drop_privileges: bool) -> io::Result<()> {
    unsafe {
        // Attach to the job cgroup through the inherited directory handle.
        // Writing "0" to cgroup.procs means "this process", so the program
        // we exec never runs outside its cgroup.
        let fd = libc::openat(
            cgroup_fd,
            c"cgroup.procs".as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wrote = libc::write(fd, b"0".as_ptr().cast(), 1);
        libc::close(fd);
        if wrote != 1 {
            return Err(io::Error::last_os_error());
        }

        // Die with the supervisor.
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
            return Err(io::Error::last_os_error());
        }

        // Own process group, so signaling -pgid reaches all descendants.
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }

        if drop_privileges {
            if libc::setgid(NOBODY_GID) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(NOBODY_UID) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_i32() {
        for status in [
            Status::Unknown,
            Status::Started,
            Status::Running,
            Status::Exited,
            Status::Stopped,
            Status::Failed,
        ] {
            assert_eq!(Status::from_i32(status as i32), status);
        }
        assert_eq!(Status::from_i32(42), Status::Unknown);
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Status::Stopped.to_string(), "stopped");
        assert_eq!(Status::Unknown.to_string(), "unknown");
    }

    #[test]
    fn new_job_rejects_empty_id() {
        let err = Job::new("", "/bin/true", vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("job id required"));
    }

    #[test]
    fn new_job_rejects_unsafe_id() {
        assert!(Job::new("a/b", "/bin/true", vec![], vec![]).is_err());
        assert!(Job::new("..", "/bin/true", vec![], vec![]).is_err());
        assert!(Job::new(".", "/bin/true", vec![], vec![]).is_err());
    }

    #[test]
    fn new_job_rejects_empty_executable() {
        let err = Job::new("job-1", "", vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("executable required"));
    }

    #[test]
    fn new_job_starts_unknown_with_unknown_exit_code() {
        let job = Job::new("job-2", "/bin/true", vec![], vec![]).unwrap();
        assert_eq!(job.status(), Status::Unknown);
        assert_eq!(job.exit_code(), EXIT_CODE_UNKNOWN);
        assert!(!job.is_done());
    }

    #[test]
    fn job_handles_share_one_record() {
        let job = Job::new("job-3", "/bin/true", vec![], vec![]).unwrap();
        let other = job.clone();
        assert_eq!(job.id(), other.id());
        assert_eq!(job.stdout_path(), other.stdout_path());
    }

    #[test]
    fn done_signal_wakes_all_waiters() {
        let signal = Arc::new(DoneSignal::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let signal = Arc::clone(&signal);
            handles.push(thread::spawn(move || signal.wait()));
        }
        signal.signal();
        // Signaling twice is harmless.
        signal.signal();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(signal.is_set());
    }

    #[test]
    fn done_signal_does_not_block_after_set() {
        let signal = DoneSignal::new();
        signal.signal();
        signal.wait();
        signal.wait();
    }
}
