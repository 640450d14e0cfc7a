//! Worker processes launched by dir_check, one per batch.
//!
//! Workers are separate `dc_worker` processes. The pool tracks their pids,
//! deadlines and the batch each one carries; the process list and FRA
//! counters are maintained by the driver.

use crate::jobs::Job;
use crate::selection::SelectedFile;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A batch handed to a running worker.
#[derive(Debug)]
pub struct RunningBatch {
    pub pid: i32,
    pub job: Arc<Job>,
    pub fra_pos: usize,
    pub unique: u32,
    pub creation_time: i64,
    pub source_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub manifest: PathBuf,
    pub files: Vec<SelectedFile>,
    pub deadline: Option<Instant>,
    child: Option<Child>,
}

impl RunningBatch {
    pub fn is_adopted(&self) -> bool {
        self.child.is_none()
    }
}

/// What the driver knows about a batch when it launches a worker.
#[derive(Debug)]
pub struct Launch {
    pub job: Arc<Job>,
    pub fra_pos: usize,
    pub unique: u32,
    pub creation_time: i64,
    pub source_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub manifest: PathBuf,
    pub files: Vec<SelectedFile>,
    pub timeout: Option<Duration>,
}

/// Why a worker left without a usable finish message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    /// Exited without reporting; carries the exit code if any.
    Vanished(Option<i32>),
}

/// Whether a pid names a live process.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Launch the worker program with a manifest path.
///
/// # Arguments
/// * `program` - Path of the `dc_worker` binary
/// * `manifest` - Manifest describing the batch
/// * `nice` - Niceness applied in the child before exec
pub fn spawn_worker(program: &Path, manifest: &Path, nice: Option<i32>) -> io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.arg(manifest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);
    if let Some(nice) = nice {
        // SAFETY: setpriority is async-signal-safe and touches no state of
        // the parent.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpriority(libc::PRIO_PROCESS, 0, nice) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    cmd.spawn()
}

#[derive(Debug, Default)]
pub struct WorkerPool {
    running: HashMap<i32, RunningBatch>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.running.contains_key(&pid)
    }

    pub fn get(&self, pid: i32) -> Option<&RunningBatch> {
        self.running.get(&pid)
    }

    pub fn batches(&self) -> impl Iterator<Item = &RunningBatch> {
        self.running.values()
    }

    /// Track a freshly spawned worker; `None` if it already exited.
    pub fn insert(&mut self, child: Child, launch: Launch) -> Option<i32> {
        let pid = child.id()? as i32;
        let deadline = launch.timeout.map(|t| Instant::now() + t);
        self.running.insert(
            pid,
            RunningBatch {
                pid,
                job: launch.job,
                fra_pos: launch.fra_pos,
                unique: launch.unique,
                creation_time: launch.creation_time,
                source_dir: launch.source_dir,
                stage_dir: launch.stage_dir,
                manifest: launch.manifest,
                files: launch.files,
                deadline,
                child: Some(child),
            },
        );
        Some(pid)
    }

    /// Track a worker left over from a previous dir_check.
    pub fn adopt(&mut self, pid: i32, job: Arc<Job>, fra_pos: usize, unique: u32, work_dir: &Path) {
        let stage_dir = crate::worker::stage_dir(work_dir, job.job_id, unique);
        self.running.insert(
            pid,
            RunningBatch {
                pid,
                fra_pos,
                unique,
                creation_time: 0,
                source_dir: PathBuf::new(),
                manifest: PathBuf::new(),
                stage_dir,
                job,
                files: Vec::new(),
                deadline: None,
                child: None,
            },
        );
    }

    /// Remove a worker after its finish message or fault.
    pub fn remove(&mut self, pid: i32) -> Option<RunningBatch> {
        self.running.remove(&pid)
    }

    /// Earliest pending deadline, for the driver's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.running.values().filter_map(|b| b.deadline).min()
    }

    /// Kill workers past their deadline and return their pids.
    pub fn kill_expired(&mut self, now: Instant) -> Vec<i32> {
        let expired: Vec<i32> = self
            .running
            .values()
            .filter(|b| b.deadline.is_some_and(|d| d <= now))
            .map(|b| b.pid)
            .collect();
        for &pid in &expired {
            warn!(pid, "Worker exceeded its timeout, killing");
            self.terminate(pid, Signal::SIGKILL);
        }
        expired
    }

    /// Pids of workers that exited (own children) or vanished (adopted
    /// orphans) without being removed yet.
    pub fn exited(&mut self) -> Vec<(i32, Option<i32>)> {
        let mut gone = Vec::new();
        for batch in self.running.values_mut() {
            match batch.child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => gone.push((batch.pid, status.code())),
                    Ok(None) => {}
                    Err(e) => debug!(pid = batch.pid, error = %e, "try_wait failed"),
                },
                None => {
                    if !process_exists(batch.pid) {
                        gone.push((batch.pid, None));
                    }
                }
            }
        }
        gone
    }

    /// Send a signal to one worker.
    pub fn terminate(&mut self, pid: i32, signal: Signal) {
        if let Err(e) = kill(Pid::from_raw(pid), signal) {
            if e != Errno::ESRCH {
                warn!(pid, error = %e, "Failed to signal worker");
            }
        }
    }

    /// Signal every worker, e.g. at shutdown.
    pub fn terminate_all(&mut self, signal: Signal) {
        let pids: Vec<i32> = self.running.keys().copied().collect();
        for pid in pids {
            self.terminate(pid, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::job;

    fn sh(script: &str) -> Child {
        Command::new("/bin/sh").arg("-c").arg(script).spawn().unwrap()
    }

    fn track(pool: &mut WorkerPool, child: Child, timeout: Option<Duration>) -> i32 {
        let launch = Launch {
            job: job(1, &["*"]),
            fra_pos: 0,
            unique: 1,
            creation_time: 0,
            source_dir: PathBuf::from("/in"),
            stage_dir: PathBuf::from("/stage"),
            manifest: PathBuf::from("/m.json"),
            files: Vec::new(),
            timeout,
        };
        pool.insert(child, launch).unwrap()
    }

    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id() as i32));
        assert!(!process_exists(0));
        assert!(!process_exists(-1));
    }

    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let mut pool = WorkerPool::new();
        let pid = track(&mut pool, sh("sleep 5"), Some(Duration::from_millis(50)));
        assert!(pool.next_deadline().is_some());
        assert!(pool.kill_expired(Instant::now()).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.kill_expired(Instant::now()), vec![pid]);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = Vec::new();
        while exited.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            exited = pool.exited();
        }
        assert_eq!(exited, vec![(pid, None)]);
        assert!(pool.remove(pid).is_some());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let mut pool = WorkerPool::new();
        let pid = track(&mut pool, sh("exit 3"), None);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = Vec::new();
        while exited.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            exited = pool.exited();
        }
        assert_eq!(exited, vec![(pid, Some(3))]);
    }

    #[tokio::test]
    async fn test_spawn_with_nice() {
        let child = spawn_worker(Path::new("/bin/true"), Path::new("/dev/null"), Some(10)).unwrap();
        let status = child.wait_with_output().await.unwrap().status;
        assert!(status.success());
    }

    #[test]
    fn test_adopted_orphan_vanishes() {
        let mut pool = WorkerPool::new();
        let temp = tempfile::TempDir::new().unwrap();
        // a pid that is very unlikely to exist
        pool.adopt(i32::MAX - 1, job(1, &["*"]), 0, 5, temp.path());
        assert!(pool.get(i32::MAX - 1).unwrap().is_adopted());
        assert_eq!(pool.exited(), vec![(i32::MAX - 1, None)]);
    }
}
