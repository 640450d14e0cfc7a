//! Dispatch planning for batch workers.
//!
//! Derives the worker limits and niceness from configuration and decides
//! whether one more worker may start for a given directory and host.

use crate::jobs::Job;
use crate::tables::fra::DirEntry;
use crate::tables::fsa::HostEntry;
use afd_config::DirCheckConfig;
use std::time::Duration;

/// Worker limits derived from configuration and the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    /// Upper bound of concurrently running workers.
    pub max_process: usize,
    /// Default worker timeout; `None` disables it.
    pub exec_timeout: Option<Duration>,
    pub base_priority: Option<i32>,
    pub add_afd_priority: bool,
    pub min_nice: i32,
    pub max_nice: i32,
}

/// Why a batch cannot start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Ready,
    /// The process list is full.
    TableFull,
    /// The directory reached its own worker cap.
    DirCapReached,
    /// The target host is unknown or disabled.
    HostUnavailable,
}

impl DispatchPlan {
    /// Derive a plan from configuration
    ///
    /// Uses the following rules:
    /// - `EXEC_TIMEOUT` of 0 disables the timeout
    /// - niceness only applies when `EXEC_BASE_PRIORITY` is set
    pub fn derive(cfg: &DirCheckConfig, max_process: usize) -> Self {
        Self {
            max_process,
            exec_timeout: secs(cfg.exec_timeout),
            base_priority: cfg.exec_base_priority,
            add_afd_priority: cfg.add_afd_priority,
            min_nice: cfg.min_nice_value.min(cfg.max_nice_value),
            max_nice: cfg.max_nice_value.max(cfg.min_nice_value),
        }
    }

    /// Niceness for a worker of a job with the given priority digit.
    pub fn nice_value(&self, job_priority: u8) -> Option<i32> {
        let base = self.base_priority?;
        let value = if self.add_afd_priority {
            base + job_priority as i32
        } else {
            base
        };
        Some(clamp_nice(value, self.min_nice, self.max_nice))
    }

    /// Timeout for one job: its `exec-timeout` option, else the default.
    pub fn exec_timeout_for(&self, job: &Job) -> Option<Duration> {
        match job.local_options.exec_timeout {
            Some(t) => secs(t),
            None => self.exec_timeout,
        }
    }

    /// Decide whether one more worker may start.
    ///
    /// # Arguments
    /// * `running` - Workers currently in the process list
    /// * `dir` - FRA entry of the batch's directory
    /// * `host` - FSA entry of the batch's host, if attachable
    pub fn check(&self, running: usize, dir: &DirEntry, host: Option<&HostEntry>) -> Eligibility {
        if running >= self.max_process {
            return Eligibility::TableFull;
        }
        if !dir.has_process_room() {
            return Eligibility::DirCapReached;
        }
        match host {
            Some(h) if h.accepts_batches() => Eligibility::Ready,
            _ => Eligibility::HostUnavailable,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Clamp a niceness to `[min, max]`
fn clamp_nice(value: i32, min: i32, max: i32) -> i32 {
    value.clamp(min, max)
}
