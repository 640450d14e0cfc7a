//! System-data checkpoint: long-lived counters written at orderly
//! shutdown and read back at startup.
//!
//! The file is plain text, one `KEY|VALUE` pair per line. Lines starting
//! with `#` are comments; they are kept and written back verbatim.

use crate::tables::afd_status::{AfdStatus, CpuTime, LogKind, LogRing, LogSign, LOG_FIFO_SIZE, MAX_LOG_HISTORY};
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const SYSTEM_DATA_FILE: &str = "system_data";

#[derive(Debug, Error)]
pub enum SystemDataError {
    #[error("Failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemData {
    pub fsa_feature_flag: u8,
    pub fra_feature_flag: u8,
    pub amg_fork_counter: u32,
    pub fd_fork_counter: u32,
    pub burst2_counter: u32,
    pub max_fd_queue_length: u32,
    pub dirs_scanned: u32,
    pub inotify_events: u32,
    /// Rings are checkpointed without their in-progress `current` sign.
    pub receive_log: LogRing,
    pub system_log: LogRing,
    pub transfer_log: LogRing,
    pub amg_child_utime: CpuTime,
    pub amg_child_stime: CpuTime,
    pub fd_child_utime: CpuTime,
    pub fd_child_stime: CpuTime,
    pub comments: Vec<String>,
}

fn ring_prefix(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Receive => "RECEIVE_LOG",
        LogKind::System => "SYSTEM_LOG",
        LogKind::Transfer => "TRANSFER_LOG",
    }
}

fn signs_to_string(signs: &[LogSign]) -> String {
    signs.iter().map(|s| s.as_char()).collect()
}

/// Parse exactly `N` signs valid for the given log.
fn parse_signs<const N: usize>(value: &str, kind: LogKind) -> Option<[LogSign; N]> {
    let signs: Vec<LogSign> = value
        .chars()
        .map(LogSign::from_char)
        .collect::<Option<Vec<_>>>()?;
    if signs.len() != N || !signs.iter().all(|&s| kind.accepts(s)) {
        return None;
    }
    signs.try_into().ok()
}

fn parse_cpu_time(value: &str) -> Option<CpuTime> {
    let (sec, usec) = value.split_once('.')?;
    let usec: i64 = usec.parse().ok()?;
    if !(0..1_000_000).contains(&usec) {
        return None;
    }
    Some(CpuTime {
        sec: sec.parse().ok()?,
        usec,
    })
}

impl SystemData {
    /// Snapshot of the shared status plus the table feature flags.
    pub fn capture(status: &AfdStatus, fsa_feature_flag: u8, fra_feature_flag: u8) -> Self {
        let strip = |ring: &LogRing| LogRing {
            current: LogSign::Unknown,
            ..ring.clone()
        };
        Self {
            fsa_feature_flag,
            fra_feature_flag,
            amg_fork_counter: status.amg_fork_counter,
            fd_fork_counter: status.fd_fork_counter,
            burst2_counter: status.burst2_counter,
            max_fd_queue_length: status.max_queue_length,
            dirs_scanned: status.dir_scans,
            inotify_events: status.inotify_events,
            receive_log: strip(&status.receive_log),
            system_log: strip(&status.system_log),
            transfer_log: strip(&status.transfer_log),
            amg_child_utime: status.amg_child_utime,
            amg_child_stime: status.amg_child_stime,
            fd_child_utime: status.fd_child_utime,
            fd_child_stime: status.fd_child_stime,
            comments: Vec::new(),
        }
    }

    /// Restore the counters into the shared status.
    pub fn apply(&self, status: &mut AfdStatus) {
        status.amg_fork_counter = self.amg_fork_counter;
        status.fd_fork_counter = self.fd_fork_counter;
        status.burst2_counter = self.burst2_counter;
        status.max_queue_length = self.max_fd_queue_length;
        status.dir_scans = self.dirs_scanned;
        status.inotify_events = self.inotify_events;
        status.receive_log = self.receive_log.clone();
        status.system_log = self.system_log.clone();
        status.transfer_log = self.transfer_log.clone();
        status.amg_child_utime = self.amg_child_utime;
        status.amg_child_stime = self.amg_child_stime;
        status.fd_child_utime = self.fd_child_utime;
        status.fd_child_stime = self.fd_child_stime;
    }

    fn ring(&self, kind: LogKind) -> &LogRing {
        match kind {
            LogKind::Receive => &self.receive_log,
            LogKind::System => &self.system_log,
            LogKind::Transfer => &self.transfer_log,
        }
    }

    fn ring_mut(&mut self, kind: LogKind) -> &mut LogRing {
        match kind {
            LogKind::Receive => &mut self.receive_log,
            LogKind::System => &mut self.system_log,
            LogKind::Transfer => &mut self.transfer_log,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for comment in &self.comments {
            let _ = writeln!(out, "{}", comment);
        }
        let _ = writeln!(out, "FSA_FEATURE_FLAG|{}", self.fsa_feature_flag);
        let _ = writeln!(out, "FRA_FEATURE_FLAG|{}", self.fra_feature_flag);
        let _ = writeln!(out, "AMG_FORK_COUNTER|{}", self.amg_fork_counter);
        let _ = writeln!(out, "FD_FORK_COUNTER|{}", self.fd_fork_counter);
        let _ = writeln!(out, "BURST2_COUNTER|{}", self.burst2_counter);
        let _ = writeln!(out, "MAX_FD_QUEUE_LENGTH|{}", self.max_fd_queue_length);
        let _ = writeln!(out, "DIRS_SCANNED|{}", self.dirs_scanned);
        let _ = writeln!(out, "INOTIFY_EVENTS|{}", self.inotify_events);
        for kind in [LogKind::Receive, LogKind::System, LogKind::Transfer] {
            let ring = self.ring(kind);
            let prefix = ring_prefix(kind);
            let _ = writeln!(
                out,
                "{}_INDICATOR|{}|{}",
                prefix,
                ring.counter,
                signs_to_string(&ring.fifo)
            );
            let _ = writeln!(out, "{}_HISTORY|{}", prefix, signs_to_string(&ring.history));
        }
        for (key, t) in [
            ("AMG_CHILD_USER_TIME", self.amg_child_utime),
            ("AMG_CHILD_SYSTEM_TIME", self.amg_child_stime),
            ("FD_CHILD_USER_TIME", self.fd_child_utime),
            ("FD_CHILD_SYSTEM_TIME", self.fd_child_stime),
        ] {
            let _ = writeln!(out, "{}|{}.{:06}", key, t.sec, t.usec);
        }
        out
    }

    /// Parse a checkpoint. Unknown keys and malformed values are logged
    /// and skipped.
    pub fn parse(content: &str) -> Self {
        let mut data = Self::default();
        for (idx, line) in content.lines().enumerate() {
            if line.starts_with('#') {
                data.comments.push(line.to_string());
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('|') else {
                warn!(line = idx + 1, "Checkpoint line without separator, skipped");
                continue;
            };
            if !data.set(key, value) {
                warn!(line = idx + 1, key, value, "Unknown or malformed checkpoint entry, skipped");
            }
        }
        data
    }

    fn set(&mut self, key: &str, value: &str) -> bool {
        let counter = |slot: &mut u32| value.parse().map(|v| *slot = v).is_ok();
        match key {
            "FSA_FEATURE_FLAG" => value.parse().map(|v| self.fsa_feature_flag = v).is_ok(),
            "FRA_FEATURE_FLAG" => value.parse().map(|v| self.fra_feature_flag = v).is_ok(),
            "AMG_FORK_COUNTER" => counter(&mut self.amg_fork_counter),
            "FD_FORK_COUNTER" => counter(&mut self.fd_fork_counter),
            "BURST2_COUNTER" => counter(&mut self.burst2_counter),
            "MAX_FD_QUEUE_LENGTH" => counter(&mut self.max_fd_queue_length),
            "DIRS_SCANNED" => counter(&mut self.dirs_scanned),
            "INOTIFY_EVENTS" => counter(&mut self.inotify_events),
            "AMG_CHILD_USER_TIME" => parse_cpu_time(value).map(|t| self.amg_child_utime = t).is_some(),
            "AMG_CHILD_SYSTEM_TIME" => parse_cpu_time(value).map(|t| self.amg_child_stime = t).is_some(),
            "FD_CHILD_USER_TIME" => parse_cpu_time(value).map(|t| self.fd_child_utime = t).is_some(),
            "FD_CHILD_SYSTEM_TIME" => parse_cpu_time(value).map(|t| self.fd_child_stime = t).is_some(),
            _ => self.set_ring(key, value),
        }
    }

    fn set_ring(&mut self, key: &str, value: &str) -> bool {
        for kind in [LogKind::Receive, LogKind::System, LogKind::Transfer] {
            let Some(field) = key
                .strip_prefix(ring_prefix(kind))
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                continue;
            };
            return match field {
                "INDICATOR" => {
                    let Some((counter, fifo)) = value.split_once('|') else {
                        return false;
                    };
                    match (counter.parse(), parse_signs::<LOG_FIFO_SIZE>(fifo, kind)) {
                        (Ok(counter), Some(fifo)) => {
                            let ring = self.ring_mut(kind);
                            ring.counter = counter;
                            ring.fifo = fifo;
                            true
                        }
                        _ => false,
                    }
                }
                "HISTORY" => match parse_signs::<MAX_LOG_HISTORY>(value, kind) {
                    Some(history) => {
                        self.ring_mut(kind).history = history;
                        true
                    }
                    None => false,
                },
                _ => false,
            };
        }
        false
    }

    /// Read the checkpoint; a missing file gives the defaults.
    pub fn read(path: &Path) -> Result<Self, SystemDataError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(SystemDataError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write the checkpoint through a temporary file and rename.
    pub fn write(&self, path: &Path) -> Result<(), SystemDataError> {
        let tmp = path.with_extension("tmp");
        let io_err = |source| SystemDataError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(self.encode().as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }
}
