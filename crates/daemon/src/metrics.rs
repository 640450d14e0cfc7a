//! Counters and queue snapshots of a running dir_check.
//!
//! The snapshot is what an operator sees after asking through
//! `queue_list_ready`: pending batches, running workers and totals,
//! serialized as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Running totals since start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirCheckStats {
    pub dirs_scanned: u64,
    pub files_found: u64,
    pub bytes_found: u64,
    pub files_deleted: u64,
    pub batches_queued: u64,
    pub batches_dispatched: u64,
    pub batches_completed: u64,
    pub batches_faulty: u64,
    pub messages_sent: u64,
}

/// A batch waiting for a free worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedBatch {
    pub job_id: u32,
    pub dir_alias: String,
    pub unique: u32,
    pub files: usize,
    pub bytes: u64,
    pub creation_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningWorker {
    pub pid: i32,
    pub job_id: u32,
    pub fra_pos: usize,
    pub unique: u32,
    pub files: usize,
    pub adopted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub timestamp: i64,
    pub pending: Vec<QueuedBatch>,
    pub running: Vec<RunningWorker>,
    pub stats: DirCheckStats,
}

impl QueueSnapshot {
    /// Write the snapshot as JSON through a temporary file.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = QueueSnapshot {
            timestamp: 1_700_000_000,
            pending: vec![QueuedBatch {
                job_id: 0xabc,
                dir_alias: "in".into(),
                unique: 3,
                files: 2,
                bytes: 10,
                creation_time: 1_700_000_000,
            }],
            running: vec![RunningWorker {
                pid: 42,
                job_id: 0xdef,
                fra_pos: 0,
                unique: 4,
                files: 1,
                adopted: true,
            }],
            stats: DirCheckStats {
                batches_dispatched: 1,
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"pending\""));
        assert!(json.contains("\"adopted\":true"));
        assert!(json.contains("\"batches_dispatched\":1"));

        let parsed: QueueSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_write_replaces_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue_list");
        QueueSnapshot::default().write(&path).unwrap();
        let snapshot = QueueSnapshot {
            timestamp: 5,
            ..Default::default()
        };
        snapshot.write(&path).unwrap();
        let parsed: QueueSnapshot = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.timestamp, 5);
        assert!(!path.with_extension("tmp").exists());
    }
}
