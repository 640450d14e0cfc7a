//! Batch worker: the body of the `dc_worker` process.
//!
//! dir_check writes a JSON manifest describing one batch and launches the
//! worker with the manifest path. The worker stages each file into the
//! batch's outgoing directory, logs it to the production log and reports
//! to `ip_fin` with one finish message.

use crate::logs::production::{ProductionLog, ProductionRecord};
use crate::logs::LOG_DIR;
use crate::message::FinishMessage;
use crate::options::CaseChange;
use crate::rules::{RuleError, RuleSet};
use crate::tables::CpuTime;
use nix::sys::resource::{getrusage, UsageWho};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const OUTGOING_DIR: &str = "files/outgoing";
pub const ETC_DIR: &str = "etc";

/// Return code logged for files of a batch whose worker was killed.
pub const RC_TIMEOUT: i32 = libc::ETIMEDOUT;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to read manifest {path}: {source}")]
    ManifestIo { path: PathBuf, source: io::Error },

    #[error("Malformed manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to create stage directory {path}: {source}")]
    StageDir { path: PathBuf, source: io::Error },

    #[error("Failed to write to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Rules(#[from] RuleError),
}

/// How a file leaves the source directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    /// Rename, copy and unlink across filesystems.
    Move,
    /// Hard link, copy across filesystems; the source stays for other jobs.
    Link,
}

impl StageMode {
    /// Command recorded in the production log.
    pub fn command(self) -> &'static str {
        match self {
            StageMode::Move => "move",
            StageMode::Link => "link",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    pub mode: StageMode,
}

/// Everything a worker needs to stage one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerManifest {
    pub work_dir: PathBuf,
    pub source_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub fin_fifo: PathBuf,
    pub job_id: u32,
    pub dir_id: u32,
    pub unique: u32,
    pub split: u32,
    pub input_time: i64,
    #[serde(default)]
    pub rename_rule: Option<String>,
    #[serde(default)]
    pub rule_files: Vec<String>,
    #[serde(default)]
    pub case: Option<CaseChange>,
    pub files: Vec<ManifestFile>,
}

impl WorkerManifest {
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let file = File::open(path).map_err(|source| WorkerError::ManifestIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| WorkerError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the manifest next to the stage directory.
    pub fn store(&self, path: &Path) -> Result<(), WorkerError> {
        let io_err = |source| WorkerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        let json = serde_json::to_vec(self).map_err(|source| WorkerError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        file.write_all(&json).map_err(io_err)
    }
}

/// Stage directory of one batch.
pub fn stage_dir(work_dir: &Path, job_id: u32, unique: u32) -> PathBuf {
    work_dir
        .join(OUTGOING_DIR)
        .join(format!("{:x}", job_id))
        .join(format!("{:x}", unique))
}

/// Outcome of staging one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub new_name: String,
    pub new_size: u64,
    pub rc: i32,
    pub command: &'static str,
}

/// Move or link `src` to `dst`, falling back to a copy across filesystems.
pub fn stage_file(src: &Path, dst: &Path, mode: StageMode) -> io::Result<&'static str> {
    let first = match mode {
        StageMode::Move => fs::rename(src, dst),
        StageMode::Link => fs::hard_link(src, dst),
    };
    match first {
        Ok(()) => Ok(mode.command()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(src = %src.display(), "Cross-device, copying");
            fs::copy(src, dst)?;
            if mode == StageMode::Move {
                fs::remove_file(src)?;
            }
            Ok("copy")
        }
        Err(e) => Err(e),
    }
}

fn cpu_time() -> Option<CpuTime> {
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let mut total = CpuTime {
        sec: usage.user_time().tv_sec() as i64,
        usec: usage.user_time().tv_usec() as i64,
    };
    total.add(CpuTime {
        sec: usage.system_time().tv_sec() as i64,
        usec: usage.system_time().tv_usec() as i64,
    });
    Some(total)
}

/// Stage every file of the manifest.
///
/// # Returns
/// The finish message to send; `rc` is the first non-zero per-file code.
pub fn run_batch(manifest: &WorkerManifest, now: i64) -> Result<FinishMessage, WorkerError> {
    fs::create_dir_all(&manifest.stage_dir).map_err(|source| WorkerError::StageDir {
        path: manifest.stage_dir.clone(),
        source,
    })?;

    let rules = match &manifest.rename_rule {
        Some(_) => {
            let extra: Vec<&str> = manifest.rule_files.iter().map(String::as_str).collect();
            RuleSet::load(&manifest.work_dir.join(ETC_DIR), &extra)?
        }
        None => RuleSet::default(),
    };

    let log_dir = manifest.work_dir.join(LOG_DIR);
    let mut log = ProductionLog::open(&log_dir).map_err(|source| WorkerError::Io {
        path: log_dir.clone(),
        source,
    })?;

    let mut finish = FinishMessage {
        pid: std::process::id() as i32,
        files: 0,
        rc: 0,
        bytes: 0,
    };

    for file in &manifest.files {
        let staged = stage_one(manifest, &rules, file);
        if staged.rc == 0 {
            finish.files += 1;
            finish.bytes += staged.new_size;
        } else if finish.rc == 0 {
            finish.rc = staged.rc;
        }

        let record = ProductionRecord {
            time: now,
            ratio: (1, 1),
            cpu: cpu_time(),
            input_time: manifest.input_time,
            unique: manifest.unique,
            split: manifest.split,
            dir_id: manifest.dir_id,
            job_id: manifest.job_id,
            orig_name: file.name.clone(),
            orig_size: file.size,
            new_name: staged.new_name,
            new_size: staged.new_size,
            rc: staged.rc,
            command: staged.command.to_string(),
        };
        log.write(&record).map_err(|source| WorkerError::Io {
            path: log.path().to_path_buf(),
            source,
        })?;
    }

    Ok(finish)
}

fn stage_one(manifest: &WorkerManifest, rules: &RuleSet, file: &ManifestFile) -> StagedFile {
    let mut new_name = match &manifest.rename_rule {
        Some(rule) => rules.rename(rule, &file.name, manifest.unique),
        None => file.name.clone(),
    };
    if let Some(case) = manifest.case {
        new_name = case.apply(&new_name);
    }

    let src = manifest.source_dir.join(&file.name);
    let dst = manifest.stage_dir.join(&new_name);
    // two names renamed onto one; the later file waits for the next batch
    let staged = if fs::symlink_metadata(&dst).is_ok() {
        Err(io::Error::from_raw_os_error(libc::EEXIST))
    } else {
        stage_file(&src, &dst, file.mode)
    };
    match staged {
        Ok(command) => {
            let new_size = fs::metadata(&dst).map(|m| m.len()).unwrap_or(file.size);
            StagedFile {
                new_name,
                new_size,
                rc: 0,
                command,
            }
        }
        Err(e) => {
            warn!(src = %src.display(), dst = %dst.display(), error = %e, "Failed to stage file");
            StagedFile {
                new_name: String::new(),
                new_size: 0,
                rc: e.raw_os_error().unwrap_or(libc::EIO),
                command: file.mode.command(),
            }
        }
    }
}

/// Send the finish message; one write below PIPE_BUF is atomic.
pub fn report(fin_fifo: &Path, msg: &FinishMessage) -> io::Result<()> {
    let mut fifo = OpenOptions::new().write(true).open(fin_fifo)?;
    fifo.write_all(&msg.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::record_lines;
    use crate::message::FINISH_MESSAGE_SIZE;
    use std::io::Read;
    use tempfile::TempDir;

    fn manifest(work: &Path, files: Vec<ManifestFile>) -> WorkerManifest {
        let source_dir = work.join("in");
        WorkerManifest {
            work_dir: work.to_path_buf(),
            stage_dir: stage_dir(work, 0xabc, 7),
            fin_fifo: work.join("ip_fin"),
            source_dir,
            job_id: 0xabc,
            dir_id: 0x10,
            unique: 7,
            split: 0,
            input_time: 100,
            rename_rule: None,
            rule_files: Vec::new(),
            case: None,
            files,
        }
    }

    fn file(name: &str, size: u64, mode: StageMode) -> ManifestFile {
        ManifestFile {
            name: name.to_string(),
            size,
            mode,
        }
    }

    #[test]
    fn test_stage_dir_layout() {
        assert_eq!(
            stage_dir(Path::new("/w"), 0xabc, 0x1f),
            PathBuf::from("/w/files/outgoing/abc/1f")
        );
    }

    #[test]
    fn test_batch_moves_and_logs() {
        let temp = TempDir::new().unwrap();
        let m = manifest(temp.path(), vec![file("a.txt", 5, StageMode::Move)]);
        fs::create_dir_all(&m.source_dir).unwrap();
        fs::write(m.source_dir.join("a.txt"), b"hello").unwrap();

        let fin = run_batch(&m, 200).unwrap();
        assert_eq!((fin.files, fin.bytes, fin.rc), (1, 5, 0));
        assert!(m.stage_dir.join("a.txt").exists());
        assert!(!m.source_dir.join("a.txt").exists());

        let log = fs::read_to_string(temp.path().join(LOG_DIR).join("PRODUCTION_LOG")).unwrap();
        let line = record_lines(&log).next().unwrap();
        let (_, rec) = ProductionRecord::parse(line).unwrap();
        assert_eq!(rec.orig_name, "a.txt");
        assert_eq!(rec.new_name, "a.txt");
        assert_eq!((rec.orig_size, rec.new_size, rec.rc), (5, 5, 0));
        assert!(rec.cpu.is_some());
    }

    #[test]
    fn test_link_keeps_source_and_rename_rule_applies() {
        let temp = TempDir::new().unwrap();
        let mut m = manifest(temp.path(), vec![file("data.txt", 2, StageMode::Link)]);
        m.rename_rule = Some("out".to_string());
        m.case = Some(CaseChange::Upper);
        fs::create_dir_all(temp.path().join(ETC_DIR)).unwrap();
        fs::write(temp.path().join(ETC_DIR).join("rename.rule"), "[out]\n*.txt  %*1_%n.txt\n").unwrap();
        fs::create_dir_all(&m.source_dir).unwrap();
        fs::write(m.source_dir.join("data.txt"), b"xy").unwrap();

        let fin = run_batch(&m, 200).unwrap();
        assert_eq!(fin.files, 1);
        assert!(m.source_dir.join("data.txt").exists());
        assert!(m.stage_dir.join("DATA_7.TXT").exists());
    }

    #[test]
    fn test_missing_source_gives_nonzero_rc() {
        let temp = TempDir::new().unwrap();
        let m = manifest(
            temp.path(),
            vec![file("gone", 1, StageMode::Move), file("here", 1, StageMode::Move)],
        );
        fs::create_dir_all(&m.source_dir).unwrap();
        fs::write(m.source_dir.join("here"), b"x").unwrap();

        let fin = run_batch(&m, 200).unwrap();
        assert_eq!(fin.files, 1);
        assert_eq!(fin.rc, libc::ENOENT);
    }

    #[test]
    fn test_rename_collision_keeps_first_file() {
        let temp = TempDir::new().unwrap();
        let mut m = manifest(
            temp.path(),
            vec![file("a.txt", 1, StageMode::Link), file("A.TXT", 2, StageMode::Link)],
        );
        m.case = Some(CaseChange::Upper);
        fs::create_dir_all(&m.source_dir).unwrap();
        fs::write(m.source_dir.join("a.txt"), b"1").unwrap();
        fs::write(m.source_dir.join("A.TXT"), b"22").unwrap();

        let fin = run_batch(&m, 200).unwrap();
        assert_eq!(fin.files, 1);
        assert_eq!(fin.rc, libc::EEXIST);
        assert_eq!(fs::read(m.stage_dir.join("A.TXT")).unwrap(), b"1");
        assert!(m.source_dir.join("A.TXT").exists());

        let log = fs::read_to_string(temp.path().join(LOG_DIR).join("PRODUCTION_LOG")).unwrap();
        let failed: Vec<ProductionRecord> = record_lines(&log)
            .filter_map(|l| ProductionRecord::parse(l).ok())
            .map(|(_, r)| r)
            .filter(|r| r.rc != 0)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].orig_name, "A.TXT");
        assert_eq!(failed[0].command, "link");
    }

    #[test]
    fn test_manifest_store_and_load() {
        let temp = TempDir::new().unwrap();
        let m = manifest(temp.path(), vec![file("a", 1, StageMode::Link)]);
        let path = temp.path().join("batch.json");
        m.store(&path).unwrap();
        assert_eq!(WorkerManifest::load(&path).unwrap(), m);
        assert!(matches!(
            WorkerManifest::load(&temp.path().join("none.json")),
            Err(WorkerError::ManifestIo { .. })
        ));
    }

    #[test]
    fn test_report_writes_one_frame() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ip_fin");
        // a regular file stands in for the fifo
        File::create(&path).unwrap();
        let msg = FinishMessage {
            pid: 42,
            files: 1,
            rc: 0,
            bytes: 5,
        };
        report(&path, &msg).unwrap();
        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), FINISH_MESSAGE_SIZE);
        assert_eq!(FinishMessage::decode(&buf).unwrap(), msg);
    }
}
