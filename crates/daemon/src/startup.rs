//! Startup checks and preparation for dir_check
//!
//! Runs before the driver loop:
//! - the working directory must exist
//! - the fifo dir, its fifos and the log dir are created
//! - the status tables published by the supervisor are attached
//! - missing source directories are created where configured

use crate::fifo::{ensure_fifos, FIFO_DIR};
use crate::logs::LOG_DIR;
use crate::tables::afd_status::AFD_STATUS_FILE;
use crate::tables::fra::FRA_FILE;
use crate::tables::fsa::FSA_FILE;
use crate::tables::{AfdStatus, AttachRetry, DirEntry, HostEntry, MappedTable, SizePolicy, TableError};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Working directory {0} does not exist")]
    MissingWorkDir(PathBuf),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Failed to prepare {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },

    #[error("Failed to attach status table: {0}")]
    Table(#[from] TableError),

    #[error("Status table {0} holds no record")]
    EmptyStatus(PathBuf),
}

pub fn fifo_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(FIFO_DIR)
}

/// Parse the create-source-dir mode given in octal, e.g. `755` or `0750`.
pub fn parse_octal_mode(s: &str) -> Option<u32> {
    let digits = s.trim();
    if digits.is_empty() {
        return None;
    }
    let mode = u32::from_str_radix(digits, 8).ok()?;
    (mode <= 0o7777).then_some(mode)
}

/// Check that the working directory exists and is a directory
pub fn check_work_dir(work_dir: &Path) -> Result<(), StartupError> {
    match fs::metadata(work_dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StartupError::NotADirectory(work_dir.to_path_buf())),
        Err(_) => Err(StartupError::MissingWorkDir(work_dir.to_path_buf())),
    }
}

/// Create the fifo dir with its fifos and the log dir.
pub fn prepare_dirs(work_dir: &Path) -> Result<(), StartupError> {
    let fifos = fifo_dir(work_dir);
    ensure_fifos(&fifos).map_err(|source| StartupError::Prepare {
        path: fifos.clone(),
        source,
    })?;
    let logs = work_dir.join(LOG_DIR);
    fs::create_dir_all(&logs).map_err(|source| StartupError::Prepare { path: logs, source })
}

/// Run all startup checks in order: work dir, then fifos and log dir.
pub fn run_startup_checks(work_dir: &Path) -> Result<(), StartupError> {
    check_work_dir(work_dir)?;
    prepare_dirs(work_dir)?;
    Ok(())
}

/// The three tables dir_check works on.
#[derive(Debug)]
pub struct StatusTables {
    pub fsa: MappedTable<HostEntry>,
    pub fra: MappedTable<DirEntry>,
    pub status: MappedTable<AfdStatus>,
}

/// Attach FSA, FRA and AFD_STATUS, waiting while the supervisor has not
/// published them yet.
pub fn attach_tables(fifo_dir: &Path, retry: &AttachRetry) -> Result<StatusTables, StartupError> {
    let fsa = MappedTable::attach_with_retry(&fifo_dir.join(FSA_FILE), SizePolicy::Exact, retry)?;
    let fra = MappedTable::attach_with_retry(&fifo_dir.join(FRA_FILE), SizePolicy::Exact, retry)?;
    let status_path = fifo_dir.join(AFD_STATUS_FILE);
    let status = MappedTable::attach_with_retry(&status_path, SizePolicy::Exact, retry)?;
    if status.is_empty() {
        return Err(StartupError::EmptyStatus(status_path));
    }
    info!(hosts = fsa.len(), dirs = fra.len(), "Status tables attached");
    Ok(StatusTables { fsa, fra, status })
}

/// Create missing source directories flagged `CREATE_SOURCE_DIR`.
///
/// Failures are logged; the scanner reports the directory later.
///
/// # Returns
/// The directories that were created.
pub fn create_source_dirs(fra: &MappedTable<DirEntry>, mode: u32) -> Result<Vec<PathBuf>, StartupError> {
    let mut created = Vec::new();
    for dir in fra.records()? {
        if !dir.dir_options.creates_source_dir() || !dir.is_scanned_locally() {
            continue;
        }
        let path = dir.dir_path();
        if path.exists() {
            continue;
        }
        match DirBuilder::new().recursive(true).mode(mode).create(&path) {
            Ok(()) => {
                info!(path = %path.display(), mode = %format!("{:o}", mode), "Created source directory");
                created.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to create source directory"),
        }
    }
    Ok(created)
}

/// Count directories dir_check scans itself.
pub fn local_dir_count(fra: &MappedTable<DirEntry>) -> Result<usize, StartupError> {
    Ok(fra.records()?.iter().filter(|d| d.is_scanned_locally()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::flags::{DirOptions, ProtocolSet};
    use proptest::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_octal_mode_parsing(mode in 0u32..=0o7777) {
            prop_assert_eq!(parse_octal_mode(&format!("{:o}", mode)), Some(mode));
            prop_assert_eq!(parse_octal_mode(&format!("0{:o}", mode)), Some(mode));
        }
    }

    #[test]
    fn test_octal_mode_rejects_garbage() {
        assert_eq!(parse_octal_mode(""), None);
        assert_eq!(parse_octal_mode("789"), None);
        assert_eq!(parse_octal_mode("17777"), None);
        assert_eq!(parse_octal_mode("rwx"), None);
    }

    #[test]
    fn test_missing_work_dir() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        assert!(matches!(check_work_dir(&missing), Err(StartupError::MissingWorkDir(_))));

        let file = temp.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(check_work_dir(&file), Err(StartupError::NotADirectory(_))));
    }

    #[test]
    fn test_startup_checks_prepare_dirs() {
        let temp = TempDir::new().unwrap();
        run_startup_checks(temp.path()).unwrap();
        assert!(fifo_dir(temp.path()).join("dc_cmd").exists());
        assert!(temp.path().join(LOG_DIR).is_dir());
    }

    #[test]
    fn test_attach_requires_published_tables() {
        let temp = TempDir::new().unwrap();
        let retry = AttachRetry {
            attempts: 1,
            ..Default::default()
        };
        let err = attach_tables(temp.path(), &retry).unwrap_err();
        assert!(matches!(err, StartupError::Table(TableError::NotFound { .. })));

        MappedTable::create(&temp.path().join(FSA_FILE), &[HostEntry::new(1, "h", "h")], 0).unwrap();
        MappedTable::<DirEntry>::create(&temp.path().join(FRA_FILE), &[], 0).unwrap();
        MappedTable::create(&temp.path().join(AFD_STATUS_FILE), &[AfdStatus::default()], 0).unwrap();
        let tables = attach_tables(temp.path(), &retry).unwrap();
        assert_eq!(tables.fsa.len(), 1);
        assert!(tables.fra.is_empty());
    }

    #[test]
    fn test_create_source_dirs_with_mode() {
        let temp = TempDir::new().unwrap();
        let wanted = temp.path().join("a/b");
        let skipped = temp.path().join("c");
        let remote = temp.path().join("r");
        let mut d1 = DirEntry::new(1, "a", &wanted);
        d1.dir_options = DirOptions::CREATE_SOURCE_DIR;
        let d2 = DirEntry::new(2, "c", &skipped);
        let mut d3 = DirEntry::new(3, "r", &remote);
        d3.dir_options = DirOptions::CREATE_SOURCE_DIR;
        d3.protocol = ProtocolSet::FTP;
        let fra = MappedTable::create(&temp.path().join(FRA_FILE), &[d1, d2, d3], 0).unwrap();

        let created = create_source_dirs(&fra, 0o750).unwrap();
        assert_eq!(created, vec![wanted.clone()]);
        assert!(!skipped.exists());
        assert!(!remote.exists());
        let mode = fs::metadata(&wanted).unwrap().permissions().mode() & 0o777;
        // umask may only clear bits
        assert_eq!(mode & !0o750, 0);
        assert_eq!(local_dir_count(&fra).unwrap(), 2);
    }
}
