//! Directory scanner.
//!
//! One call reads one watched directory (no recursion) into a bounded
//! [`FilePool`], skipping locked, unwanted, unsettled and in-flight files.

use crate::filter::{FileMasks, LockedFilter};
use crate::pool::{FilePool, PushResult};
use crate::stability::SizeTracker;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use walkdir::WalkDir;

/// Longest file name accepted, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Failed to access directory {0}: permission denied")]
    PermissionDenied(PathBuf),

    #[error("Directory {0} does not exist")]
    Vanished(PathBuf),

    #[error("Failed to read directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why an entry was left in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Locked,
    /// No job of the directory wants the file.
    Unmatched,
    Unstable,
    NameTooLong,
    InFlight,
}

/// Bounds of one directory scan.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Pool capacity (`max_copied_files`).
    pub max_files: usize,
    /// Scan budget; entries after it are left for the next tick.
    pub deadline: Option<Instant>,
    /// Stability window in seconds.
    pub stability_window: u64,
    pub max_name_length: usize,
}

impl ScanLimits {
    pub fn new(max_files: usize) -> Self {
        Self {
            max_files,
            deadline: None,
            stability_window: 0,
            max_name_length: MAX_FILENAME_LENGTH,
        }
    }
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub pool: FilePool,
    pub skipped: Vec<(String, SkipReason)>,
    /// The pool filled up or the deadline hit before the directory end.
    pub partial: bool,
}

/// Seconds since the epoch of a `SystemTime`, 0 before it.
pub fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_unix() -> i64 {
    unix_seconds(SystemTime::now())
}

/// Inputs a scan consults besides the directory itself.
pub struct ScanContext<'a> {
    pub locked: &'a LockedFilter,
    pub accept_dot_files: bool,
    /// Masks of the directory's jobs; a file must match one of them.
    pub masks: &'a [&'a FileMasks],
    /// Names already handed to a worker.
    pub in_flight: &'a HashSet<String>,
    pub sizes: &'a mut SizeTracker,
    pub now: i64,
}

impl ScanContext<'_> {
    /// Why `name` stays in the directory without a stat, if it does.
    fn precheck(&self, name: &str, limits: &ScanLimits) -> Option<SkipReason> {
        if name.len() > limits.max_name_length {
            Some(SkipReason::NameTooLong)
        } else if self.locked.is_locked(name, self.accept_dot_files) {
            Some(SkipReason::Locked)
        } else if !self.masks.iter().any(|m| m.matches(name)) {
            Some(SkipReason::Unmatched)
        } else if self.in_flight.contains(name) {
            Some(SkipReason::InFlight)
        } else {
            None
        }
    }
}

/// Scan one directory in directory order.
///
/// # Arguments
/// * `dir` - Directory to read
/// * `limits` - Pool size, deadline and stability window
/// * `ctx` - Filters and state shared between scans
///
/// # Returns
/// * `Ok(ScanOutcome)` - Files picked, files skipped and whether the scan ended early
/// * `Err(ScanError)` - The directory itself could not be read
pub fn scan_directory(
    dir: &Path,
    limits: &ScanLimits,
    ctx: &mut ScanContext<'_>,
) -> Result<ScanOutcome, ScanError> {
    let mut outcome = ScanOutcome {
        pool: FilePool::new(limits.max_files),
        skipped: Vec::new(),
        partial: false,
    };

    let mut present = HashSet::new();
    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => return Err(root_error(dir, e)),
            // Entry vanished between readdir and stat
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(deadline) = limits.deadline {
            if Instant::now() >= deadline {
                outcome.partial = true;
                break;
            }
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        present.insert(name.clone());
        if let Some(reason) = ctx.precheck(&name, limits) {
            outcome.skipped.push((name, reason));
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let size = metadata.len();
        let mtime = metadata.modified().map(unix_seconds).unwrap_or(0);
        if !ctx.sizes.check(&name, size, mtime, ctx.now, limits.stability_window) {
            outcome.skipped.push((name, SkipReason::Unstable));
            continue;
        }

        if outcome.pool.push(name, size, mtime) == PushResult::Full {
            outcome.partial = true;
            break;
        }
    }
    // only a complete walk knows which tracked files are gone
    if !outcome.partial {
        ctx.sizes.retain(|name| present.contains(name));
    }
    Ok(outcome)
}

/// Stat a list of names collected from filesystem events into a pool.
pub fn collect_named(
    dir: &Path,
    names: &[String],
    limits: &ScanLimits,
    ctx: &mut ScanContext<'_>,
) -> ScanOutcome {
    let mut outcome = ScanOutcome {
        pool: FilePool::new(limits.max_files),
        skipped: Vec::new(),
        partial: false,
    };
    for name in names {
        if let Some(reason) = ctx.precheck(name, limits) {
            outcome.skipped.push((name.clone(), reason));
            continue;
        }
        let Ok(metadata) = std::fs::metadata(dir.join(name)) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let mtime = metadata.modified().map(unix_seconds).unwrap_or(0);
        if !ctx.sizes.check(name, metadata.len(), mtime, ctx.now, limits.stability_window) {
            outcome.skipped.push((name.clone(), SkipReason::Unstable));
            continue;
        }
        if outcome.pool.push(name.clone(), metadata.len(), mtime) == PushResult::Full {
            outcome.partial = true;
            break;
        }
    }
    outcome
}

fn root_error(dir: &Path, e: walkdir::Error) -> ScanError {
    match e.io_error().map(|io| io.kind()) {
        Some(io::ErrorKind::NotFound) => ScanError::Vanished(dir.to_path_buf()),
        Some(io::ErrorKind::PermissionDenied) => ScanError::PermissionDenied(dir.to_path_buf()),
        _ => ScanError::Io {
            path: dir.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory loop")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn any_file() -> FileMasks {
        FileMasks::new(vec!["*".to_string()])
    }

    fn scan(dir: &Path, limits: &ScanLimits, locked: &LockedFilter) -> ScanOutcome {
        let in_flight = HashSet::new();
        let mut sizes = SizeTracker::new();
        let masks = any_file();
        let mut ctx = ScanContext {
            locked,
            accept_dot_files: false,
            masks: &[&masks],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: now_unix(),
        };
        scan_directory(dir, limits, &mut ctx).unwrap()
    }

    fn names(outcome: &ScanOutcome) -> Vec<String> {
        let mut v: Vec<String> = outcome.pool.entries().iter().map(|e| e.name.clone()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_scan_skips_subdirs_and_locked() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"hello").unwrap();
        File::create(temp.path().join("b.part")).unwrap();
        File::create(temp.path().join(".hidden")).unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        File::create(temp.path().join("sub/c.txt")).unwrap();

        let locked = LockedFilter::new(&["*.part".to_string()]);
        let outcome = scan(temp.path(), &ScanLimits::new(10), &locked);
        assert_eq!(names(&outcome), vec!["a.txt".to_string()]);
        assert_eq!(outcome.pool.entries()[0].size, 5);
        assert_eq!(outcome.skipped.len(), 2);
        assert!(!outcome.partial);
    }

    #[test]
    fn test_unmatched_files_do_not_fill_the_pool() {
        let temp = TempDir::new().unwrap();
        for n in ["x.dat", "y.dat", "z.dat", "a.txt"] {
            File::create(temp.path().join(n)).unwrap();
        }
        let in_flight = HashSet::new();
        let mut sizes = SizeTracker::new();
        let locked = LockedFilter::default();
        let txt = FileMasks::new(vec!["*.txt".to_string()]);
        let mut ctx = ScanContext {
            locked: &locked,
            accept_dot_files: false,
            masks: &[&txt],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: now_unix(),
        };
        let outcome = scan_directory(temp.path(), &ScanLimits::new(2), &mut ctx).unwrap();
        assert_eq!(names(&outcome), vec!["a.txt".to_string()]);
        assert!(!outcome.partial);
        let unmatched = outcome
            .skipped
            .iter()
            .filter(|(_, r)| *r == SkipReason::Unmatched)
            .count();
        assert_eq!(unmatched, 3);

        // a directory without jobs wants nothing
        ctx.masks = &[];
        let outcome = scan_directory(temp.path(), &ScanLimits::new(2), &mut ctx).unwrap();
        assert!(outcome.pool.is_empty());
    }

    #[test]
    fn test_pool_of_one_makes_progress() {
        let temp = TempDir::new().unwrap();
        for n in ["a", "b", "c"] {
            File::create(temp.path().join(n)).unwrap();
        }
        let outcome = scan(temp.path(), &ScanLimits::new(1), &LockedFilter::default());
        assert_eq!(outcome.pool.len(), 1);
        assert!(outcome.partial);
    }

    #[test]
    fn test_long_names_are_skipped_not_truncated() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("abcdefghij")).unwrap();
        File::create(temp.path().join("short")).unwrap();
        let mut limits = ScanLimits::new(10);
        limits.max_name_length = 8;
        let outcome = scan(temp.path(), &limits, &LockedFilter::default());
        assert_eq!(names(&outcome), vec!["short".to_string()]);
        assert_eq!(
            outcome.skipped,
            vec![("abcdefghij".to_string(), SkipReason::NameTooLong)]
        );
    }

    #[test]
    fn test_missing_dir_is_vanished() {
        let temp = TempDir::new().unwrap();
        let in_flight = HashSet::new();
        let mut sizes = SizeTracker::new();
        let locked = LockedFilter::default();
        let masks = any_file();
        let mut ctx = ScanContext {
            locked: &locked,
            accept_dot_files: false,
            masks: &[&masks],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: 0,
        };
        let err = scan_directory(&temp.path().join("gone"), &ScanLimits::new(1), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, ScanError::Vanished(_)));
    }

    #[test]
    fn test_in_flight_and_young_files_wait() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("busy")).unwrap();
        File::create(temp.path().join("young")).unwrap();
        let in_flight: HashSet<String> = ["busy".to_string()].into_iter().collect();
        let mut sizes = SizeTracker::new();
        let locked = LockedFilter::default();
        let masks = any_file();
        let mut limits = ScanLimits::new(10);
        limits.stability_window = 3600;
        let mut ctx = ScanContext {
            locked: &locked,
            accept_dot_files: false,
            masks: &[&masks],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: now_unix(),
        };
        let first = scan_directory(temp.path(), &limits, &mut ctx).unwrap();
        assert!(first.pool.is_empty());
        // an unchanged size does not shorten the window
        let second = scan_directory(temp.path(), &limits, &mut ctx).unwrap();
        assert!(second.pool.is_empty());
        assert!(second.skipped.contains(&("young".to_string(), SkipReason::Unstable)));
        assert!(second.skipped.contains(&("busy".to_string(), SkipReason::InFlight)));

        // once the window has passed the file goes
        ctx.now += 3600;
        let third = scan_directory(temp.path(), &limits, &mut ctx).unwrap();
        assert_eq!(names(&third), vec!["young".to_string()]);
        assert!(ctx.sizes.is_empty());
    }

    #[test]
    fn test_full_scan_forgets_vanished_young_files() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("short-lived")).unwrap();
        let in_flight = HashSet::new();
        let mut sizes = SizeTracker::new();
        let locked = LockedFilter::default();
        let masks = any_file();
        let mut limits = ScanLimits::new(10);
        limits.stability_window = 3600;
        let mut ctx = ScanContext {
            locked: &locked,
            accept_dot_files: false,
            masks: &[&masks],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: now_unix(),
        };
        scan_directory(temp.path(), &limits, &mut ctx).unwrap();
        assert_eq!(ctx.sizes.len(), 1);

        fs::remove_file(temp.path().join("short-lived")).unwrap();
        scan_directory(temp.path(), &limits, &mut ctx).unwrap();
        assert!(ctx.sizes.is_empty());
    }

    #[test]
    fn test_collect_named_ignores_vanished_and_unmatched() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("x.dat"), b"12").unwrap();
        fs::write(temp.path().join("y.txt"), b"3").unwrap();
        let in_flight = HashSet::new();
        let mut sizes = SizeTracker::new();
        let locked = LockedFilter::default();
        let masks = FileMasks::new(vec!["*.dat".to_string()]);
        let mut ctx = ScanContext {
            locked: &locked,
            accept_dot_files: false,
            masks: &[&masks],
            in_flight: &in_flight,
            sizes: &mut sizes,
            now: now_unix(),
        };
        let outcome = collect_named(
            temp.path(),
            &["x.dat".to_string(), "gone.dat".to_string(), "y.txt".to_string()],
            &ScanLimits::new(10),
            &mut ctx,
        );
        assert_eq!(names(&outcome), vec!["x.dat".to_string()]);
        assert_eq!(outcome.skipped, vec![("y.txt".to_string(), SkipReason::Unmatched)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        #[test]
        fn prop_pool_never_exceeds_limit(count in 0usize..15, cap in 1usize..10) {
            let temp = TempDir::new().unwrap();
            for i in 0..count {
                File::create(temp.path().join(format!("f{}", i))).unwrap();
            }
            let outcome = scan(temp.path(), &ScanLimits::new(cap), &LockedFilter::default());
            prop_assert_eq!(outcome.pool.len(), count.min(cap));
            prop_assert_eq!(outcome.partial, count > cap);
        }
    }
}
