//! File-selection pipeline: turns one directory's file pool into batches,
//! one per job, plus the delete-log records of files dropped on the way.
//!
//! Per job and file: mask match, age limit, host disabled, duplicate check,
//! then the file is distributed to the job. Files for a host whose queue is
//! paused are still taken but land in the queue-stopped column.

use crate::dupcheck::{DupStore, Sighting};
use crate::jobs::Job;
use crate::logs::delete::{DeleteReason, DeleteRecord, DIR_CHECK_PROC};
use crate::pool::{DistributionType, FilePool};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    /// Dupcheck key stored for this file, dropped again if the batch fails.
    pub dupcheck_key: Option<u32>,
}

/// State of a job's target host as far as selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Open,
    QueuePaused,
    Disabled,
}

/// Files one job takes from one scan.
#[derive(Debug, Clone)]
pub struct Batch {
    pub job: Arc<Job>,
    pub files: Vec<SelectedFile>,
}

impl Batch {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Selection {
    pub batches: Vec<Batch>,
    pub deletions: Vec<DeleteRecord>,
    /// Files dropped by at least one job and taken by none; the caller
    /// removes them from the source directory.
    pub unlink: Vec<String>,
}

/// Per-tick inputs of the pipeline.
pub struct Selector<'a> {
    pub dir: &'a Path,
    pub now: i64,
    pub default_age_limit: u64,
    pub dupstore: &'a mut DupStore,
}

impl<'a> Selector<'a> {
    /// Run the pipeline over `pool` for every job of the directory.
    ///
    /// # Arguments
    /// * `pool` - Files of this scan; their distribution columns are filled in
    /// * `jobs` - Jobs attached to the directory, in job-DB order
    /// * `host_state` - State of a job's target host
    ///
    /// # Returns
    /// Batches in job order with files in pool order, and the deletions.
    pub fn select<F>(&mut self, pool: &mut FilePool, jobs: &[Arc<Job>], host_state: F) -> Selection
    where
        F: Fn(&Job) -> HostState,
    {
        let mut selection = Selection::default();
        let mut dropped: HashSet<String> = HashSet::new();

        for job in jobs {
            let age_limit = job.local_options.effective_age_limit(self.default_age_limit);
            let host = host_state(job);
            let mut files = Vec::new();

            for entry in pool.entries_mut() {
                if !job.masks.matches(&entry.name) {
                    continue;
                }

                if let Some(limit) = age_limit {
                    let age = self.now.saturating_sub(entry.mtime);
                    if age > limit as i64 {
                        entry.distribute(DistributionType::AgeLimitDelete, job.job_id);
                        selection.deletions.push(self.deletion(
                            job,
                            DeleteReason::AgeLimit,
                            &entry.name,
                            entry.size,
                            format!(">{} ({})", age, limit),
                        ));
                        dropped.insert(entry.name.clone());
                        continue;
                    }
                }

                if host == HostState::Disabled {
                    entry.distribute(DistributionType::Disabled, job.job_id);
                    selection.deletions.push(self.deletion(
                        job,
                        DeleteReason::HostDisabled,
                        &entry.name,
                        entry.size,
                        String::new(),
                    ));
                    dropped.insert(entry.name.clone());
                    continue;
                }

                let mut dupcheck_key = None;
                if let Some(spec) = &job.local_options.dupcheck {
                    let path = self.dir.join(&entry.name);
                    match self.dupstore.check_and_insert(
                        job.job_id,
                        spec,
                        &path,
                        &entry.name,
                        entry.size,
                        self.now,
                    ) {
                        Ok(Sighting::Duplicate) => {
                            entry.distribute(DistributionType::Dupcheck, job.job_id);
                            selection.deletions.push(self.deletion(
                                job,
                                DeleteReason::Dupcheck,
                                &entry.name,
                                entry.size,
                                String::new(),
                            ));
                            dropped.insert(entry.name.clone());
                            continue;
                        }
                        Ok(Sighting::First(key)) => dupcheck_key = Some(key),
                        Err(e) => {
                            warn!(
                                file = %path.display(),
                                error = %e,
                                "Failed to compute dupcheck key, passing file on"
                            );
                        }
                    }
                }

                let kind = if host == HostState::QueuePaused {
                    DistributionType::QueueStopped
                } else {
                    DistributionType::Normal
                };
                entry.distribute(kind, job.job_id);
                files.push(SelectedFile {
                    name: entry.name.clone(),
                    size: entry.size,
                    mtime: entry.mtime,
                    dupcheck_key,
                });
            }

            if !files.is_empty() {
                debug!(
                    job_id = %format!("{:x}", job.job_id),
                    files = files.len(),
                    "Batch selected"
                );
                selection.batches.push(Batch {
                    job: Arc::clone(job),
                    files,
                });
            }
        }

        selection.unlink = pool
            .entries()
            .iter()
            .filter(|e| dropped.contains(&e.name) && !e.is_taken())
            .map(|e| e.name.clone())
            .collect();
        selection
    }

    fn deletion(&self, job: &Job, reason: DeleteReason, name: &str, size: u64, extra: String) -> DeleteRecord {
        DeleteRecord {
            time: self.now,
            host_alias: job.host_alias.clone(),
            reason,
            name: name.to_string(),
            size,
            job_id: job.job_id,
            dir_id: job.dir_id,
            proc: DIR_CHECK_PROC.to_string(),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::job;
    use crate::options::{DupcheckMode, DupcheckSpec};
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000;

    fn pool(files: &[(&str, i64)]) -> FilePool {
        let mut pool = FilePool::new(64);
        for (name, age) in files {
            pool.push(name.to_string(), 5, NOW - age);
        }
        pool
    }

    #[test]
    fn test_masks_split_files_between_jobs() {
        let mut store = DupStore::default();
        let mut sel = Selector {
            dir: Path::new("/nonexistent"),
            now: NOW,
            default_age_limit: 0,
            dupstore: &mut store,
        };
        let mut pool = pool(&[("a.txt", 10), ("b.dat", 10), ("c.txt", 10)]);
        let jobs = vec![job(1, &["*.txt"]), job(2, &["!a.*", "*"])];
        let out = sel.select(&mut pool, &jobs, |_| HostState::Open);

        assert_eq!(out.batches.len(), 2);
        assert_eq!(out.batches[0].names().collect::<Vec<_>>(), vec!["a.txt", "c.txt"]);
        assert_eq!(out.batches[1].names().collect::<Vec<_>>(), vec!["b.dat", "c.txt"]);
        assert_eq!(out.batches[1].total_bytes(), 10);
        assert!(out.deletions.is_empty());
        assert!(out.unlink.is_empty());
        assert_eq!(
            pool.entries()[2].distribution[DistributionType::Normal.index()],
            vec![1, 2]
        );
    }

    #[test]
    fn test_age_limit_drops_and_logs() {
        let mut store = DupStore::default();
        let mut sel = Selector {
            dir: Path::new("/nonexistent"),
            now: NOW,
            default_age_limit: 60,
            dupstore: &mut store,
        };
        let mut pool = pool(&[("b.txt", 3600), ("fresh.txt", 10)]);
        let out = sel.select(&mut pool, &[job(1, &["*.txt"])], |_| HostState::Open);

        assert_eq!(out.batches[0].names().collect::<Vec<_>>(), vec!["fresh.txt"]);
        assert_eq!(out.deletions.len(), 1);
        assert_eq!(out.deletions[0].reason, DeleteReason::AgeLimit);
        assert_eq!(out.deletions[0].name, "b.txt");
        assert_eq!(out.deletions[0].extra, ">3600 (60)");
        assert_eq!(out.unlink, vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_file_taken_by_other_job_is_not_unlinked() {
        let mut store = DupStore::default();
        let mut sel = Selector {
            dir: Path::new("/nonexistent"),
            now: NOW,
            default_age_limit: 0,
            dupstore: &mut store,
        };
        let mut aged = (*job(1, &["*"])).clone();
        aged.local_options.age_limit = Some(5);
        let jobs = vec![Arc::new(aged), job(2, &["*"])];
        let mut pool = pool(&[("x", 100)]);
        let out = sel.select(&mut pool, &jobs, |_| HostState::Open);

        assert_eq!(out.deletions.len(), 1);
        assert_eq!(out.batches.len(), 1);
        assert_eq!(out.batches[0].job.job_id, 2);
        assert!(out.unlink.is_empty());
    }

    #[test]
    fn test_disabled_host_drops_files() {
        let mut store = DupStore::default();
        let mut sel = Selector {
            dir: Path::new("/nonexistent"),
            now: NOW,
            default_age_limit: 0,
            dupstore: &mut store,
        };
        let mut pool = pool(&[("a", 1)]);
        let out = sel.select(&mut pool, &[job(1, &["*"])], |_| HostState::Disabled);
        assert!(out.batches.is_empty());
        assert_eq!(out.deletions[0].reason, DeleteReason::HostDisabled);
        assert_eq!(
            pool.entries()[0].distribution[DistributionType::Disabled.index()],
            vec![1]
        );
        assert_eq!(out.unlink, vec!["a".to_string()]);
    }

    #[test]
    fn test_paused_queue_still_takes_files() {
        let mut store = DupStore::default();
        let mut sel = Selector {
            dir: Path::new("/nonexistent"),
            now: NOW,
            default_age_limit: 0,
            dupstore: &mut store,
        };
        let mut pool = pool(&[("a", 1)]);
        let out = sel.select(&mut pool, &[job(1, &["*"])], |_| HostState::QueuePaused);
        assert_eq!(out.batches.len(), 1);
        assert!(out.deletions.is_empty());
        assert!(out.unlink.is_empty());
        let entry = &pool.entries()[0];
        assert_eq!(entry.distribution[DistributionType::QueueStopped.index()], vec![1]);
        assert!(entry.distribution[DistributionType::Normal.index()].is_empty());
    }

    #[test]
    fn test_dupcheck_second_tick_drops() {
        let mut store = DupStore::default();
        let mut dup = (*job(1, &["*"])).clone();
        dup.local_options.dupcheck = Some(DupcheckSpec {
            timeout: 600,
            mode: DupcheckMode::Name,
        });
        let jobs = vec![Arc::new(dup)];

        for round in 0..2 {
            let mut sel = Selector {
                dir: Path::new("/nonexistent"),
                now: NOW + round,
                default_age_limit: 0,
                dupstore: &mut store,
            };
            let mut pool = pool(&[("same", 1)]);
            let out = sel.select(&mut pool, &jobs, |_| HostState::Open);
            if round == 0 {
                assert_eq!(out.batches.len(), 1);
                assert!(out.batches[0].files[0].dupcheck_key.is_some());
            } else {
                assert!(out.batches.is_empty());
                assert_eq!(out.deletions[0].reason, DeleteReason::Dupcheck);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_each_file_once_per_batch(names in proptest::collection::vec("[a-c]{1,2}\\.(txt|dat)", 0..20)) {
            let mut store = DupStore::default();
            let mut sel = Selector {
                dir: Path::new("/nonexistent"),
                now: NOW,
                default_age_limit: 0,
                dupstore: &mut store,
            };
            let mut pool = FilePool::new(8);
            for n in &names {
                pool.push(n.clone(), 1, NOW);
            }
            let out = sel.select(&mut pool, &[job(1, &["*.txt"]), job(2, &["*"])], |_| HostState::Open);
            for batch in &out.batches {
                let unique: HashSet<&str> = batch.names().collect();
                prop_assert_eq!(unique.len(), batch.files.len());
                prop_assert!(batch.files.len() <= 8);
            }
        }
    }
}
