//! Startup recovery of the process list left by a previous dir_check.

use crate::dcpl::{DcplError, ProcessList};
use crate::jobs::JobDb;
use crate::tables::fra::DirEntry;
use crate::tables::mapped::MappedTable;
use crate::worker_pool::{process_exists, WorkerPool};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pids adopted as orphaned workers.
    pub adopted: Vec<i32>,
    /// Slots with `pid <= 0`.
    pub garbage: usize,
    /// Workers that died while dir_check was down.
    pub dead: usize,
    /// Live workers whose job left the job DB; left running, not tracked.
    pub detached: usize,
}

/// Validate every DCPL entry, adopt live workers of known jobs and
/// recompute the per-directory worker counters.
///
/// # Arguments
/// * `dcpl` - Process list as left by the previous run
/// * `db` - Current job database
/// * `fra` - Directory table; every `no_of_process` is rewritten
/// * `pool` - Receives the adopted workers
/// * `work_dir` - Working directory, for the adopted batches' stage dirs
pub fn recover_orphans(
    dcpl: &mut ProcessList,
    db: &JobDb,
    fra: &mut MappedTable<DirEntry>,
    pool: &mut WorkerPool,
    work_dir: &Path,
) -> Result<RecoveryReport, DcplError> {
    let mut report = RecoveryReport::default();

    let dropped = dcpl.retain(|entry| {
        if entry.pid <= 0 {
            report.garbage += 1;
            false
        } else if !process_exists(entry.pid) {
            report.dead += 1;
            false
        } else if !db.contains(entry.job_id) {
            debug!(pid = entry.pid, job_id = %format!("{:x}", entry.job_id), "Worker of a removed job, leaving it alone");
            report.detached += 1;
            false
        } else {
            true
        }
    })?;
    debug!(dropped = dropped.len(), "Process list pruned");

    for pos in 0..fra.len() {
        fra.update(pos, |d| d.no_of_process = 0)?;
    }

    for pos in 0..dcpl.len() {
        let entry = dcpl.get(pos)?;
        let Some(job) = db.get(entry.job_id) else {
            continue;
        };
        if entry.fra_pos as usize != job.fra_pos {
            dcpl.set_fra_pos(pos, job.fra_pos as u32)?;
        }
        if job.fra_pos < fra.len() {
            fra.update(job.fra_pos, |d| d.no_of_process += 1)?;
        }
        pool.adopt(entry.pid, job.clone(), job.fra_pos, entry.unique_number, work_dir);
        report.adopted.push(entry.pid);
    }

    if !report.adopted.is_empty() {
        info!(workers = report.adopted.len(), "Found orphaned workers, adopting them");
    }
    dcpl.flush()?;
    Ok(report)
}
