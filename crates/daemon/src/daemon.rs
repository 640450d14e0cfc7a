//! The dir_check driver
//!
//! One single-threaded loop waits on the rescan timer, the control fifos,
//! filesystem events, worker exits and signals. Each wakeup drains every
//! fifo, reaps finished workers, scans the due directories and dispatches
//! queued batches, in that order.

use crate::concurrency::{DispatchPlan, Eligibility};
use crate::counter::{Counter, AMG_COUNTER_FILE, INPUT_LOG_COUNTER_FILE};
use crate::dcpl::{DcplError, ProcessList, DCPL_FILE};
use crate::dupcheck::{DupStore, DUPCHECK_FILE};
use crate::fifo::{
    self, DcCommand, FifoReader, ACKN, DC_CMD_FIFO, DC_RESP_FIFO, DEL_TIME_JOB_FIFO, IP_FIN_FIFO,
    MSG_FIFO, QUEUE_LIST_DONE_FIFO, QUEUE_LIST_FILE, QUEUE_LIST_READY_FIFO,
};
use crate::filter::{FileMasks, LockedFilter};
use crate::jobs::{ActiveJobDb, Job, JobDb, JobDbError, COMPILED_DIR_CONFIG_FILE};
use crate::logs::{
    DeleteLog, DistributionLog, DistributionRecord, InputLog, InputRecord, ProductionLog,
    ProductionRecord, LOG_DIR,
};
use crate::message::{FinishDecoder, JobMessage, MessageBuffer, MessageError, ORIGINATOR_DIR_CHECK};
use crate::metrics::{DirCheckStats, QueueSnapshot, QueuedBatch, RunningWorker};
use crate::recovery::recover_orphans;
use crate::rules::RuleSet;
use crate::scan::{
    collect_named, now_unix, scan_directory, ScanContext, ScanError, ScanLimits, ScanOutcome,
    SkipReason, MAX_FILENAME_LENGTH,
};
use crate::selection::{Batch, HostState, SelectedFile, Selector};
use crate::stability::SizeTracker;
use crate::startup::{attach_tables, create_source_dirs, fifo_dir, local_dir_count, run_startup_checks, StartupError};
use crate::system_data::{SystemData, SystemDataError, SYSTEM_DATA_FILE};
use crate::tables::flags::{fra_feature, fsa_feature};
use crate::tables::{
    AfdStatus, AttachRetry, CpuTime, DirEntry, DirFlag, HostEntry, LogSign, MappedTable, TableError,
};
use crate::watch::{DirWatcher, WatchAccumulator};
use crate::worker::{self, ManifestFile, StageMode, WorkerError, WorkerManifest, ETC_DIR, RC_TIMEOUT};
use crate::worker_pool::{process_exists, spawn_worker, Fault, Launch, RunningBatch, WorkerPool};
use afd_config::{ConfigError, DirCheckConfig, MAX_FILE_BUFFER_SIZE};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Name of the worker binary looked up next to the running executable.
pub const DC_WORKER_PROGRAM: &str = "dc_worker";

/// Scan failures after which a directory is disabled.
pub const MAX_DIR_ERRORS: u32 = 10;

/// Seconds between two permission warnings for the same directory.
const ACCESS_WARN_INTERVAL: i64 = 60;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Status table error: {0}")]
    Table(#[from] TableError),

    #[error("Process list error: {0}")]
    Dcpl(#[from] DcplError),

    #[error("Job database error: {0}")]
    JobDb(#[from] JobDbError),

    #[error("Message bus error: {0}")]
    Message(#[from] MessageError),

    #[error("Checkpoint error: {0}")]
    SystemData(#[from] SystemDataError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The six positional arguments of dir_check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCheckArgs {
    pub work_dir: PathBuf,
    /// Default rescan interval in seconds.
    pub rescan_time: u64,
    pub max_process: usize,
    /// Number of local directories the supervisor expects.
    pub no_of_local_dirs: usize,
    /// Mode for source directories created at start.
    pub create_source_dir_mode: u32,
    /// Supervisor pid; 0 disables the liveness check.
    pub supervisor_pid: i32,
}

/// A selected batch waiting for a worker.
#[derive(Debug)]
struct PendingBatch {
    fra_pos: usize,
    batch: Batch,
    modes: Vec<StageMode>,
    unique: u32,
    creation_time: i64,
}

/// What happens to the source files when a batch leaves dir_check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Staged by a worker.
    Completed,
    /// The worker failed; files stay for the next scan.
    Failed,
    /// Removed from the queue on request; files are deleted.
    Discarded,
}

/// Read sides of the fifos dir_check listens on.
#[derive(Debug)]
pub struct Fifos {
    cmd: FifoReader,
    fin: FifoReader,
    del: FifoReader,
    queue: FifoReader,
    cmd_buf: Vec<u8>,
    fin_buf: Vec<u8>,
    del_buf: Vec<u8>,
    queue_buf: Vec<u8>,
}

impl Fifos {
    pub fn open(fifo_dir: &Path) -> io::Result<Self> {
        Ok(Self {
            cmd: FifoReader::open(&fifo_dir.join(DC_CMD_FIFO))?,
            fin: FifoReader::open(&fifo_dir.join(IP_FIN_FIFO))?,
            del: FifoReader::open(&fifo_dir.join(DEL_TIME_JOB_FIFO))?,
            queue: FifoReader::open(&fifo_dir.join(QUEUE_LIST_READY_FIFO))?,
            cmd_buf: Vec::new(),
            fin_buf: Vec::new(),
            del_buf: Vec::new(),
            queue_buf: Vec::new(),
        })
    }

    fn drain_all(&mut self) {
        for (reader, buf) in [
            (&mut self.cmd, &mut self.cmd_buf),
            (&mut self.fin, &mut self.fin_buf),
            (&mut self.del, &mut self.del_buf),
            (&mut self.queue, &mut self.queue_buf),
        ] {
            if let Err(e) = reader.drain(buf) {
                warn!(fifo = %reader.path().display(), error = %e, "Failed to read fifo");
            }
        }
    }
}

/// Why the loop woke up.
enum Wake {
    Timer,
    Fifo(&'static str, io::Result<usize>),
    Event(Option<notify::Result<notify::Event>>),
    Deadline,
    Child,
    Signal(&'static str),
}

/// Runtime state of dir_check
pub struct DirCheck {
    args: DirCheckArgs,
    cfg: DirCheckConfig,
    fifo_dir: PathBuf,
    worker_program: PathBuf,
    plan: DispatchPlan,

    fsa: MappedTable<HostEntry>,
    fra: MappedTable<DirEntry>,
    status: MappedTable<AfdStatus>,
    dcpl: ProcessList,
    jobs: ActiveJobDb,
    rules: RuleSet,
    locked: LockedFilter,

    pool: WorkerPool,
    pending: VecDeque<PendingBatch>,
    timed_out: HashSet<i32>,
    in_flight: HashMap<usize, HashSet<String>>,
    shared: HashMap<(usize, String), usize>,
    sizes: HashMap<usize, SizeTracker>,
    fin_decoder: FinishDecoder,

    amg_counter: Counter,
    il_counter: Counter,
    dupstore: DupStore,
    production_log: ProductionLog,
    input_log: InputLog,
    distribution_log: DistributionLog,
    delete_log: DeleteLog,
    msg_buffer: MessageBuffer,

    watcher: Option<DirWatcher>,
    acc: WatchAccumulator,
    /// Directories in dispatch order; one that left files behind moves to the tail.
    order: VecDeque<usize>,
    last_full_scan: HashMap<usize, i64>,
    last_access_warn: HashMap<usize, i64>,
    fsa_features: u8,
    checkpoint_comments: Vec<String>,
    child_cpu: (CpuTime, CpuTime),
    history_hour: i64,
    started: i64,
    stopping: bool,
    stats: DirCheckStats,
}

impl DirCheck {
    /// Initialize dir_check
    ///
    /// This performs the full startup sequence:
    /// 1. Check the working directory, create fifos and log dir
    /// 2. Load `AFD_CONFIG` and apply environment overrides
    /// 3. Attach FSA, FRA and AFD_STATUS
    /// 4. Create missing source directories
    /// 5. Restore the system-data checkpoint
    /// 6. Build the job database and load rename rules
    /// 7. Recover workers left by a previous run
    /// 8. Install filesystem watches
    ///
    /// # Returns
    /// * `Ok(DirCheck)` - Ready to run
    /// * `Err(DaemonError)` - A fatal configuration or attach error
    pub fn start(args: DirCheckArgs) -> Result<Self, DaemonError> {
        let work_dir = args.work_dir.clone();
        run_startup_checks(&work_dir)?;
        let cfg = DirCheckConfig::load(&work_dir)?;
        let fifo_dir = fifo_dir(&work_dir);

        let tables = attach_tables(&fifo_dir, &AttachRetry::default())?;
        let (fsa, mut fra, mut status) = (tables.fsa, tables.fra, tables.status);
        create_source_dirs(&fra, args.create_source_dir_mode)?;
        let local = local_dir_count(&fra)?;
        if local != args.no_of_local_dirs {
            warn!(expected = args.no_of_local_dirs, found = local, "Number of local directories differs from FRA");
        }

        let checkpoint = SystemData::read(&fifo_dir.join(SYSTEM_DATA_FILE))?;
        status.update(0, |s| {
            checkpoint.apply(s);
            s.dir_check_pid = std::process::id() as i32;
        })?;

        let db = JobDb::load(
            &fifo_dir.join(COMPILED_DIR_CONFIG_FILE),
            &fra.records()?,
            &fsa.records()?,
            &cfg,
        )?;
        let rules = load_rules(&work_dir, &cfg, &db);

        let mut dcpl = ProcessList::open(&fifo_dir.join(DCPL_FILE), args.max_process)?;
        let mut pool = WorkerPool::new();
        let report = recover_orphans(&mut dcpl, &db, &mut fra, &mut pool, &work_dir)?;
        debug!(?report, "Process list recovered");

        let now = now_unix();
        let mut daemon = Self {
            plan: DispatchPlan::derive(&cfg, args.max_process),
            worker_program: worker_program(&cfg),
            locked: LockedFilter::new(&cfg.additional_locked_files),
            fsa_features: fsa.feature_flags(),
            fsa,
            fra,
            status,
            dcpl,
            jobs: ActiveJobDb::new(db),
            rules,
            pool,
            pending: VecDeque::new(),
            timed_out: HashSet::new(),
            in_flight: HashMap::new(),
            shared: HashMap::new(),
            sizes: HashMap::new(),
            fin_decoder: FinishDecoder::new(),
            amg_counter: Counter::open(&fifo_dir.join(AMG_COUNTER_FILE))?,
            il_counter: Counter::open(&fifo_dir.join(INPUT_LOG_COUNTER_FILE))?,
            dupstore: DupStore::load(&fifo_dir.join(DUPCHECK_FILE)),
            production_log: ProductionLog::open(&work_dir.join(LOG_DIR))?,
            input_log: InputLog::open(&work_dir.join(LOG_DIR))?,
            distribution_log: DistributionLog::open(&work_dir.join(LOG_DIR))?,
            delete_log: DeleteLog::open(&work_dir.join(LOG_DIR))?,
            msg_buffer: MessageBuffer::open(&fifo_dir)?,
            watcher: None,
            acc: WatchAccumulator::new(),
            order: VecDeque::new(),
            last_full_scan: HashMap::new(),
            last_access_warn: HashMap::new(),
            checkpoint_comments: checkpoint.comments,
            child_cpu: children_cpu().unwrap_or_default(),
            history_hour: now / 3600,
            started: now,
            stopping: false,
            stats: DirCheckStats::default(),
            fifo_dir,
            cfg,
            args,
        };
        daemon.rebuild_directories()?;
        info!(
            jobs = daemon.jobs.load().len(),
            dirs = daemon.order.len(),
            max_process = daemon.plan.max_process,
            adopted = report.adopted.len(),
            "dir_check started"
        );
        Ok(daemon)
    }

    pub fn config(&self) -> &DirCheckConfig {
        &self.cfg
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn stats(&self) -> &DirCheckStats {
        &self.stats
    }

    /// Number of batches waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.pool.len()
    }

    /// Recompute the scan order and filesystem watches from the job DB.
    fn rebuild_directories(&mut self) -> Result<(), DaemonError> {
        let db = self.jobs.load();
        let fra = self.fra.records()?;
        self.order = db
            .dirs()
            .filter(|&pos| fra.get(pos).is_some_and(|d| d.is_scanned_locally()))
            .collect();

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.clear();
        }
        let watched: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&pos| fra[pos].is_watch_driven())
            .collect();
        if watched.is_empty() {
            self.watcher = None;
            return Ok(());
        }
        if self.watcher.is_none() {
            match DirWatcher::new() {
                Ok(w) => self.watcher = Some(w),
                Err(e) => {
                    warn!(error = %e, "Failed to create filesystem watcher, falling back to full scans");
                    return Ok(());
                }
            }
        }
        if let Some(watcher) = self.watcher.as_mut() {
            for pos in watched {
                let dir = &fra[pos];
                if let Err(e) = watcher.add(pos, &dir.dir_path(), dir.dir_options) {
                    warn!(dir = %dir.dir_alias, error = %e, "Failed to watch directory, it is scanned instead");
                    continue;
                }
                // events may have been missed while unwatched
                self.fra.update(pos, |d| d.dir_flag.insert(DirFlag::INOTIFY_NEEDS_SCAN))?;
            }
        }
        Ok(())
    }

    fn is_watched(&self, dir: &DirEntry) -> bool {
        self.watcher.as_ref().is_some_and(|w| !w.is_empty()) && dir.is_watch_driven()
    }

    /// Run the daemon main loop until STOP, a signal or the supervisor's
    /// exit, then shut down orderly.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        let mut fifos = Fifos::open(&self.fifo_dir)?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigchld = signal(SignalKind::child())?;
        let mut timer = interval(Duration::from_secs(self.args.rescan_time.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopping {
            let deadline = self.pool.next_deadline();
            let wake = {
                let Fifos {
                    cmd,
                    fin,
                    del,
                    queue,
                    cmd_buf,
                    fin_buf,
                    del_buf,
                    queue_buf,
                } = &mut fifos;
                tokio::select! {
                    _ = timer.tick() => Wake::Timer,
                    r = cmd.read_some(cmd_buf) => Wake::Fifo(DC_CMD_FIFO, r),
                    r = fin.read_some(fin_buf) => Wake::Fifo(IP_FIN_FIFO, r),
                    r = del.read_some(del_buf) => Wake::Fifo(DEL_TIME_JOB_FIFO, r),
                    r = queue.read_some(queue_buf) => Wake::Fifo(QUEUE_LIST_READY_FIFO, r),
                    ev = next_event(&mut self.watcher) => Wake::Event(ev),
                    _ = sleep_until(deadline) => Wake::Deadline,
                    _ = sigchld.recv() => Wake::Child,
                    _ = sigterm.recv() => Wake::Signal("SIGTERM"),
                    _ = sigint.recv() => Wake::Signal("SIGINT"),
                }
            };
            match wake {
                Wake::Fifo(name, Err(e)) => warn!(fifo = name, error = %e, "Failed to read fifo"),
                Wake::Event(Some(ev)) => {
                    if let Some(watcher) = self.watcher.as_ref() {
                        watcher.apply(ev, &mut self.acc);
                    }
                }
                Wake::Event(None) => {
                    warn!("Filesystem watch channel closed, falling back to full scans");
                    self.watcher = None;
                }
                Wake::Signal(name) => {
                    info!(signal = name, "Received signal, stopping");
                    self.stopping = true;
                }
                Wake::Timer | Wake::Fifo(_, Ok(_)) | Wake::Deadline | Wake::Child => {}
            }
            self.tick(&mut fifos);
        }
        self.shutdown(&mut fifos).await
    }

    /// One pass of the loop after a wakeup. Errors are logged here and
    /// never end the loop.
    pub fn tick(&mut self, fifos: &mut Fifos) {
        let now = now_unix();
        self.drain_watcher();
        fifos.drain_all();
        self.handle_commands(fifos);
        self.handle_finished(fifos);
        self.handle_del_time_jobs(fifos);
        self.reap(fifos);
        self.housekeeping(now);
        if !self.stopping {
            self.observe_tables();
            self.scan_dirs();
            self.dispatch_pending();
        }
        if !fifos.queue_buf.is_empty() {
            fifos.queue_buf.clear();
            self.write_queue_list(now);
        }
        self.flush();
    }

    fn drain_watcher(&mut self) {
        if let Some(watcher) = self.watcher.as_mut() {
            while let Some(ev) = watcher.try_recv() {
                watcher.apply(ev, &mut self.acc);
            }
        }
        let events = self.acc.take_event_count();
        if events > 0 {
            self.update_status(|s| s.inotify_events = s.inotify_events.wrapping_add(events));
        }
    }

    fn handle_commands(&mut self, fifos: &mut Fifos) {
        for byte in std::mem::take(&mut fifos.cmd_buf) {
            match DcCommand::from_byte(byte) {
                Some(DcCommand::Stop) => {
                    info!("Received STOP");
                    self.stopping = true;
                    self.acknowledge();
                }
                Some(DcCommand::IsAlive) => self.acknowledge(),
                Some(DcCommand::Reread) => {
                    if let Err(e) = self.reread() {
                        error!(error = %e, "Failed to reread DIR_CONFIG");
                        self.system_sign(LogSign::Error);
                    }
                }
                None => warn!(byte, "Unknown command on dc_cmd, ignored"),
            }
        }
    }

    fn acknowledge(&self) {
        match fifo::send(&self.fifo_dir.join(DC_RESP_FIFO), &[ACKN]) {
            Ok(true) => {}
            Ok(false) => debug!("Nobody listens on dc_resp"),
            Err(e) => warn!(error = %e, "Failed to acknowledge command"),
        }
    }

    /// Rebuild the job DB and rename rules; batches of removed jobs are
    /// dropped from the queue.
    pub fn reread(&mut self) -> Result<(), DaemonError> {
        if self.fra.refresh()? {
            debug!("FRA remapped");
        }
        if self.fsa.refresh()? {
            debug!("FSA remapped");
        }
        let db = JobDb::load(
            &self.fifo_dir.join(COMPILED_DIR_CONFIG_FILE),
            &self.fra.records()?,
            &self.fsa.records()?,
            &self.cfg,
        )?;
        self.rules = load_rules(&self.args.work_dir, &self.cfg, &db);
        let old = self.jobs.swap(db);
        let db = self.jobs.load();

        let (keep, dropped): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| db.get(p.batch.job.job_id).is_some_and(|j| j.fra_pos == p.fra_pos));
        self.pending = keep;
        for p in dropped {
            self.release_files(p.fra_pos, p.batch.job.job_id, &p.batch.files, Release::Failed);
        }
        self.rebuild_directories()?;
        info!(old = old.len(), new = db.len(), "Job database reread");
        Ok(())
    }

    fn handle_finished(&mut self, fifos: &mut Fifos) {
        self.fin_decoder.feed(&fifos.fin_buf);
        fifos.fin_buf.clear();
        while let Some(msg) = self.fin_decoder.next_message() {
            match msg {
                Ok(msg) => self.complete(msg.pid, msg.files, msg.bytes, msg.rc),
                Err(e) => warn!(error = %e, "Ignoring finish message"),
            }
        }
    }

    fn handle_del_time_jobs(&mut self, fifos: &mut Fifos) {
        let whole = fifos.del_buf.len() / 4 * 4;
        let ids: Vec<u32> = fifos
            .del_buf
            .drain(..whole)
            .collect::<Vec<u8>>()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        for job_id in ids {
            self.remove_queued_job(job_id);
        }
    }

    /// Drop every queued batch of a job and delete its files.
    pub fn remove_queued_job(&mut self, job_id: u32) -> usize {
        let (removed, keep): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.batch.job.job_id == job_id);
        self.pending = keep;
        for p in &removed {
            self.release_files(p.fra_pos, p.batch.job.job_id, &p.batch.files, Release::Discarded);
        }
        if removed.is_empty() {
            debug!(job_id = %format!("{:x}", job_id), "No queued batch for job");
        } else {
            info!(job_id = %format!("{:x}", job_id), batches = removed.len(), "Removed queued job");
        }
        removed.len()
    }

    /// Kill workers past their timeout and reap those that exited.
    fn reap(&mut self, fifos: &mut Fifos) {
        let expired = self.pool.kill_expired(tokio::time::Instant::now());
        self.timed_out.extend(expired);

        let exited = self.pool.exited();
        if exited.is_empty() {
            return;
        }
        // a worker writes its finish message before it exits
        if let Err(e) = fifos.fin.drain(&mut fifos.fin_buf) {
            warn!(error = %e, "Failed to read ip_fin");
        }
        self.handle_finished(fifos);
        for (pid, code) in exited {
            if !self.pool.contains(pid) {
                continue;
            }
            let fault = if self.timed_out.contains(&pid) {
                Fault::Timeout
            } else {
                Fault::Vanished(code)
            };
            self.fault(pid, fault);
        }
        self.account_child_cpu();
    }

    /// Handle a finish message.
    fn complete(&mut self, pid: i32, files: u32, bytes: u64, rc: i32) {
        let Some(batch) = self.pool.remove(pid) else {
            warn!(pid, "Finish message from a worker not in the process list, ignored");
            return;
        };
        self.timed_out.remove(&pid);
        self.free_slot(&batch);
        if rc != 0 {
            warn!(pid, job_id = %format!("{:x}", batch.job.job_id), rc, "Worker reported errors");
            self.system_sign(LogSign::Warn);
        }
        if files > 0 {
            self.hand_over(&batch, files, bytes);
        }
        self.release_files(batch.fra_pos, batch.job.job_id, &batch.files, Release::Completed);
        remove_manifest(&batch.manifest);
        self.stats.batches_completed += 1;
        debug!(pid, files, bytes, "Worker finished");
    }

    /// Record a batch whose worker left without a finish message.
    fn fault(&mut self, pid: i32, fault: Fault) {
        let Some(batch) = self.pool.remove(pid) else {
            return;
        };
        self.timed_out.remove(&pid);
        self.free_slot(&batch);
        let (rc, command) = match fault {
            Fault::Timeout => (RC_TIMEOUT, "kill"),
            Fault::Vanished(Some(code)) if code != 0 => (code, "exit"),
            Fault::Vanished(_) => (libc::EIO, "exit"),
        };
        error!(
            pid,
            job_id = %format!("{:x}", batch.job.job_id),
            rc,
            files = batch.files.len(),
            "Worker failed, batch recorded faulty"
        );
        self.system_sign(LogSign::Error);
        self.log_faulty(&batch.job, batch.unique, batch.creation_time, &batch.files, rc, command);

        let (files, bytes) = staged_contents(&batch.stage_dir);
        if files > 0 {
            info!(files, "Handing over files staged before the failure");
            self.hand_over(&batch, files, bytes);
        }
        self.release_files(batch.fra_pos, batch.job.job_id, &batch.files, Release::Failed);
        remove_manifest(&batch.manifest);
        self.stats.batches_faulty += 1;
    }

    /// One production line per file of a batch that produced nothing.
    fn log_faulty(&mut self, job: &Job, unique: u32, input_time: i64, files: &[SelectedFile], rc: i32, command: &str) {
        let now = now_unix();
        for file in files {
            let record = ProductionRecord {
                time: now,
                ratio: (1, 1),
                cpu: None,
                input_time,
                unique,
                split: 0,
                dir_id: job.dir_id,
                job_id: job.job_id,
                orig_name: file.name.clone(),
                orig_size: file.size,
                new_name: String::new(),
                new_size: 0,
                rc,
                command: command.to_string(),
            };
            if let Err(e) = self.production_log.write(&record) {
                error!(error = %e, "Failed to write production log");
            }
        }
    }

    /// Remove a worker's DCPL entry and decrement its directory's counter.
    fn free_slot(&mut self, batch: &RunningBatch) {
        match self.dcpl.find(batch.pid) {
            Ok(Some(pos)) => {
                if let Err(e) = self.dcpl.remove(pos) {
                    error!(pid = batch.pid, error = %e, "Failed to free process slot");
                }
            }
            Ok(None) => warn!(pid = batch.pid, "Worker not in process list"),
            Err(e) => error!(error = %e, "Failed to search process list"),
        }
        if let Err(e) = self
            .fra
            .update(batch.fra_pos, |d| d.no_of_process = (d.no_of_process - 1).max(0))
        {
            error!(fra_pos = batch.fra_pos, error = %e, "Failed to update FRA");
        }
    }

    /// Append a job message to the buffer, then tell FD through its fifo.
    fn hand_over(&mut self, batch: &RunningBatch, files: u32, bytes: u64) {
        let creation_time = if batch.creation_time > 0 {
            batch.creation_time
        } else {
            now_unix()
        };
        let msg = JobMessage {
            creation_time,
            job_id: batch.job.job_id,
            split_job_counter: 0,
            files,
            bytes,
            dir_id: batch.job.dir_id,
            unique: batch.unique,
            priority: batch.job.priority_value(),
            originator: ORIGINATOR_DIR_CHECK,
        };
        if let Err(e) = self.msg_buffer.append(&msg) {
            error!(error = %e, "Failed to store job message");
            self.system_sign(LogSign::Error);
            return;
        }
        match fifo::send(&self.fifo_dir.join(MSG_FIFO), &msg.encode()) {
            Ok(true) => {}
            Ok(false) => debug!("FD not listening, message stays buffered"),
            Err(e) => warn!(error = %e, "Failed to signal FD"),
        }
        self.stats.messages_sent += 1;
    }

    fn release_files(&mut self, fra_pos: usize, job_id: u32, files: &[SelectedFile], release: Release) {
        let source_dir = self.fra.read(fra_pos).map(|d| d.dir_path()).ok();
        for file in files {
            // an undelivered file must not count as seen on the next scan
            if let (Release::Failed, Some(key)) = (release, file.dupcheck_key) {
                self.dupstore.forget(job_id, key);
            }
            let key = (fra_pos, file.name.clone());
            let (last, shared) = match self.shared.get_mut(&key) {
                Some(refs) => {
                    *refs = refs.saturating_sub(1);
                    (*refs == 0, true)
                }
                None => (true, false),
            };
            if !last {
                continue;
            }
            if shared {
                self.shared.remove(&key);
            }
            if let Some(names) = self.in_flight.get_mut(&fra_pos) {
                names.remove(&file.name);
            }
            let unlink = match release {
                Release::Completed => shared,
                Release::Discarded => true,
                Release::Failed => false,
            };
            if let (true, Some(dir)) = (unlink, source_dir.as_ref()) {
                remove_source(&dir.join(&file.name));
            }
        }
    }

    fn housekeeping(&mut self, now: i64) {
        if self.args.supervisor_pid > 0 && !process_exists(self.args.supervisor_pid) {
            warn!(pid = self.args.supervisor_pid, "Supervisor is gone, stopping");
            self.stopping = true;
        }
        let hour = now / 3600;
        if hour != self.history_hour {
            self.history_hour = hour;
            self.update_status(|s| s.receive_log.rotate_history());
            let expired = self.dupstore.expire(now);
            debug!(expired, "Hourly housekeeping");
        }
    }

    /// Follow FSA feature changes and republished tables.
    fn observe_tables(&mut self) {
        let features = self.fsa.feature_flags();
        if features != self.fsa_features {
            let retrieve_off = features & fsa_feature::DISABLE_RETRIEVE != 0;
            info!(features, retrieve_disabled = retrieve_off, "FSA feature flags changed");
            self.fsa_features = features;
        }
        match self.fra.refresh() {
            Ok(true) => {
                info!("FRA republished, rereading job database");
                if let Err(e) = self.reread() {
                    error!(error = %e, "Failed to reread after FRA change");
                }
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to remap FRA"),
        }
        if let Err(e) = self.fsa.refresh() {
            error!(error = %e, "Failed to remap FSA");
        }
    }

    /// Scan every due directory in the current order.
    pub fn scan_dirs(&mut self) {
        let started = Instant::now();
        let mut budget = self.cfg.dir_check_timeout;
        if self.cfg.full_scan_timeout > 0 {
            budget = budget.min(self.cfg.full_scan_timeout);
        }
        let full_deadline = (budget > 0).then(|| started + Duration::from_secs(budget));
        let mut yielded = Vec::new();
        let order: Vec<usize> = self.order.iter().copied().collect();
        for fra_pos in order {
            if full_deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(budget, "Scan budget used up, remaining directories wait");
                break;
            }
            match self.scan_dir(fra_pos, full_deadline) {
                Ok(true) => yielded.push(fra_pos),
                Ok(false) => {}
                Err(e) => error!(fra_pos, error = %e, "Failed to process directory"),
            }
        }
        if !yielded.is_empty() {
            self.order.retain(|p| !yielded.contains(p));
            self.order.extend(yielded);
        }
    }

    /// Scan one directory if it is due.
    ///
    /// # Returns
    /// Whether files were left behind for the next tick.
    fn scan_dir(&mut self, fra_pos: usize, full_deadline: Option<Instant>) -> Result<bool, DaemonError> {
        let now = now_unix();
        let dir = self.fra.read(fra_pos)?;
        if dir.dir_flag.is_disabled() || !dir.is_scanned_locally() {
            return Ok(false);
        }
        let watched = self.is_watched(&dir);
        let names = if watched { self.acc.take(fra_pos) } else { Vec::new() };
        let force_due = watched
            && self.cfg.force_reread_interval > 0
            && now - self.last_full_scan.get(&fra_pos).copied().unwrap_or(0)
                >= self.cfg.force_reread_interval as i64;
        let full = if watched {
            force_due || dir.dir_flag.needs_scan()
        } else {
            now >= dir.next_check_time
        };
        if names.is_empty() && !full {
            self.check_warn_time(fra_pos, now)?;
            return Ok(false);
        }

        let per_dir = if dir.max_copied_files > 0 {
            dir.max_copied_files
        } else {
            self.cfg.max_copied_files
        };
        let mut deadline = Instant::now() + Duration::from_secs(self.cfg.one_dir_copy_timeout);
        if let Some(d) = full_deadline {
            deadline = deadline.min(d);
        }
        let limits = ScanLimits {
            max_files: per_dir.clamp(1, MAX_FILE_BUFFER_SIZE) as usize,
            deadline: Some(deadline),
            stability_window: self.cfg.file_stability_window,
            max_name_length: MAX_FILENAME_LENGTH,
        };
        let path = dir.dir_path();
        let mut partial = false;
        let db = self.jobs.load();
        let jobs = db.jobs_for_dir(fra_pos);
        let masks: Vec<&FileMasks> = jobs.iter().map(|j| &j.masks).collect();

        if !names.is_empty() {
            let outcome = {
                let empty = HashSet::new();
                let mut ctx = ScanContext {
                    locked: &self.locked,
                    accept_dot_files: dir.dir_options.accepts_dot_files(),
                    masks: &masks,
                    in_flight: self.in_flight.get(&fra_pos).unwrap_or(&empty),
                    sizes: self.sizes.entry(fra_pos).or_default(),
                    now,
                };
                collect_named(&path, &names, &limits, &mut ctx)
            };
            let left = self.process_outcome(fra_pos, &dir, outcome, now)?;
            self.fra.update(fra_pos, |d| d.dir_flag.set(DirFlag::INOTIFY_NEEDS_SCAN, left))?;
            partial |= left;
        }

        if full {
            let scanned = {
                let empty = HashSet::new();
                let mut ctx = ScanContext {
                    locked: &self.locked,
                    accept_dot_files: dir.dir_options.accepts_dot_files(),
                    masks: &masks,
                    in_flight: self.in_flight.get(&fra_pos).unwrap_or(&empty),
                    sizes: self.sizes.entry(fra_pos).or_default(),
                    now,
                };
                scan_directory(&path, &limits, &mut ctx)
            };
            let interval = if dir.time_interval > 0 {
                dir.time_interval as i64
            } else {
                self.args.rescan_time as i64
            };
            self.fra.update(fra_pos, |d| d.next_check_time = now + interval)?;
            match scanned {
                Ok(outcome) => {
                    let left = self.process_outcome(fra_pos, &dir, outcome, now)?;
                    if watched {
                        self.last_full_scan.insert(fra_pos, now);
                        self.fra
                            .update(fra_pos, |d| d.dir_flag.set(DirFlag::INOTIFY_NEEDS_SCAN, left))?;
                    }
                    partial |= left;
                }
                Err(e) => {
                    self.scan_failed(fra_pos, &dir, e, now)?;
                    return Ok(false);
                }
            }
        }

        self.fra.update(fra_pos, |d| {
            d.dir_flag.set(DirFlag::MAX_COPIED, partial);
            d.error_counter = 0;
        })?;
        self.update_status(|s| s.dir_scans = s.dir_scans.wrapping_add(1));
        self.stats.dirs_scanned += 1;
        self.check_warn_time(fra_pos, now)?;
        Ok(partial)
    }

    /// Log, select and queue the files of one scan.
    fn process_outcome(
        &mut self,
        fra_pos: usize,
        dir: &DirEntry,
        outcome: ScanOutcome,
        now: i64,
    ) -> Result<bool, DaemonError> {
        for (name, reason) in &outcome.skipped {
            if *reason == SkipReason::NameTooLong {
                warn!(
                    target: "receive_log",
                    dir = %dir.dir_alias,
                    length = name.len(),
                    "File name too long, skipped"
                );
                self.receive_sign(LogSign::Warn);
            }
        }
        let mut pool = outcome.pool;
        if pool.is_empty() {
            return Ok(outcome.partial);
        }

        let mut uniques = Vec::with_capacity(pool.len());
        for entry in pool.entries() {
            let unique = self.il_counter.next()?;
            let record = InputRecord {
                time: now,
                name: entry.name.clone(),
                size: entry.size,
                dir_id: dir.dir_id,
                unique,
            };
            if let Err(e) = self.input_log.write(&record) {
                error!(error = %e, "Failed to write input log");
            }
            uniques.push(unique);
        }
        let (count, bytes) = (pool.len() as u32, pool.total_bytes());
        self.fra.update(fra_pos, |d| {
            d.files_received = d.files_received.wrapping_add(count);
            d.bytes_received = d.bytes_received.wrapping_add(bytes);
            d.last_retrieval = now;
            d.dir_flag.remove(DirFlag::WARN_TIME_REACHED);
        })?;
        self.stats.files_found += count as u64;
        self.stats.bytes_found += bytes;

        let db = self.jobs.load();
        let jobs = db.jobs_for_dir(fra_pos);
        let path = dir.dir_path();
        let fsa = &self.fsa;
        let mut selector = Selector {
            dir: &path,
            now,
            default_age_limit: self.cfg.default_age_limit,
            dupstore: &mut self.dupstore,
        };
        let selection = selector.select(&mut pool, &jobs, |job| match fsa.read(job.fsa_pos) {
            Ok(h) if !h.accepts_batches() => HostState::Disabled,
            Ok(h) if h.host_status.is_queue_paused() => HostState::QueuePaused,
            _ => HostState::Open,
        });

        for record in &selection.deletions {
            if let Err(e) = self.delete_log.write(record) {
                error!(error = %e, "Failed to write delete log");
            }
        }
        self.stats.files_deleted += selection.unlink.len() as u64;
        for name in &selection.unlink {
            remove_source(&path.join(name));
        }
        for (entry, unique) in pool.entries().iter().zip(uniques) {
            if entry.distribution.iter().all(Vec::is_empty) {
                continue;
            }
            let record = DistributionRecord {
                time: now,
                name: entry.name.clone(),
                size: entry.size,
                dir_id: dir.dir_id,
                unique,
                columns: entry.distribution.clone(),
            };
            if let Err(e) = self.distribution_log.write(&record) {
                error!(error = %e, "Failed to write distribution log");
            }
        }
        self.queue_batches(fra_pos, selection.batches, now)?;
        Ok(outcome.partial)
    }

    /// Append batches to the pending queue, marking their files in flight.
    fn queue_batches(&mut self, fra_pos: usize, batches: Vec<Batch>, now: i64) -> Result<(), DaemonError> {
        let mut takers: HashMap<String, usize> = HashMap::new();
        for batch in &batches {
            for name in batch.names() {
                *takers.entry(name.to_string()).or_default() += 1;
            }
        }
        let in_flight = self.in_flight.entry(fra_pos).or_default();
        for (name, &count) in &takers {
            in_flight.insert(name.clone());
            if count > 1 {
                self.shared.insert((fra_pos, name.clone()), count);
            }
        }
        for batch in batches {
            let modes = batch
                .files
                .iter()
                .map(|f| {
                    if takers.get(&f.name).copied().unwrap_or(0) > 1 {
                        StageMode::Link
                    } else {
                        StageMode::Move
                    }
                })
                .collect();
            let unique = self.amg_counter.next()?;
            self.pending.push_back(PendingBatch {
                fra_pos,
                batch,
                modes,
                unique,
                creation_time: now,
            });
            self.stats.batches_queued += 1;
        }
        Ok(())
    }

    fn scan_failed(&mut self, fra_pos: usize, dir: &DirEntry, err: ScanError, now: i64) -> Result<(), DaemonError> {
        match err {
            ScanError::PermissionDenied(path) => {
                let last = self.last_access_warn.get(&fra_pos).copied().unwrap_or(0);
                if now - last >= ACCESS_WARN_INTERVAL {
                    warn!(target: "receive_log", dir = %dir.dir_alias, path = %path.display(), "Failed to access directory: permission denied");
                    self.receive_sign(LogSign::Warn);
                    self.last_access_warn.insert(fra_pos, now);
                }
            }
            ScanError::Vanished(path) => {
                error!(target: "receive_log", dir = %dir.dir_alias, path = %path.display(), "Directory does not exist, disabling it");
                self.receive_sign(LogSign::Error);
                self.fra.update(fra_pos, |d| {
                    d.dir_flag.insert(DirFlag::DIR_DISABLED);
                    d.dir_flag.insert(DirFlag::DIR_ERROR_SET);
                })?;
                return Ok(());
            }
            ScanError::Io { path, source } => {
                warn!(target: "receive_log", dir = %dir.dir_alias, path = %path.display(), error = %source, "Failed to read directory");
                self.receive_sign(LogSign::Warn);
            }
        }
        let entry = self.fra.update(fra_pos, |d| {
            d.error_counter += 1;
            d.dir_flag.insert(DirFlag::DIR_ERROR_SET);
        })?;
        if entry.error_counter >= MAX_DIR_ERRORS {
            error!(target: "receive_log", dir = %dir.dir_alias, errors = entry.error_counter, "Too many scan failures, disabling directory");
            self.receive_sign(LogSign::Error);
            self.fra.update(fra_pos, |d| d.dir_flag.insert(DirFlag::DIR_DISABLED))?;
        }
        Ok(())
    }

    fn check_warn_time(&mut self, fra_pos: usize, now: i64) -> Result<(), DaemonError> {
        if self.fra.feature_flags() & fra_feature::DISABLE_DIR_WARN_TIME != 0 {
            return Ok(());
        }
        let dir = self.fra.read(fra_pos)?;
        if dir.warn_time <= 0 || dir.dir_flag.is_warn_time_reached() {
            return Ok(());
        }
        let since = if dir.last_retrieval > 0 {
            dir.last_retrieval
        } else {
            self.started
        };
        if now - since > dir.warn_time {
            warn!(target: "receive_log", dir = %dir.dir_alias, seconds = now - since, "Warn time reached, no data received");
            self.receive_sign(LogSign::Warn);
            self.fra.update(fra_pos, |d| d.dir_flag.insert(DirFlag::WARN_TIME_REACHED))?;
        }
        Ok(())
    }

    /// Start workers for queued batches, oldest first.
    pub fn dispatch_pending(&mut self) {
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        let mut table_full = false;
        while let Some(p) = self.pending.pop_front() {
            if table_full || self.stopping {
                waiting.push_back(p);
                continue;
            }
            let dir = match self.fra.read(p.fra_pos) {
                Ok(d) => d,
                Err(e) => {
                    error!(fra_pos = p.fra_pos, error = %e, "Failed to read FRA entry");
                    waiting.push_back(p);
                    continue;
                }
            };
            let host = self.fsa.read(p.batch.job.fsa_pos).ok();
            match self.plan.check(self.dcpl.len(), &dir, host.as_ref()) {
                Eligibility::Ready => {
                    if let Some(p) = self.launch(p) {
                        waiting.push_back(p);
                    }
                }
                Eligibility::TableFull => {
                    table_full = true;
                    waiting.push_back(p);
                }
                Eligibility::DirCapReached | Eligibility::HostUnavailable => waiting.push_back(p),
            }
        }
        self.pending = waiting;
    }

    /// Claim a slot and start one worker.
    ///
    /// # Returns
    /// The batch back when it should be retried later.
    fn launch(&mut self, p: PendingBatch) -> Option<PendingBatch> {
        let job = Arc::clone(&p.batch.job);
        let now = now_unix();
        let slot = match self.dcpl.claim(p.fra_pos as u32, job.job_id, p.unique, now) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "Failed to claim process slot");
                return Some(p);
            }
        };

        let stage_dir = worker::stage_dir(&self.args.work_dir, job.job_id, p.unique);
        let manifest_path = stage_dir.with_extension("json");
        let source_dir = match self.fra.read(p.fra_pos) {
            Ok(d) => d.dir_path(),
            Err(e) => {
                error!(error = %e, "Failed to read FRA entry");
                self.abandon_slot(slot);
                return Some(p);
            }
        };
        let manifest = WorkerManifest {
            work_dir: self.args.work_dir.clone(),
            source_dir: source_dir.clone(),
            stage_dir: stage_dir.clone(),
            fin_fifo: self.fifo_dir.join(IP_FIN_FIFO),
            job_id: job.job_id,
            dir_id: job.dir_id,
            unique: p.unique,
            split: 0,
            input_time: p.creation_time,
            rename_rule: job.local_options.rename_rule.clone(),
            rule_files: rule_files(&self.cfg),
            case: job.local_options.case,
            files: p
                .batch
                .files
                .iter()
                .zip(&p.modes)
                .map(|(f, &mode)| ManifestFile {
                    name: f.name.clone(),
                    size: f.size,
                    mode,
                })
                .collect(),
        };
        let nice = self.plan.nice_value(job.priority_value());
        let spawned = start_worker(&self.worker_program, &manifest, &manifest_path, nice);

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(
                    program = %self.worker_program.display(),
                    job_id = %format!("{:x}", job.job_id),
                    error = %e,
                    "Failed to start worker"
                );
                self.system_sign(LogSign::Error);
                self.abandon_slot(slot);
                let rc = match &e {
                    DaemonError::Io(io) => io.raw_os_error().unwrap_or(libc::EIO),
                    _ => libc::EIO,
                };
                self.log_faulty(&job, p.unique, p.creation_time, &p.batch.files, rc, "exec");
                self.release_files(p.fra_pos, p.batch.job.job_id, &p.batch.files, Release::Failed);
                remove_manifest(&manifest_path);
                self.stats.batches_faulty += 1;
                return None;
            }
        };

        let launch = Launch {
            job: Arc::clone(&job),
            fra_pos: p.fra_pos,
            unique: p.unique,
            creation_time: p.creation_time,
            source_dir,
            stage_dir,
            manifest: manifest_path,
            files: p.batch.files,
            timeout: self.plan.exec_timeout_for(&job),
        };
        let Some(pid) = self.pool.insert(child, launch) else {
            warn!("Worker exited before it could be tracked");
            self.abandon_slot(slot);
            return None;
        };
        if let Err(e) = self.dcpl.set_pid(slot, pid) {
            error!(pid, error = %e, "Failed to record worker pid");
        }
        if let Err(e) = self.fra.update(p.fra_pos, |d| d.no_of_process += 1) {
            error!(error = %e, "Failed to update FRA");
        }
        self.update_status(|s| s.amg_fork_counter = s.amg_fork_counter.wrapping_add(1));
        self.stats.batches_dispatched += 1;
        debug!(pid, job_id = %format!("{:x}", job.job_id), unique = p.unique, "Worker started");
        None
    }

    fn abandon_slot(&mut self, slot: usize) {
        if let Err(e) = self.dcpl.remove(slot) {
            error!(slot, error = %e, "Failed to release claimed slot");
        }
    }

    fn account_child_cpu(&mut self) {
        let Some((user, system)) = children_cpu() else {
            return;
        };
        let (du, ds) = (cpu_delta(user, self.child_cpu.0), cpu_delta(system, self.child_cpu.1));
        self.child_cpu = (user, system);
        self.update_status(|s| {
            s.amg_child_utime.add(du);
            s.amg_child_stime.add(ds);
        });
    }

    fn update_status<F: FnOnce(&mut AfdStatus)>(&mut self, f: F) {
        if let Err(e) = self.status.update(0, f) {
            error!(error = %e, "Failed to update AFD status");
        }
    }

    fn receive_sign(&mut self, sign: LogSign) {
        self.update_status(|s| s.receive_log.push(sign));
    }

    fn system_sign(&mut self, sign: LogSign) {
        self.update_status(|s| s.system_log.push(sign));
    }

    /// Current queue and worker state.
    pub fn snapshot(&self, now: i64) -> QueueSnapshot {
        let db = self.jobs.load();
        QueueSnapshot {
            timestamp: now,
            pending: self
                .pending
                .iter()
                .map(|p| QueuedBatch {
                    job_id: p.batch.job.job_id,
                    dir_alias: db
                        .get(p.batch.job.job_id)
                        .map(|j| j.dir_alias.clone())
                        .unwrap_or_else(|| p.batch.job.dir_alias.clone()),
                    unique: p.unique,
                    files: p.batch.files.len(),
                    bytes: p.batch.total_bytes(),
                    creation_time: p.creation_time,
                })
                .collect(),
            running: self
                .pool
                .batches()
                .map(|b| RunningWorker {
                    pid: b.pid,
                    job_id: b.job.job_id,
                    fra_pos: b.fra_pos,
                    unique: b.unique,
                    files: b.files.len(),
                    adopted: b.is_adopted(),
                })
                .collect(),
            stats: self.stats.clone(),
        }
    }

    fn write_queue_list(&self, now: i64) {
        let path = self.fifo_dir.join(QUEUE_LIST_FILE);
        if let Err(e) = self.snapshot(now).write(&path) {
            warn!(error = %e, "Failed to write queue list");
            return;
        }
        if let Err(e) = fifo::send(&self.fifo_dir.join(QUEUE_LIST_DONE_FIFO), &[ACKN]) {
            warn!(error = %e, "Failed to signal queue list");
        }
    }

    fn flush(&self) {
        if let Err(e) = self.fra.flush() {
            warn!(error = %e, "Failed to flush FRA");
        }
        if let Err(e) = self.status.flush() {
            warn!(error = %e, "Failed to flush AFD status");
        }
        if let Err(e) = self.dcpl.flush() {
            warn!(error = %e, "Failed to flush process list");
        }
    }

    /// Stop dispatching, wait for running workers up to the grace period,
    /// terminate the rest and write the checkpoint.
    pub async fn shutdown(&mut self, fifos: &mut Fifos) -> Result<(), DaemonError> {
        self.stopping = true;
        info!(running = self.pool.len(), pending = self.pending.len(), "Stopping dir_check");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.cfg.shutdown_grace);
        while !self.pool.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::select! {
                r = fifos.fin.read_some(&mut fifos.fin_buf) => {
                    if let Err(e) = r {
                        warn!(error = %e, "Failed to read ip_fin");
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            self.handle_finished(fifos);
            self.reap(fifos);
        }
        if !self.pool.is_empty() {
            warn!(running = self.pool.len(), "Grace period over, terminating workers");
            self.pool.terminate_all(Signal::SIGTERM);
            let pids: Vec<i32> = self.pool.batches().map(|b| b.pid).collect();
            for pid in pids {
                self.fault(pid, Fault::Vanished(None));
            }
        }
        for p in std::mem::take(&mut self.pending) {
            self.release_files(p.fra_pos, p.batch.job.job_id, &p.batch.files, Release::Failed);
        }
        self.checkpoint()
    }

    /// Write the system-data checkpoint and the dupcheck store.
    pub fn checkpoint(&mut self) -> Result<(), DaemonError> {
        self.update_status(|s| s.dir_check_pid = 0);
        let status = self.status.read(0)?;
        let mut data = SystemData::capture(&status, self.fsa.feature_flags(), self.fra.feature_flags());
        data.comments = self.checkpoint_comments.clone();
        data.write(&self.fifo_dir.join(SYSTEM_DATA_FILE))?;
        self.dupstore.save(&self.fifo_dir.join(DUPCHECK_FILE))?;
        self.flush();
        info!("dir_check stopped");
        Ok(())
    }
}

/// Store the manifest next to the stage dir and exec the worker on it.
fn start_worker(
    program: &Path,
    manifest: &WorkerManifest,
    manifest_path: &Path,
    nice: Option<i32>,
) -> Result<tokio::process::Child, DaemonError> {
    if let Some(parent) = manifest_path.parent() {
        fs::create_dir_all(parent)?;
    }
    manifest.store(manifest_path)?;
    Ok(spawn_worker(program, manifest_path, nice)?)
}

fn rule_files(cfg: &DirCheckConfig) -> Vec<String> {
    cfg.bul_rule_file_name
        .iter()
        .chain(cfg.rep_rule_file_name.iter())
        .cloned()
        .collect()
}

/// Load rename rules and warn about jobs naming a rule that does not exist.
fn load_rules(work_dir: &Path, cfg: &DirCheckConfig, db: &JobDb) -> RuleSet {
    let files = rule_files(cfg);
    let extra: Vec<&str> = files.iter().map(String::as_str).collect();
    let rules = match RuleSet::load(&work_dir.join(ETC_DIR), &extra) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(error = %e, "Failed to load rename rules");
            return RuleSet::default();
        }
    };
    for job in db.iter() {
        if let Some(rule) = &job.local_options.rename_rule {
            if !rules.contains(rule) {
                warn!(job_id = %format!("{:x}", job.job_id), rule = %rule, "Unknown rename rule, files keep their names");
            }
        }
    }
    rules
}

fn worker_program(cfg: &DirCheckConfig) -> PathBuf {
    if let Some(program) = &cfg.dc_worker_program {
        return program.clone();
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DC_WORKER_PROGRAM)))
        .unwrap_or_else(|| PathBuf::from(DC_WORKER_PROGRAM))
}

fn remove_source(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove file"),
    }
}

fn remove_manifest(manifest: &Path) {
    if manifest.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = fs::remove_file(manifest) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %manifest.display(), error = %e, "Failed to remove manifest");
        }
    }
}

/// Files already in a stage directory, and their bytes.
fn staged_contents(stage_dir: &Path) -> (u32, u64) {
    let Ok(entries) = fs::read_dir(stage_dir) else {
        return (0, 0);
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .fold((0, 0), |(n, b), m| (n + 1, b + m.len()))
}

fn children_cpu() -> Option<(CpuTime, CpuTime)> {
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    let user = CpuTime {
        sec: usage.user_time().tv_sec() as i64,
        usec: usage.user_time().tv_usec() as i64,
    };
    let system = CpuTime {
        sec: usage.system_time().tv_sec() as i64,
        usec: usage.system_time().tv_usec() as i64,
    };
    Some((user, system))
}

fn cpu_delta(new: CpuTime, old: CpuTime) -> CpuTime {
    let micros = ((new.sec - old.sec) * 1_000_000 + (new.usec - old.usec)).max(0);
    CpuTime {
        sec: micros / 1_000_000,
        usec: micros % 1_000_000,
    }
}

async fn next_event(watcher: &mut Option<DirWatcher>) -> Option<notify::Result<notify::Event>> {
    match watcher {
        Some(w) => w.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
