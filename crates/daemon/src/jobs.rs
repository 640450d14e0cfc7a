//! Job database built from the compiled DIR_CONFIG.
//!
//! One job per (directory, recipient) pair. The database is immutable once
//! built; a reload builds a fresh one and swaps it in, while batches still
//! in flight keep the `Arc<Job>` they were created with.

use crate::filter::FileMasks;
use crate::options::LocalOptions;
use crate::tables::flags::ProtocolSet;
use crate::tables::fra::DirEntry;
use crate::tables::fsa::{HostEntry, MAX_HOSTNAME_LENGTH};
use afd_config::DirCheckConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const COMPILED_DIR_CONFIG_FILE: &str = "compiled_dir_config.json";

/// Sub-field separator used in ids and log lines.
pub const SEPARATOR_CHAR: char = '\x03';

#[derive(Debug, Error)]
pub enum JobDbError {
    #[error("Failed to read compiled DIR_CONFIG: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed compiled DIR_CONFIG: {0}")]
    Json(#[from] serde_json::Error),
}

/// Compiled DIR_CONFIG as produced by AMG.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledConfig {
    #[serde(default)]
    pub directories: Vec<CompiledDir>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledDir {
    pub dir_alias: String,
    #[serde(default)]
    pub jobs: Vec<CompiledJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledJob {
    pub file_masks: Vec<String>,
    pub recipient: String,
    #[serde(default)]
    pub host_alias: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: char,
    #[serde(default)]
    pub local_options: Vec<String>,
    #[serde(default)]
    pub standard_options: Vec<String>,
}

fn default_priority() -> char {
    '9'
}

/// Parts of a recipient URL `scheme://[user[:pw]@]host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Recipient {
    pub fn parse(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        if scheme.is_empty() {
            return None;
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (credentials, hostport) = match authority.rfind('@') {
            Some(i) => (Some(&authority[..i]), &authority[i + 1..]),
            None => (None, authority),
        };
        let (user, password) = match credentials {
            Some(c) => match c.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(c.to_string()), None),
            },
            None => (None, None),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse().ok()?)),
            None => (hostport, None),
        };
        Some(Self {
            scheme: scheme.to_string(),
            user,
            password,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Host alias derived from the host name, cut to fit the FSA field.
    pub fn default_host_alias(&self) -> String {
        self.host.chars().take(MAX_HOSTNAME_LENGTH - 1).collect()
    }
}

/// Derive the stable job id from everything that defines a job.
pub fn derive_job_id(dir_path: &str, job: &CompiledJob) -> u32 {
    let priority = job.priority.to_string();
    let fields = std::iter::once(dir_path)
        .chain(std::iter::once(priority.as_str()))
        .chain(job.file_masks.iter().map(String::as_str))
        .chain(job.local_options.iter().map(String::as_str))
        .chain(job.standard_options.iter().map(String::as_str))
        .chain(std::iter::once(job.recipient.as_str()));
    let joined: Vec<&str> = fields.collect();
    crc32fast::hash(joined.join(&SEPARATOR_CHAR.to_string()).as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: u32,
    pub dir_id: u32,
    pub fra_pos: usize,
    pub fsa_pos: usize,
    pub dir_alias: String,
    pub host_alias: String,
    pub protocol: ProtocolSet,
    pub priority: char,
    pub masks: FileMasks,
    pub local_options: LocalOptions,
    pub standard_options: Vec<String>,
    pub recipient: String,
}

impl Job {
    /// Priority digit as a number, 9 when not a digit.
    pub fn priority_value(&self) -> u8 {
        self.priority.to_digit(10).map(|d| d as u8).unwrap_or(9)
    }
}

/// The active set of jobs, indexed by id and by directory.
#[derive(Debug, Default)]
pub struct JobDb {
    jobs: Vec<Arc<Job>>,
    by_id: HashMap<u32, usize>,
    by_dir: BTreeMap<usize, Vec<usize>>,
}

impl JobDb {
    /// Read and build the database from `<fifo>/compiled_dir_config.json`.
    pub fn load(
        path: &Path,
        fra: &[DirEntry],
        fsa: &[HostEntry],
        cfg: &DirCheckConfig,
    ) -> Result<Self, JobDbError> {
        let content = fs::read_to_string(path)?;
        let compiled: CompiledConfig = serde_json::from_str(&content)?;
        Ok(Self::build(&compiled, fra, fsa, cfg))
    }

    /// Build the database, resolving directories against the FRA and hosts
    /// against the FSA.
    ///
    /// Jobs whose directory or host is unknown are logged and left out;
    /// entries that derive an already present job id are merged into it.
    pub fn build(
        compiled: &CompiledConfig,
        fra: &[DirEntry],
        fsa: &[HostEntry],
        cfg: &DirCheckConfig,
    ) -> Self {
        let mut db = JobDb::default();
        for dir in &compiled.directories {
            let Some(fra_pos) = fra.iter().position(|d| d.dir_alias == dir.dir_alias) else {
                warn!(dir_alias = %dir.dir_alias, "Directory not in FRA, ignoring its jobs");
                continue;
            };
            let entry = &fra[fra_pos];
            for job in &dir.jobs {
                let Some(recipient) = Recipient::parse(&job.recipient) else {
                    warn!(dir_alias = %dir.dir_alias, "Unparsable recipient, job ignored");
                    continue;
                };
                let Some(protocol) = ProtocolSet::from_scheme(&recipient.scheme) else {
                    warn!(scheme = %recipient.scheme, "Unknown scheme, job ignored");
                    continue;
                };
                let host_alias = job
                    .host_alias
                    .clone()
                    .unwrap_or_else(|| recipient.default_host_alias());
                let Some(fsa_pos) = fsa.iter().position(|h| h.host_alias == host_alias) else {
                    warn!(host_alias = %host_alias, "Host not in FSA, job ignored");
                    continue;
                };
                let job_id = derive_job_id(&entry.path, job);
                if db.by_id.contains_key(&job_id) {
                    debug!(job_id = %format!("{:x}", job_id), "Merged duplicate job");
                    continue;
                }
                db.insert(Job {
                    job_id,
                    dir_id: entry.dir_id,
                    fra_pos,
                    fsa_pos,
                    dir_alias: dir.dir_alias.clone(),
                    host_alias,
                    protocol,
                    priority: job.priority,
                    masks: FileMasks::new(job.file_masks.clone()),
                    local_options: LocalOptions::parse(
                        &job.local_options,
                        cfg.dupcheck_default_timeout,
                    ),
                    standard_options: job.standard_options.clone(),
                    recipient: job.recipient.clone(),
                });
            }
        }
        info!(jobs = db.len(), dirs = db.by_dir.len(), "Job database built");
        db
    }

    fn insert(&mut self, job: Job) {
        let idx = self.jobs.len();
        self.by_id.insert(job.job_id, idx);
        self.by_dir.entry(job.fra_pos).or_default().push(idx);
        self.jobs.push(Arc::new(job));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, job_id: u32) -> Option<&Arc<Job>> {
        self.by_id.get(&job_id).map(|&i| &self.jobs[i])
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.by_id.contains_key(&job_id)
    }

    /// Jobs attached to one directory, in configuration order.
    pub fn jobs_for_dir(&self, fra_pos: usize) -> Vec<Arc<Job>> {
        self.by_dir
            .get(&fra_pos)
            .map(|idxs| idxs.iter().map(|&i| self.jobs[i].clone()).collect())
            .unwrap_or_default()
    }

    /// FRA positions that have at least one job, ascending.
    pub fn dirs(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_dir.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.jobs.iter()
    }
}

/// Handle on the active job database; replaced wholesale on reload.
#[derive(Debug)]
pub struct ActiveJobDb {
    current: ArcSwap<JobDb>,
}

impl ActiveJobDb {
    pub fn new(db: JobDb) -> Self {
        Self {
            current: ArcSwap::from_pointee(db),
        }
    }

    /// Snapshot of the current database.
    pub fn load(&self) -> Arc<JobDb> {
        self.current.load_full()
    }

    /// Install a new database; snapshots already taken stay valid.
    pub fn swap(&self, db: JobDb) -> Arc<JobDb> {
        self.current.swap(Arc::new(db))
    }
}
