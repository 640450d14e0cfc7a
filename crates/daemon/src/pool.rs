//! Per-scan file-name pool and the per-file distribution record.

use std::collections::HashSet;

pub const NO_OF_DISTRIBUTION_TYPES: usize = 6;

/// Why a job did or did not receive a file; one distribution-log column each.
///
/// Column 1 belongs to time jobs, which dir_check never creates; it is
/// written empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionType {
    Normal = 0,
    QueueStopped = 2,
    Disabled = 3,
    AgeLimitDelete = 4,
    Dupcheck = 5,
}

impl DistributionType {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Job ids per distribution type.
    pub distribution: [Vec<u32>; NO_OF_DISTRIBUTION_TYPES],
}

impl PoolEntry {
    pub fn new(name: String, size: u64, mtime: i64) -> Self {
        Self {
            name,
            size,
            mtime,
            distribution: Default::default(),
        }
    }

    pub fn distribute(&mut self, kind: DistributionType, job_id: u32) {
        let column = &mut self.distribution[kind.index()];
        if !column.contains(&job_id) {
            column.push(job_id);
        }
    }

    /// Whether any job takes this file for transfer, held or not.
    pub fn is_taken(&self) -> bool {
        [DistributionType::Normal, DistributionType::QueueStopped]
            .iter()
            .any(|kind| !self.distribution[kind.index()].is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Added,
    Duplicate,
    Full,
}

/// Bounded staging area filled by one scan of one directory.
#[derive(Debug, Clone)]
pub struct FilePool {
    capacity: usize,
    entries: Vec<PoolEntry>,
    names: HashSet<String>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
            names: HashSet::new(),
        }
    }

    pub fn push(&mut self, name: String, size: u64, mtime: i64) -> PushResult {
        if self.names.contains(&name) {
            return PushResult::Duplicate;
        }
        if self.is_full() {
            return PushResult::Full;
        }
        self.names.insert(name.clone());
        self.entries.push(PoolEntry::new(name, size, mtime));
        PushResult::Added
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [PoolEntry] {
        &mut self.entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.names.clear();
    }
}
