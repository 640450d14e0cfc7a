//! Dir-check process list: the mapped table of running batch workers.
//!
//! The header count is `no_of_process`; entries `0..count` are in use and
//! the table is kept dense by collapsing the tail on every removal.

use crate::tables::codec::{FieldReader, FieldWriter};
use crate::tables::mapped::{MappedTable, Record, SizePolicy, TableError};
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const DCPL_FILE: &str = "dc_proc_list";
pub const DCPL_VERSION: u8 = 1;

/// Pid written while a slot is claimed but its worker is not started yet.
pub const PID_CLAIMED: i32 = -1;

#[derive(Debug, Error)]
pub enum DcplError {
    #[error("process list: {0}")]
    Table(#[from] TableError),

    #[error("process list is full ({capacity} slots)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: i32,
    pub fra_pos: u32,
    pub job_id: u32,
    pub unique_number: u32,
    pub start_time: i64,
}

impl Record for ProcEntry {
    const TABLE: &'static str = "DCPL";
    const SIZE: usize = 4 * 4 + 8;
    const VERSION: u8 = DCPL_VERSION;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.put_i32(self.pid);
        w.put_u32(self.fra_pos);
        w.put_u32(self.job_id);
        w.put_u32(self.unique_number);
        w.put_i64(self.start_time);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            pid: r.get_i32(),
            fra_pos: r.get_u32(),
            job_id: r.get_u32(),
            unique_number: r.get_u32(),
            start_time: r.get_i64(),
        }
    }
}

/// Owned handle on the DCPL mapping. Only dir_check writes to it.
#[derive(Debug)]
pub struct ProcessList {
    table: MappedTable<ProcEntry>,
}

impl ProcessList {
    /// Attach to the list left by a previous run, or create an empty one.
    ///
    /// The list always has room for `max_process + 1` entries; a list of a
    /// different size is rebuilt keeping its in-use entries.
    ///
    /// # Arguments
    /// * `path` - Location of the `dc_proc_list` file
    /// * `max_process` - Configured worker limit
    pub fn open(path: &Path, max_process: usize) -> Result<Self, DcplError> {
        let capacity = max_process + 1;
        let table = match MappedTable::<ProcEntry>::attach(path, SizePolicy::Capacity) {
            Ok(table) if table.capacity() == capacity => table,
            Ok(old) => {
                let kept = old.records()?;
                info!(
                    old = old.capacity(),
                    new = capacity,
                    kept = kept.len(),
                    "Resizing process list"
                );
                drop(old);
                let mut table = MappedTable::create_list(path, capacity, 0)?;
                for (i, entry) in kept.iter().take(capacity).enumerate() {
                    table.write(i, entry)?;
                }
                table.set_len(kept.len().min(capacity))?;
                table
            }
            Err(TableError::NotFound { .. }) => MappedTable::create_list(path, capacity, 0)?,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { table })
    }

    /// Number of entries in use (`no_of_process`).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn entries(&self) -> Result<Vec<ProcEntry>, DcplError> {
        Ok(self.table.records()?)
    }

    pub fn get(&self, pos: usize) -> Result<ProcEntry, DcplError> {
        Ok(self.table.read(pos)?)
    }

    /// Reserve the next slot with `pid = -1`.
    ///
    /// # Returns
    /// * `Ok(pos)` - Position of the claimed slot
    /// * `Err(DcplError::Full)` - All slots are in use
    pub fn claim(
        &mut self,
        fra_pos: u32,
        job_id: u32,
        unique_number: u32,
        start_time: i64,
    ) -> Result<usize, DcplError> {
        let pos = self.len();
        if pos >= self.capacity() {
            return Err(DcplError::Full {
                capacity: self.capacity(),
            });
        }
        self.table.write(
            pos,
            &ProcEntry {
                pid: PID_CLAIMED,
                fra_pos,
                job_id,
                unique_number,
                start_time,
            },
        )?;
        self.table.set_len(pos + 1)?;
        Ok(pos)
    }

    /// Record the real pid of a claimed slot.
    pub fn set_pid(&mut self, pos: usize, pid: i32) -> Result<(), DcplError> {
        self.table.update(pos, |e| e.pid = pid)?;
        Ok(())
    }

    pub fn set_fra_pos(&mut self, pos: usize, fra_pos: u32) -> Result<(), DcplError> {
        self.table.update(pos, |e| e.fra_pos = fra_pos)?;
        Ok(())
    }

    pub fn find(&self, pid: i32) -> Result<Option<usize>, DcplError> {
        for pos in 0..self.len() {
            if self.table.read(pos)?.pid == pid {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Remove one entry and move the tail down by one.
    pub fn remove(&mut self, pos: usize) -> Result<ProcEntry, DcplError> {
        let len = self.len();
        let removed = self.table.read(pos)?;
        for i in pos..len.saturating_sub(1) {
            let next = self.table.read(i + 1)?;
            self.table.write(i, &next)?;
        }
        if len > 0 {
            self.table.write(len - 1, &ProcEntry::default())?;
            self.table.set_len(len - 1)?;
        }
        Ok(removed)
    }

    /// Drop every entry for which `keep` returns false, preserving order.
    pub fn retain<F>(&mut self, mut keep: F) -> Result<Vec<ProcEntry>, DcplError>
    where
        F: FnMut(&ProcEntry) -> bool,
    {
        let mut dropped = Vec::new();
        let mut pos = 0;
        while pos < self.len() {
            let entry = self.table.read(pos)?;
            if keep(&entry) {
                pos += 1;
            } else {
                dropped.push(self.remove(pos)?);
            }
        }
        Ok(dropped)
    }

    pub fn flush(&self) -> Result<(), DcplError> {
        Ok(self.table.flush()?)
    }
}
