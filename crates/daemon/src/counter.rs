//! File-backed counters shared between processes (AMG counter, input-log
//! unique id).
//!
//! The file holds one little-endian 32-bit integer. Every increment takes an
//! exclusive `flock` for the read-modify-write, so callers cannot forget it.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const AMG_COUNTER_FILE: &str = "amg_counter";
pub const INPUT_LOG_COUNTER_FILE: &str = "il_counter";

/// Next value after `current`, wrapping within `[0, i32::MAX]`.
pub fn next_value(current: i32) -> i32 {
    if current < 0 || current == i32::MAX {
        0
    } else {
        current + 1
    }
}

#[derive(Debug)]
pub struct Counter {
    path: PathBuf,
    file: File,
}

impl Counter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically increment the stored value and return the new one.
    pub fn next(&mut self) -> io::Result<u32> {
        self.file.lock_exclusive()?;
        let result = self.increment_locked();
        let unlocked = FileExt::unlock(&self.file);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    fn increment_locked(&mut self) -> io::Result<u32> {
        let current = self.read_locked()?;
        let next = next_value(current);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&next.to_le_bytes())?;
        self.file.flush()?;
        Ok(next as u32)
    }

    fn read_locked(&mut self) -> io::Result<i32> {
        let mut bytes = [0u8; 4];
        self.file.seek(SeekFrom::Start(0))?;
        let mut filled = 0;
        while filled < bytes.len() {
            match self.file.read(&mut bytes[filled..])? {
                0 => return Ok(0),
                n => filled += n,
            }
        }
        Ok(i32::from_le_bytes(bytes))
    }

    /// Current value without incrementing.
    pub fn current(&mut self) -> io::Result<i32> {
        self.file.lock_shared()?;
        let result = self.read_locked();
        FileExt::unlock(&self.file)?;
        result
    }
}
