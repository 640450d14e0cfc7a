//! Fileretrieve status area: one record per watched directory.

use crate::tables::codec::{FieldReader, FieldWriter};
use crate::tables::flags::{DirFlag, DirOptions, ProtocolSet};
use crate::tables::fsa::MAX_HOSTNAME_LENGTH;
use crate::tables::mapped::Record;
use std::path::{Path, PathBuf};

pub const FRA_FILE: &str = "fra.status";
pub const FRA_VERSION: u8 = 7;

pub const MAX_DIR_ALIAS_LENGTH: usize = 16;
pub const MAX_PATH_LENGTH: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub dir_id: u32,
    pub dir_alias: String,
    pub path: String,
    /// Host a retrieve directory fetches from; empty for local dirs.
    pub host_alias: String,
    pub protocol: ProtocolSet,
    pub dir_options: DirOptions,
    pub dir_flag: DirFlag,
    pub max_copied_files: u32,
    /// Per-directory worker cap; 0 means only the global limit applies.
    pub max_process: u32,
    pub no_of_process: i32,
    /// Fixed rescan interval in seconds; 0 means no schedule.
    pub time_interval: u32,
    pub files_received: u32,
    pub error_counter: u32,
    pub next_check_time: i64,
    /// Seconds without input before the directory is flagged; 0 disables.
    pub warn_time: i64,
    pub last_retrieval: i64,
    pub bytes_received: u64,
}

impl DirEntry {
    pub fn new(dir_id: u32, dir_alias: &str, path: &Path) -> Self {
        Self {
            dir_id,
            dir_alias: dir_alias.to_string(),
            path: path.to_string_lossy().into_owned(),
            protocol: ProtocolSet::LOC,
            ..Default::default()
        }
    }

    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Directories owned by a retrieving daemon are never scanned here.
    pub fn is_scanned_locally(&self) -> bool {
        self.protocol.is_local() && !self.dir_options.is_remote_only()
    }

    /// Whether a filesystem watch replaces periodic scans for this dir.
    pub fn is_watch_driven(&self) -> bool {
        self.dir_options.wants_inotify()
            && self.time_interval == 0
            && !self.dir_options.is_force_reread()
    }

    /// Whether the per-directory cap allows one more worker.
    pub fn has_process_room(&self) -> bool {
        self.max_process == 0 || self.no_of_process < self.max_process as i32
    }
}

impl Record for DirEntry {
    const TABLE: &'static str = "FRA";
    const SIZE: usize = 4
        + MAX_DIR_ALIAS_LENGTH
        + MAX_PATH_LENGTH
        + MAX_HOSTNAME_LENGTH
        + 9 * 4
        + 4 * 8;
    const VERSION: u8 = FRA_VERSION;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.put_u32(self.dir_id);
        w.put_str(&self.dir_alias, MAX_DIR_ALIAS_LENGTH);
        w.put_str(&self.path, MAX_PATH_LENGTH);
        w.put_str(&self.host_alias, MAX_HOSTNAME_LENGTH);
        w.put_u32(self.protocol.bits());
        w.put_u32(self.dir_options.bits());
        w.put_u32(self.dir_flag.bits());
        w.put_u32(self.max_copied_files);
        w.put_u32(self.max_process);
        w.put_i32(self.no_of_process.max(0));
        w.put_u32(self.time_interval);
        w.put_u32(self.files_received);
        w.put_u32(self.error_counter);
        w.put_i64(self.next_check_time);
        w.put_i64(self.warn_time);
        w.put_i64(self.last_retrieval);
        w.put_u64(self.bytes_received);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            dir_id: r.get_u32(),
            dir_alias: r.get_str(MAX_DIR_ALIAS_LENGTH),
            path: r.get_str(MAX_PATH_LENGTH),
            host_alias: r.get_str(MAX_HOSTNAME_LENGTH),
            protocol: ProtocolSet::from_bits(r.get_u32()),
            dir_options: DirOptions::from_bits(r.get_u32()),
            dir_flag: DirFlag::from_bits(r.get_u32()),
            max_copied_files: r.get_u32(),
            max_process: r.get_u32(),
            no_of_process: r.get_i32(),
            time_interval: r.get_u32(),
            files_received: r.get_u32(),
            error_counter: r.get_u32(),
            next_check_time: r.get_i64(),
            warn_time: r.get_i64(),
            last_retrieval: r.get_i64(),
            bytes_received: r.get_u64(),
        }
    }
}
