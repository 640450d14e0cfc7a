//! Typed views over memory-mapped, word-offset-headered tables.
//!
//! Layout of every table file:
//!
//! ```text
//! 0..4   record count (u32 LE)
//! 4      pad
//! 5      feature flags
//! 6      struct version
//! 7      layout id
//! 8..    slots: epoch (u32 LE), 4 pad bytes, record payload, padded to 8
//! ```
//!
//! Each record is owned by exactly one writer process. The slot epoch is a
//! seqlock: the owner makes it odd before touching the payload and even
//! again afterwards, readers retry until they see the same even value on
//! both sides of their copy.

use crate::tables::codec::{FieldReader, FieldWriter};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of the word-offset header in front of the records.
pub const WORD_OFFSET: usize = 8;

const SLOT_PREFIX: usize = 8;
const MAX_READ_RETRIES: usize = 1000;

/// A fixed-size record stored in a mapped table.
pub trait Record: Sized {
    /// Table name used in log lines and in the layout id.
    const TABLE: &'static str;
    /// Payload size in bytes.
    const SIZE: usize;
    /// Struct version compiled into this binary.
    const VERSION: u8;

    fn encode(&self, w: &mut FieldWriter<'_>);
    fn decode(r: &mut FieldReader<'_>) -> Self;
}

/// Bytes occupied by one record including its epoch prefix.
pub fn slot_size<R: Record>() -> usize {
    (SLOT_PREFIX + R::SIZE + 7) & !7
}

/// Layout checksum stored in header byte 7.
pub fn layout_id<R: Record>() -> u8 {
    let descriptor = format!("{}:{}:{}", R::TABLE, R::SIZE, R::VERSION);
    (crc32fast::hash(descriptor.as_bytes()) & 0xff) as u8
}

/// Errors raised while attaching to or accessing a table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("{table}: {path} not published")]
    NotFound { table: &'static str, path: PathBuf },

    #[error("{table}: incorrect version {found}, expected {expected}")]
    VersionMismatch {
        table: &'static str,
        found: u8,
        expected: u8,
    },

    #[error("{table}: layout id {found:#04x} does not match {expected:#04x}")]
    LayoutMismatch {
        table: &'static str,
        found: u8,
        expected: u8,
    },

    #[error("{table}: file is {actual} bytes, header requires {expected}")]
    SizeMismatch {
        table: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("{table}: position {pos} out of range ({count})")]
    OutOfRange {
        table: &'static str,
        pos: usize,
        count: usize,
    },

    #[error("{table}: no free slot (capacity {capacity})")]
    Full { table: &'static str, capacity: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TableError {
    /// Only a missing file is worth waiting for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TableError::NotFound { .. })
    }
}

/// Decoded word-offset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    pub count: u32,
    pub feature_flags: u8,
    pub version: u8,
    pub layout_id: u8,
}

impl TableHeader {
    pub fn decode(bytes: &[u8]) -> Self {
        let mut r = FieldReader::new(&bytes[..WORD_OFFSET]);
        let count = r.get_u32();
        r.skip(1);
        Self {
            count,
            feature_flags: r.get_u8(),
            version: r.get_u8(),
            layout_id: r.get_u8(),
        }
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        let mut w = FieldWriter::new(&mut bytes[..WORD_OFFSET]);
        w.put_u32(self.count);
        w.skip(1);
        w.put_u8(self.feature_flags);
        w.put_u8(self.version);
        w.put_u8(self.layout_id);
    }
}

/// How the file length relates to the header count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    /// Length is exactly header plus `count` slots (FSA, FRA, AFD_STATUS).
    Exact,
    /// Length fixes the capacity; `count` only says how many are in use (DCPL).
    Capacity,
}

/// Bounded exponential backoff for attaching to a table that the
/// supervisor has not published yet.
#[derive(Debug, Clone)]
pub struct AttachRetry {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for AttachRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// A memory-mapped table of `R` records.
pub struct MappedTable<R: Record> {
    path: PathBuf,
    mmap: MmapMut,
    policy: SizePolicy,
    capacity: usize,
    inode: u64,
    _marker: PhantomData<R>,
}

impl<R: Record> std::fmt::Debug for MappedTable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedTable")
            .field("table", &R::TABLE)
            .field("path", &self.path)
            .field("count", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<R: Record> MappedTable<R> {
    /// Publish a new table holding `records`.
    ///
    /// The file is written next to its final name and renamed into place so
    /// an attaching reader never sees a half-written table.
    pub fn create(path: &Path, records: &[R], feature_flags: u8) -> Result<Self, TableError> {
        Self::publish(path, records, records.len(), feature_flags)?;
        Self::attach(path, SizePolicy::Exact)
    }

    /// Publish an empty list table with room for `capacity` records.
    pub fn create_list(path: &Path, capacity: usize, feature_flags: u8) -> Result<Self, TableError> {
        Self::publish(path, &[], capacity, feature_flags)?;
        Self::attach(path, SizePolicy::Capacity)
    }

    fn publish(
        path: &Path,
        records: &[R],
        capacity: usize,
        feature_flags: u8,
    ) -> Result<(), TableError> {
        let slot = slot_size::<R>();
        let mut bytes = vec![0u8; WORD_OFFSET + capacity * slot];
        TableHeader {
            count: records.len() as u32,
            feature_flags,
            version: R::VERSION,
            layout_id: layout_id::<R>(),
        }
        .encode(&mut bytes);
        for (i, record) in records.iter().enumerate() {
            let off = WORD_OFFSET + i * slot + SLOT_PREFIX;
            record.encode(&mut FieldWriter::new(&mut bytes[off..off + R::SIZE]));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(table = R::TABLE, path = %path.display(), capacity, "Published table");
        Ok(())
    }

    /// Attach to an existing table, validating the header once.
    pub fn attach(path: &Path, policy: SizePolicy) -> Result<Self, TableError> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TableError::NotFound {
                    table: R::TABLE,
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        // SAFETY: the mapping is only accessed through bounds-checked slices
        // and the seqlock protocol above; concurrent writers are other AFD
        // processes following the same protocol.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let capacity = Self::validate(&mmap, policy)?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            policy,
            capacity,
            inode: file.metadata()?.ino(),
            _marker: PhantomData,
        })
    }

    /// Attach, waiting with bounded backoff while the file does not exist.
    pub fn attach_with_retry(
        path: &Path,
        policy: SizePolicy,
        retry: &AttachRetry,
    ) -> Result<Self, TableError> {
        let mut delay = retry.initial;
        let mut attempt = 1;
        loop {
            match Self::attach(path, policy) {
                Err(e) if e.is_retryable() && attempt < retry.attempts => {
                    debug!(table = R::TABLE, attempt, ?delay, "Table not yet published, waiting");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(retry.max);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn validate(bytes: &[u8], policy: SizePolicy) -> Result<usize, TableError> {
        if bytes.len() < WORD_OFFSET {
            return Err(TableError::SizeMismatch {
                table: R::TABLE,
                actual: bytes.len(),
                expected: WORD_OFFSET,
            });
        }
        let header = TableHeader::decode(bytes);
        if header.version != R::VERSION {
            return Err(TableError::VersionMismatch {
                table: R::TABLE,
                found: header.version,
                expected: R::VERSION,
            });
        }
        if header.layout_id != layout_id::<R>() {
            return Err(TableError::LayoutMismatch {
                table: R::TABLE,
                found: header.layout_id,
                expected: layout_id::<R>(),
            });
        }

        let slot = slot_size::<R>();
        let body = bytes.len() - WORD_OFFSET;
        match policy {
            SizePolicy::Exact => {
                let expected = WORD_OFFSET + header.count as usize * slot;
                if expected != bytes.len() {
                    return Err(TableError::SizeMismatch {
                        table: R::TABLE,
                        actual: bytes.len(),
                        expected,
                    });
                }
                Ok(header.count as usize)
            }
            SizePolicy::Capacity => {
                let capacity = body / slot;
                if body % slot != 0 || header.count as usize > capacity {
                    return Err(TableError::SizeMismatch {
                        table: R::TABLE,
                        actual: bytes.len(),
                        expected: WORD_OFFSET + header.count as usize * slot,
                    });
                }
                Ok(capacity)
            }
        }
    }

    /// Re-establish the mapping when the publisher replaced the file.
    ///
    /// Returns true when a new mapping was installed.
    pub fn refresh(&mut self) -> Result<bool, TableError> {
        let meta = fs::metadata(&self.path)?;
        if meta.ino() == self.inode && meta.len() as usize == self.mmap.len() {
            return Ok(false);
        }
        let fresh = Self::attach(&self.path, self.policy)?;
        info!(table = R::TABLE, records = fresh.len(), "Reattached to table");
        *self = fresh;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> TableHeader {
        TableHeader::decode(&self.mmap)
    }

    /// Records in use.
    pub fn len(&self) -> usize {
        self.header().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots available in the file.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Feature-flag byte, read fresh on every call.
    pub fn feature_flags(&self) -> u8 {
        self.mmap[5]
    }

    pub fn set_feature_flags(&mut self, flags: u8) {
        self.mmap[5] = flags;
    }

    /// Update the in-use count of a list table.
    pub fn set_len(&mut self, count: usize) -> Result<(), TableError> {
        if count > self.capacity {
            return Err(TableError::Full {
                table: R::TABLE,
                capacity: self.capacity,
            });
        }
        let mut header = self.header();
        header.count = count as u32;
        header.encode(&mut self.mmap);
        Ok(())
    }

    fn slot_offset(&self, pos: usize) -> Result<usize, TableError> {
        if pos >= self.capacity {
            return Err(TableError::OutOfRange {
                table: R::TABLE,
                pos,
                count: self.capacity,
            });
        }
        Ok(WORD_OFFSET + pos * slot_size::<R>())
    }

    fn epoch(&self, off: usize) -> &AtomicU32 {
        // SAFETY: `off` comes from `slot_offset`, so it lies inside the
        // mapping; the mapping is page aligned and every slot offset is a
        // multiple of 8, which satisfies AtomicU32 alignment.
        unsafe { &*(self.mmap.as_ptr().add(off) as *const AtomicU32) }
    }

    /// Copy out one record, retrying across concurrent writes.
    pub fn read(&self, pos: usize) -> Result<R, TableError> {
        let off = self.slot_offset(pos)?;
        let payload = off + SLOT_PREFIX..off + SLOT_PREFIX + R::SIZE;
        let mut copy = vec![0u8; R::SIZE];

        for _ in 0..MAX_READ_RETRIES {
            let before = self.epoch(off).load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            copy.copy_from_slice(&self.mmap[payload.clone()]);
            fence(Ordering::Acquire);
            if self.epoch(off).load(Ordering::Acquire) == before {
                return Ok(R::decode(&mut FieldReader::new(&copy)));
            }
        }

        warn!(table = R::TABLE, pos, "Record kept changing while reading, using last copy");
        copy.copy_from_slice(&self.mmap[payload]);
        Ok(R::decode(&mut FieldReader::new(&copy)))
    }

    /// Overwrite one record. Only the owner of the record may call this.
    pub fn write(&mut self, pos: usize, record: &R) -> Result<(), TableError> {
        let off = self.slot_offset(pos)?;
        self.epoch(off).fetch_add(1, Ordering::AcqRel);
        let start = off + SLOT_PREFIX;
        record.encode(&mut FieldWriter::new(&mut self.mmap[start..start + R::SIZE]));
        self.epoch(off).fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Read, modify and write back one record.
    pub fn update<F>(&mut self, pos: usize, f: F) -> Result<R, TableError>
    where
        F: FnOnce(&mut R),
        R: Clone,
    {
        let mut record = self.read(pos)?;
        f(&mut record);
        self.write(pos, &record)?;
        Ok(record)
    }

    /// All records in use, in table order.
    pub fn records(&self) -> Result<Vec<R>, TableError> {
        (0..self.len().min(self.capacity)).map(|i| self.read(i)).collect()
    }

    pub fn flush(&self) -> Result<(), TableError> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Probe {
        pub id: u32,
        pub name: String,
    }

    impl Record for Probe {
        const TABLE: &'static str = "probe";
        const SIZE: usize = 4 + 12;
        const VERSION: u8 = 3;

        fn encode(&self, w: &mut FieldWriter<'_>) {
            w.put_u32(self.id);
            w.put_str(&self.name, 12);
        }

        fn decode(r: &mut FieldReader<'_>) -> Self {
            Self {
                id: r.get_u32(),
                name: r.get_str(12),
            }
        }
    }

    fn probes() -> Vec<Probe> {
        vec![
            Probe { id: 1, name: "one".into() },
            Probe { id: 2, name: "two".into() },
        ]
    }

    #[test]
    fn test_slot_size_is_word_aligned() {
        assert_eq!(slot_size::<Probe>(), 24);
        assert_eq!(slot_size::<Probe>() % 8, 0);
    }

    #[test]
    fn test_create_and_attach() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.status");
        MappedTable::create(&path, &probes(), 0x21).unwrap();

        let table = MappedTable::<Probe>::attach(&path, SizePolicy::Exact).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.feature_flags(), 0x21);
        assert_eq!(table.records().unwrap(), probes());
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, WORD_OFFSET + 2 * 24);
    }

    #[test]
    fn test_version_mismatch_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.status");
        MappedTable::create(&path, &probes(), 0).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] = 9;
        fs::write(&path, &bytes).unwrap();

        let err = MappedTable::<Probe>::attach(&path, SizePolicy::Exact).unwrap_err();
        assert!(matches!(
            err,
            TableError::VersionMismatch { found: 9, expected: 3, .. }
        ));
        assert!(err.to_string().contains("incorrect version"));
    }

    #[test]
    fn test_size_mismatch_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.status");
        MappedTable::create(&path, &probes(), 0).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(WORD_OFFSET as u64 + 24).unwrap();

        let err = MappedTable::<Probe>::attach(&path, SizePolicy::Exact).unwrap_err();
        assert!(matches!(err, TableError::SizeMismatch { .. }));
    }

    #[test]
    fn test_missing_file_is_retryable() {
        let temp = TempDir::new().unwrap();
        let retry = AttachRetry {
            attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };
        let err = MappedTable::<Probe>::attach_with_retry(
            &temp.path().join("absent"),
            SizePolicy::Exact,
            &retry,
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_write_keeps_epoch_even() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.status");
        let mut table = MappedTable::create(&path, &probes(), 0).unwrap();
        table
            .update(1, |p| p.name = "changed".into())
            .unwrap();

        let bytes = fs::read(&path).unwrap();
        let epoch_off = WORD_OFFSET + slot_size::<Probe>();
        let epoch = u32::from_le_bytes(bytes[epoch_off..epoch_off + 4].try_into().unwrap());
        assert_eq!(epoch, 2);
        assert_eq!(table.read(1).unwrap().name, "changed");
    }

    #[test]
    fn test_list_table_capacity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("list");
        let mut table = MappedTable::<Probe>::create_list(&path, 3, 0).unwrap();
        assert_eq!(table.capacity(), 3);
        assert!(table.is_empty());
        table.write(0, &probes()[0]).unwrap();
        table.set_len(1).unwrap();
        assert!(matches!(table.set_len(4), Err(TableError::Full { .. })));
        assert!(matches!(table.read(3), Err(TableError::OutOfRange { .. })));

        let again = MappedTable::<Probe>::attach(&path, SizePolicy::Capacity).unwrap();
        assert_eq!(again.records().unwrap(), vec![probes()[0].clone()]);
    }

    #[test]
    fn test_refresh_after_republish() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.status");
        let mut table = MappedTable::create(&path, &probes(), 0).unwrap();
        assert!(!table.refresh().unwrap());

        let mut more = probes();
        more.push(Probe { id: 3, name: "three".into() });
        MappedTable::create(&path, &more, 0).unwrap();
        assert!(table.refresh().unwrap());
        assert_eq!(table.len(), 3);
    }
}
