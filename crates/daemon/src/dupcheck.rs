//! Duplicate detection store: per job CRC-32 keys with an expiry time.

use crate::jobs::SEPARATOR_CHAR;
use crate::options::{DupcheckMode, DupcheckSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const DUPCHECK_FILE: &str = "dupcheck.json";

/// Key of one file under the given mode.
pub fn dupcheck_key(mode: DupcheckMode, path: &Path, name: &str, size: u64) -> io::Result<u32> {
    match mode {
        DupcheckMode::Name => Ok(crc32fast::hash(name.as_bytes())),
        DupcheckMode::NameSize => {
            let key = format!("{}{}{}", name, SEPARATOR_CHAR, size);
            Ok(crc32fast::hash(key.as_bytes()))
        }
        DupcheckMode::Content => {
            let mut hasher = crc32fast::Hasher::new();
            let mut reader = BufReader::new(File::open(path)?);
            let mut buf = [0u8; 8192];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize())
        }
    }
}

/// Outcome of checking one file against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    Duplicate,
    /// First sighting; the key was stored and is returned so it can be
    /// forgotten again if the file is never delivered.
    First(u32),
}

impl Sighting {
    pub fn is_duplicate(self) -> bool {
        self == Sighting::Duplicate
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupStore {
    /// job id -> key -> expiry (seconds since the epoch)
    jobs: HashMap<u32, HashMap<u32, i64>>,
}

impl DupStore {
    /// Load the persisted store; a missing or unreadable file gives an
    /// empty store.
    pub fn load(path: &Path) -> Self {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to open dupcheck store");
                }
                return Self::default();
            }
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding malformed dupcheck store");
                Self::default()
            }
        }
    }

    /// Persist with write-then-rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(&file);
            serde_json::to_writer(&mut writer, self).map_err(io::Error::from)?;
            writer.flush()?;
            drop(writer);
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }

    /// Check a file against the job's store, remembering it when new.
    ///
    /// # Returns
    /// * `Ok(Sighting::Duplicate)` - The file must be dropped
    /// * `Ok(Sighting::First(key))` - First sighting within the timeout
    pub fn check_and_insert(
        &mut self,
        job_id: u32,
        spec: &DupcheckSpec,
        path: &Path,
        name: &str,
        size: u64,
        now: i64,
    ) -> io::Result<Sighting> {
        let key = dupcheck_key(spec.mode, path, name, size)?;
        let keys = self.jobs.entry(job_id).or_default();
        match keys.get(&key) {
            Some(&expires) if expires > now => {
                debug!(job_id = %format!("{:x}", job_id), name, "Duplicate file");
                Ok(Sighting::Duplicate)
            }
            _ => {
                keys.insert(key, now + spec.timeout as i64);
                Ok(Sighting::First(key))
            }
        }
    }

    /// Drop a key stored for a file that was never delivered.
    pub fn forget(&mut self, job_id: u32, key: u32) -> bool {
        let Some(keys) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        let removed = keys.remove(&key).is_some();
        if keys.is_empty() {
            self.jobs.remove(&job_id);
        }
        removed
    }

    /// Drop expired keys and jobs left without keys.
    pub fn expire(&mut self, now: i64) -> usize {
        let mut removed = 0;
        for keys in self.jobs.values_mut() {
            let before = keys.len();
            keys.retain(|_, &mut expires| expires > now);
            removed += before - keys.len();
        }
        self.jobs.retain(|_, keys| !keys.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(mode: DupcheckMode) -> DupcheckSpec {
        DupcheckSpec { timeout: 100, mode }
    }

    #[test]
    fn test_second_sighting_is_duplicate_until_expiry() {
        let mut store = DupStore::default();
        let s = spec(DupcheckMode::Name);
        let p = Path::new("/nonexistent");
        assert!(!store.check_and_insert(1, &s, p, "a", 1, 1000).unwrap().is_duplicate());
        assert!(store.check_and_insert(1, &s, p, "a", 2, 1050).unwrap().is_duplicate());
        // other jobs keep their own keys
        assert!(!store.check_and_insert(2, &s, p, "a", 1, 1050).unwrap().is_duplicate());
        assert!(!store.check_and_insert(1, &s, p, "a", 1, 1100).unwrap().is_duplicate());
    }

    #[test]
    fn test_name_size_mode_distinguishes_sizes() {
        let mut store = DupStore::default();
        let s = spec(DupcheckMode::NameSize);
        let p = Path::new("/nonexistent");
        assert!(!store.check_and_insert(1, &s, p, "a", 1, 0).unwrap().is_duplicate());
        assert!(!store.check_and_insert(1, &s, p, "a", 2, 0).unwrap().is_duplicate());
        assert!(store.check_and_insert(1, &s, p, "a", 2, 0).unwrap().is_duplicate());
    }

    #[test]
    fn test_content_mode_reads_file() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        let mut store = DupStore::default();
        let s = spec(DupcheckMode::Content);
        assert!(!store.check_and_insert(1, &s, &a, "a", 4, 0).unwrap().is_duplicate());
        assert!(store.check_and_insert(1, &s, &b, "b", 4, 0).unwrap().is_duplicate());
    }

    #[test]
    fn test_forgotten_key_is_new_again() {
        let mut store = DupStore::default();
        let s = spec(DupcheckMode::Name);
        let p = Path::new("/nonexistent");
        let Sighting::First(key) = store.check_and_insert(3, &s, p, "a", 1, 0).unwrap() else {
            panic!("first sighting expected");
        };
        assert!(store.forget(3, key));
        assert!(store.is_empty());
        assert!(!store.forget(3, key));
        assert!(!store.check_and_insert(3, &s, p, "a", 1, 1).unwrap().is_duplicate());
    }

    #[test]
    fn test_expire_and_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DUPCHECK_FILE);
        let mut store = DupStore::default();
        let s = spec(DupcheckMode::Name);
        store.check_and_insert(7, &s, &path, "x", 0, 0).unwrap();
        store.check_and_insert(7, &s, &path, "y", 0, 500).unwrap();
        assert_eq!(store.expire(200), 1);
        store.save(&path).unwrap();

        let back = DupStore::load(&path);
        assert_eq!(back, store);
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn test_malformed_store_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DUPCHECK_FILE);
        fs::write(&path, b"{not json").unwrap();
        assert!(DupStore::load(&path).is_empty());
        assert!(DupStore::load(&temp.path().join("absent")).is_empty());
    }
}
