//! Line-based ASCII logs under `<work>/log/`.
//!
//! Every file begins with a magic line `#!# <SIGNATURE> <version>`; other
//! lines starting with `#` are comments. Numbers are lower-case hex,
//! columns are split by `|` and sub-fields by the separator char.

pub mod delete;
pub mod distribution;
pub mod input;
pub mod production;

pub use delete::{DeleteLog, DeleteReason, DeleteRecord};
pub use distribution::{DistributionLog, DistributionRecord};
pub use input::{InputLog, InputRecord};
pub use production::{ProductionLog, ProductionRecord};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOG_DIR: &str = "log";
pub const MAGIC_PREFIX: &str = "#!#";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogParseError {
    #[error("missing column {0}")]
    MissingColumn(&'static str),

    #[error("invalid number in column {0}")]
    BadNumber(&'static str),

    #[error("missing separator in column {0}")]
    MissingSeparator(&'static str),

    #[error("unknown value in column {0}")]
    UnknownValue(&'static str),
}

/// Append-only writer for one log file.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    /// Open `dir/name` for appending, writing the magic line when the file
    /// is new or empty.
    pub fn open(dir: &Path, name: &str, signature: &str, version: u32) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{} {} {}", MAGIC_PREFIX, signature, version)?;
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; each line goes out in a single write.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.file.write_all(buf.as_bytes())
    }
}

/// Signature and version from a magic line.
pub fn parse_magic(line: &str) -> Option<(&str, u32)> {
    let mut parts = line.strip_prefix(MAGIC_PREFIX)?.split_whitespace();
    let signature = parts.next()?;
    let version = parts.next()?.parse().ok()?;
    Some((signature, version))
}

/// Record lines of a log, skipping the magic line and comments.
pub fn record_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

pub(crate) fn hex_u64(s: &str, column: &'static str) -> Result<u64, LogParseError> {
    u64::from_str_radix(s, 16).map_err(|_| LogParseError::BadNumber(column))
}

pub(crate) fn hex_u32(s: &str, column: &'static str) -> Result<u32, LogParseError> {
    u32::from_str_radix(s, 16).map_err(|_| LogParseError::BadNumber(column))
}

pub(crate) fn hex_i64(s: &str, column: &'static str) -> Result<i64, LogParseError> {
    hex_u64(s, column).map(|v| v as i64)
}

/// Split `name\x03size|rest` where the name may contain `|`.
pub(crate) fn split_name_size<'a>(
    s: &'a str,
    column: &'static str,
) -> Result<(&'a str, u64, &'a str), LogParseError> {
    let (name, after) = s
        .split_once(crate::jobs::SEPARATOR_CHAR)
        .ok_or(LogParseError::MissingSeparator(column))?;
    let (size, rest) = after.split_once('|').unwrap_or((after, ""));
    Ok((name, hex_u64(size, column)?, rest))
}

/// Take the next `|` column from `s`.
pub(crate) fn next_column<'a>(
    s: &mut &'a str,
    column: &'static str,
) -> Result<&'a str, LogParseError> {
    if s.is_empty() {
        return Err(LogParseError::MissingColumn(column));
    }
    match s.split_once('|') {
        Some((head, tail)) => {
            *s = tail;
            Ok(head)
        }
        None => {
            let head = *s;
            *s = "";
            Ok(head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_magic_line_written_once() {
        let temp = TempDir::new().unwrap();
        {
            let mut log = LogWriter::open(temp.path(), "TEST_LOG", "TST", 2).unwrap();
            log.write_line("a").unwrap();
        }
        let mut log = LogWriter::open(temp.path(), "TEST_LOG", "TST", 2).unwrap();
        log.write_line("b").unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "#!# TST 2\na\nb\n");
        assert_eq!(parse_magic(content.lines().next().unwrap()), Some(("TST", 2)));
        assert_eq!(record_lines(&content).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_split_name_keeps_pipes() {
        let line = "we|ird\x0310|rest|more";
        let (name, size, rest) = split_name_size(line, "name").unwrap();
        assert_eq!(name, "we|ird");
        assert_eq!(size, 16);
        assert_eq!(rest, "rest|more");
    }

    #[test]
    fn test_next_column() {
        let mut s = "a|b";
        assert_eq!(next_column(&mut s, "x").unwrap(), "a");
        assert_eq!(next_column(&mut s, "y").unwrap(), "b");
        assert_eq!(next_column(&mut s, "z"), Err(LogParseError::MissingColumn("z")));
    }
}
