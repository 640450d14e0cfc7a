//! Input log: one line per file picked up from a watched directory.

use super::{hex_i64, hex_u32, next_column, split_name_size, LogParseError, LogWriter};
use crate::jobs::SEPARATOR_CHAR;
use std::io;
use std::path::Path;

pub const INPUT_LOG_FILE: &str = "INPUT_LOG";
pub const INPUT_LOG_SIGNATURE: &str = "INP";
pub const INPUT_LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    pub time: i64,
    pub name: String,
    pub size: u64,
    pub dir_id: u32,
    /// Value drawn from the input-log counter file.
    pub unique: u32,
}

impl InputRecord {
    pub fn encode(&self) -> String {
        format!(
            "{:x}|{}{}{:x}|{:x}|{:x}",
            self.time, self.name, SEPARATOR_CHAR, self.size, self.dir_id, self.unique
        )
    }

    pub fn parse(line: &str) -> Result<Self, LogParseError> {
        let mut rest = line;
        let time = hex_i64(next_column(&mut rest, "time")?, "time")?;
        let (name, size, mut rest) = split_name_size(rest, "name")?;
        let dir_id = hex_u32(next_column(&mut rest, "dir_id")?, "dir_id")?;
        let unique = hex_u32(next_column(&mut rest, "unique")?, "unique")?;
        Ok(Self {
            time,
            name: name.to_string(),
            size,
            dir_id,
            unique,
        })
    }
}

#[derive(Debug)]
pub struct InputLog {
    writer: LogWriter,
}

impl InputLog {
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        let writer = LogWriter::open(log_dir, INPUT_LOG_FILE, INPUT_LOG_SIGNATURE, INPUT_LOG_VERSION)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, record: &InputRecord) -> io::Result<()> {
        self.writer.write_line(&record.encode())
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_line() {
        let rec = InputRecord {
            time: 0x100,
            name: "a|b.txt".to_string(),
            size: 5,
            dir_id: 0xabc,
            unique: 7,
        };
        let line = rec.encode();
        assert_eq!(line, "100|a|b.txt\x035|abc|7");
        assert_eq!(InputRecord::parse(&line).unwrap(), rec);
        assert_eq!(
            InputRecord::parse("100|a\x035"),
            Err(LogParseError::MissingColumn("dir_id"))
        );
    }
}
