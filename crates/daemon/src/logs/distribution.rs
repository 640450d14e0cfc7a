//! Distribution log: which jobs took a file, one column per
//! distribution type.

use super::{hex_i64, hex_u32, next_column, split_name_size, LogParseError, LogWriter};
use crate::jobs::SEPARATOR_CHAR;
use crate::pool::{DistributionType, NO_OF_DISTRIBUTION_TYPES};
use std::io;
use std::path::Path;

pub const DISTRIBUTION_LOG_FILE: &str = "DISTRIBUTION_LOG";
pub const DISTRIBUTION_LOG_SIGNATURE: &str = "DIS";
pub const DISTRIBUTION_LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
    pub time: i64,
    pub name: String,
    pub size: u64,
    pub dir_id: u32,
    pub unique: u32,
    pub columns: [Vec<u32>; NO_OF_DISTRIBUTION_TYPES],
}

impl DistributionRecord {
    pub fn jobs(&self, kind: DistributionType) -> &[u32] {
        &self.columns[kind.index()]
    }

    pub fn encode(&self) -> String {
        let mut line = format!(
            "{:x}|{}{}{:x}|{:x}|{:x}|{:x}",
            self.time,
            self.name,
            SEPARATOR_CHAR,
            self.size,
            self.dir_id,
            self.unique,
            NO_OF_DISTRIBUTION_TYPES
        );
        for column in &self.columns {
            line.push('|');
            let ids: Vec<String> = column.iter().map(|id| format!("{:x}", id)).collect();
            line.push_str(&ids.join(","));
        }
        line
    }

    pub fn parse(line: &str) -> Result<Self, LogParseError> {
        let mut rest = line;
        let time = hex_i64(next_column(&mut rest, "time")?, "time")?;
        let (name, size, mut rest) = split_name_size(rest, "name")?;
        let dir_id = hex_u32(next_column(&mut rest, "dir_id")?, "dir_id")?;
        let unique = hex_u32(next_column(&mut rest, "unique")?, "unique")?;
        let n = hex_u32(next_column(&mut rest, "types")?, "types")? as usize;

        let mut columns: [Vec<u32>; NO_OF_DISTRIBUTION_TYPES] = Default::default();
        // Columns beyond the known types are read and dropped; missing
        // trailing columns stay empty.
        let mut fields = rest.split('|');
        for i in 0..n {
            let field = fields.next().unwrap_or("");
            if i >= NO_OF_DISTRIBUTION_TYPES || field.is_empty() {
                continue;
            }
            for id in field.split(',') {
                columns[i].push(hex_u32(id, "jobs")?);
            }
        }

        Ok(Self {
            time,
            name: name.to_string(),
            size,
            dir_id,
            unique,
            columns,
        })
    }
}

#[derive(Debug)]
pub struct DistributionLog {
    writer: LogWriter,
}

impl DistributionLog {
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        let writer = LogWriter::open(
            log_dir,
            DISTRIBUTION_LOG_FILE,
            DISTRIBUTION_LOG_SIGNATURE,
            DISTRIBUTION_LOG_VERSION,
        )?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, record: &DistributionRecord) -> io::Result<()> {
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
    fn test_distribution_line() {
        let mut columns: [Vec<u32>; NO_OF_DISTRIBUTION_TYPES] = Default::default();
        columns[DistributionType::Normal.index()] = vec![0x1f, 0x20];
        columns[DistributionType::AgeLimitDelete.index()] = vec![0x30];
        let rec = DistributionRecord {
            time: 0x10,
            name: "a.txt".to_string(),
            size: 5,
            dir_id: 1,
            unique: 2,
            columns,
        };
        let line = rec.encode();
        assert_eq!(line, "10|a.txt\x035|1|2|6|1f,20||||30|");
        let back = DistributionRecord::parse(&line).unwrap();
        assert_eq!(back.jobs(DistributionType::Normal), &[0x1f, 0x20]);
        assert_eq!(back, rec);
    }

    #[test]
    fn test_short_and_long_rows() {
        let short = DistributionRecord::parse("10|a\x031|1|2|1|5").unwrap();
        assert_eq!(short.jobs(DistributionType::Normal), &[5]);
        assert!(short.jobs(DistributionType::Dupcheck).is_empty());

        let long = DistributionRecord::parse("10|a\x031|1|2|7|5||||||9").unwrap();
        assert_eq!(long.jobs(DistributionType::Normal), &[5]);
    }
}
