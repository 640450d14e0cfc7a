//! Delete log: files removed by the selection pipeline instead of being
//! distributed.

use super::{hex_i64, hex_u32, next_column, split_name_size, LogParseError, LogWriter};
use crate::jobs::SEPARATOR_CHAR;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

pub const DELETE_LOG_FILE: &str = "DELETE_LOG";
pub const DELETE_LOG_SIGNATURE: &str = "DEL";
pub const DELETE_LOG_VERSION: u32 = 1;
pub const DIR_CHECK_PROC: &str = "dir_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteReason {
    AgeLimit,
    Dupcheck,
    HostDisabled,
}

impl DeleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteReason::AgeLimit => "AGE_LIMIT",
            DeleteReason::Dupcheck => "DUPCHECK",
            DeleteReason::HostDisabled => "HOST_DISABLED",
        }
    }
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeleteReason {
    type Err = LogParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AGE_LIMIT" => Ok(DeleteReason::AgeLimit),
            "DUPCHECK" => Ok(DeleteReason::Dupcheck),
            "HOST_DISABLED" => Ok(DeleteReason::HostDisabled),
            _ => Err(LogParseError::UnknownValue("reason")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub time: i64,
    pub host_alias: String,
    pub reason: DeleteReason,
    pub name: String,
    pub size: u64,
    pub job_id: u32,
    pub dir_id: u32,
    pub proc: String,
    pub extra: String,
}

impl DeleteRecord {
    pub fn encode(&self) -> String {
        format!(
            "{:x}|{}|{}|{}{}{:x}|{:x}|{:x}|{}|{}",
            self.time,
            self.host_alias,
            self.reason,
            self.name,
            SEPARATOR_CHAR,
            self.size,
            self.job_id,
            self.dir_id,
            self.proc,
            self.extra
        )
    }

    pub fn parse(line: &str) -> Result<Self, LogParseError> {
        let mut rest = line;
        let time = hex_i64(next_column(&mut rest, "time")?, "time")?;
        let host_alias = next_column(&mut rest, "host_alias")?.to_string();
        let reason = next_column(&mut rest, "reason")?.parse()?;
        let (name, size, mut rest) = split_name_size(rest, "name")?;
        let job_id = hex_u32(next_column(&mut rest, "job_id")?, "job_id")?;
        let dir_id = hex_u32(next_column(&mut rest, "dir_id")?, "dir_id")?;
        let proc = next_column(&mut rest, "proc")?.to_string();
        Ok(Self {
            time,
            host_alias,
            reason,
            name: name.to_string(),
            size,
            job_id,
            dir_id,
            proc,
            extra: rest.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct DeleteLog {
    writer: LogWriter,
}

impl DeleteLog {
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        let writer = LogWriter::open(log_dir, DELETE_LOG_FILE, DELETE_LOG_SIGNATURE, DELETE_LOG_VERSION)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, record: &DeleteRecord) -> io::Result<()> {
        self.writer.write_line(&record.encode())
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}
