//! Production log: one line per staged file.
//!
//! Three record shapes exist. The writer emits v3 when CPU time is known
//! and v2 otherwise; v1 lines (no ratio, no CPU time) from older logs
//! are still decoded.

use super::{hex_i64, hex_u32, next_column, split_name_size, LogParseError, LogWriter};
use crate::jobs::SEPARATOR_CHAR;
use crate::tables::CpuTime;
use std::io;
use std::path::Path;

pub const PRODUCTION_LOG_FILE: &str = "PRODUCTION_LOG";
pub const PRODUCTION_LOG_SIGNATURE: &str = "PRO";
pub const PRODUCTION_LOG_VERSION: u32 = 3;

/// Record layout revision of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionVersion {
    V1,
    V2,
    V3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRecord {
    pub time: i64,
    /// Input to output file ratio; v1 lines read as 1:1.
    pub ratio: (u32, u32),
    pub cpu: Option<CpuTime>,
    pub input_time: i64,
    pub unique: u32,
    pub split: u32,
    pub dir_id: u32,
    pub job_id: u32,
    pub orig_name: String,
    pub orig_size: u64,
    pub new_name: String,
    pub new_size: u64,
    pub rc: i32,
    pub command: String,
}

impl ProductionRecord {
    pub fn version(&self) -> ProductionVersion {
        if self.cpu.is_some() {
            ProductionVersion::V3
        } else {
            ProductionVersion::V2
        }
    }

    /// Encode as one log line without the trailing newline.
    pub fn encode(&self) -> String {
        let mut line = format!("{:x}|{:x}:{:x}|", self.time, self.ratio.0, self.ratio.1);
        if let Some(cpu) = self.cpu {
            line.push_str(&format!("{:x}.{:x}|", cpu.sec, cpu.usec));
        }
        line.push_str(&format!(
            "{:x}_{:x}_{:x}|{:x}|{:x}|{}{}{:x}|{}{}{:x}|{:x}|{}",
            self.input_time,
            self.unique,
            self.split,
            self.dir_id,
            self.job_id,
            self.orig_name,
            SEPARATOR_CHAR,
            self.orig_size,
            self.new_name,
            SEPARATOR_CHAR,
            self.new_size,
            self.rc as u32,
            self.command
        ));
        line
    }

    /// Decode a line of any known revision.
    pub fn parse(line: &str) -> Result<(ProductionVersion, Self), LogParseError> {
        let mut rest = line;
        let time = hex_i64(next_column(&mut rest, "time")?, "time")?;

        let first = next_column(&mut rest, "ratio")?;
        let (version, ratio, ids) = match first.split_once(':') {
            None => (ProductionVersion::V1, (1, 1), first),
            Some((r1, r2)) => {
                let ratio = (hex_u32(r1, "ratio")?, hex_u32(r2, "ratio")?);
                let second = next_column(&mut rest, "input")?;
                if second.contains('.') {
                    (ProductionVersion::V3, ratio, second)
                } else {
                    (ProductionVersion::V2, ratio, second)
                }
            }
        };

        let (cpu, ids) = if version == ProductionVersion::V3 {
            let (sec, usec) = ids
                .split_once('.')
                .ok_or(LogParseError::MissingSeparator("cpu"))?;
            let cpu = CpuTime {
                sec: hex_i64(sec, "cpu")?,
                usec: hex_i64(usec, "cpu")?,
            };
            (Some(cpu), next_column(&mut rest, "input")?)
        } else {
            (None, ids)
        };

        let mut parts = ids.splitn(3, '_');
        let input_time = hex_i64(parts.next().unwrap_or(""), "input_time")?;
        let unique = hex_u32(
            parts.next().ok_or(LogParseError::MissingSeparator("unique"))?,
            "unique",
        )?;
        let split = hex_u32(
            parts.next().ok_or(LogParseError::MissingSeparator("split"))?,
            "split",
        )?;

        let dir_id = hex_u32(next_column(&mut rest, "dir_id")?, "dir_id")?;
        let job_id = hex_u32(next_column(&mut rest, "job_id")?, "job_id")?;
        let (orig_name, orig_size, rest) = split_name_size(rest, "orig_name")?;
        let (new_name, new_size, rest) = split_name_size(rest, "new_name")?;
        let mut rest = rest;
        let rc = hex_u32(next_column(&mut rest, "rc")?, "rc")? as i32;

        Ok((
            version,
            Self {
                time,
                ratio,
                cpu,
                input_time,
                unique,
                split,
                dir_id,
                job_id,
                orig_name: orig_name.to_string(),
                orig_size,
                new_name: new_name.to_string(),
                new_size,
                rc,
                command: rest.to_string(),
            },
        ))
    }
}

#[derive(Debug)]
pub struct ProductionLog {
    writer: LogWriter,
}

impl ProductionLog {
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        let writer = LogWriter::open(
            log_dir,
            PRODUCTION_LOG_FILE,
            PRODUCTION_LOG_SIGNATURE,
            PRODUCTION_LOG_VERSION,
        )?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, record: &ProductionRecord) -> io::Result<()> {
        self.writer.write_line(&record.encode())
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}
