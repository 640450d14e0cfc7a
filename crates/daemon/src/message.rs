//! Fixed-size messages exchanged over the fifos.
//!
//! A worker reports completion with a [`FinishMessage`] on `ip_fin`.
//! dir_check hands a staged batch to the transfer daemon with a
//! [`JobMessage`], first appended to `msg_buffer` and synced, then
//! written to the `msg` fifo.

use crate::tables::codec::{FieldReader, FieldWriter};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FINISH_MESSAGE_SIZE: usize = 24;
pub const FINISH_MESSAGE_VERSION: u8 = 1;
pub const JOB_MESSAGE_SIZE: usize = 48;
pub const MSG_BUFFER_FILE: &str = "msg_buffer";

/// Who produced a job message.
pub const ORIGINATOR_DIR_CHECK: u8 = 1;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unsupported finish message version {0}")]
    Version(u8),

    #[error("short message: {0} bytes")]
    Short(usize),

    #[error("message buffer I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishMessage {
    pub pid: i32,
    pub files: u32,
    pub rc: i32,
    pub bytes: u64,
}

impl FinishMessage {
    pub fn encode(&self) -> [u8; FINISH_MESSAGE_SIZE] {
        let mut buf = [0u8; FINISH_MESSAGE_SIZE];
        let mut w = FieldWriter::new(&mut buf);
        w.put_u8(FINISH_MESSAGE_VERSION);
        w.skip(3);
        w.put_i32(self.pid);
        w.put_u32(self.files);
        w.put_i32(self.rc);
        w.put_u64(self.bytes);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < FINISH_MESSAGE_SIZE {
            return Err(MessageError::Short(buf.len()));
        }
        let mut r = FieldReader::new(&buf[..FINISH_MESSAGE_SIZE]);
        let version = r.get_u8();
        if version != FINISH_MESSAGE_VERSION {
            return Err(MessageError::Version(version));
        }
        r.skip(3);
        Ok(Self {
            pid: r.get_i32(),
            files: r.get_u32(),
            rc: r.get_i32(),
            bytes: r.get_u64(),
        })
    }
}

/// Splits a byte stream from `ip_fin` into finish messages.
#[derive(Debug, Default)]
pub struct FinishDecoder {
    pending: Vec<u8>,
}

impl FinishDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete message; bad versions are returned as errors and
    /// consumed so decoding can continue.
    pub fn next_message(&mut self) -> Option<Result<FinishMessage, MessageError>> {
        if self.pending.len() < FINISH_MESSAGE_SIZE {
            return None;
        }
        let frame: Vec<u8> = self.pending.drain(..FINISH_MESSAGE_SIZE).collect();
        Some(FinishMessage::decode(&frame))
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobMessage {
    pub creation_time: i64,
    pub job_id: u32,
    pub split_job_counter: u32,
    pub files: u32,
    pub bytes: u64,
    pub dir_id: u32,
    pub unique: u32,
    pub priority: u8,
    pub originator: u8,
}

impl JobMessage {
    pub fn encode(&self) -> [u8; JOB_MESSAGE_SIZE] {
        let mut buf = [0u8; JOB_MESSAGE_SIZE];
        let mut w = FieldWriter::new(&mut buf);
        w.put_i64(self.creation_time);
        w.put_u32(self.job_id);
        w.put_u32(self.split_job_counter);
        w.put_u32(self.files);
        w.skip(4);
        w.put_u64(self.bytes);
        w.put_u32(self.dir_id);
        w.put_u32(self.unique);
        w.put_u8(self.priority);
        w.put_u8(self.originator);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < JOB_MESSAGE_SIZE {
            return Err(MessageError::Short(buf.len()));
        }
        let mut r = FieldReader::new(&buf[..JOB_MESSAGE_SIZE]);
        let creation_time = r.get_i64();
        let job_id = r.get_u32();
        let split_job_counter = r.get_u32();
        let files = r.get_u32();
        r.skip(4);
        Ok(Self {
            creation_time,
            job_id,
            split_job_counter,
            files,
            bytes: r.get_u64(),
            dir_id: r.get_u32(),
            unique: r.get_u32(),
            priority: r.get_u8(),
            originator: r.get_u8(),
        })
    }
}

/// Durable append-only store of job messages not yet taken by FD.
#[derive(Debug)]
pub struct MessageBuffer {
    path: PathBuf,
    file: File,
}

impl MessageBuffer {
    pub fn open(fifo_dir: &Path) -> Result<Self, MessageError> {
        let path = fifo_dir.join(MSG_BUFFER_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Append one message and sync it to disk.
    pub fn append(&mut self, msg: &JobMessage) -> Result<(), MessageError> {
        self.file.write_all(&msg.encode())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// All messages currently in the buffer, oldest first. A trailing
    /// partial record is ignored.
    pub fn read_all(&self) -> Result<Vec<JobMessage>, MessageError> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        data.chunks_exact(JOB_MESSAGE_SIZE)
            .map(JobMessage::decode)
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
