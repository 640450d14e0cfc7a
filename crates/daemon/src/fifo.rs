//! Named fifos in the working directory's fifo dir.
//!
//! dir_check owns the read side of `dc_cmd`, `ip_fin`, `del_time_job` and
//! `queue_list_ready`. Its write side of `dc_resp`, `msg`,
//! `queue_list_done` and `system_log` is opened per message and skipped
//! while nobody reads.

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::debug;

pub const FIFO_DIR: &str = "fifodir";

pub const DC_CMD_FIFO: &str = "dc_cmd";
pub const DC_RESP_FIFO: &str = "dc_resp";
pub const IP_FIN_FIFO: &str = "ip_fin";
pub const DEL_TIME_JOB_FIFO: &str = "del_time_job";
pub const QUEUE_LIST_READY_FIFO: &str = "queue_list_ready";
pub const QUEUE_LIST_DONE_FIFO: &str = "queue_list_done";
pub const SYSTEM_LOG_FIFO: &str = "system_log";
pub const RECEIVE_LOG_FIFO: &str = "receive_log";
pub const INPUT_LOG_FIFO: &str = "input_log";
pub const MSG_FIFO: &str = "msg";

/// Plain file the queue snapshot is written to on request.
pub const QUEUE_LIST_FILE: &str = "queue_list";

pub const ALL_FIFOS: [&str; 10] = [
    DC_CMD_FIFO,
    DC_RESP_FIFO,
    IP_FIN_FIFO,
    DEL_TIME_JOB_FIFO,
    QUEUE_LIST_READY_FIFO,
    QUEUE_LIST_DONE_FIFO,
    SYSTEM_LOG_FIFO,
    RECEIVE_LOG_FIFO,
    INPUT_LOG_FIFO,
    MSG_FIFO,
];

/// Commands the supervisor writes to `dc_cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcCommand {
    Stop,
    Reread,
    IsAlive,
}

impl DcCommand {
    pub const STOP: u8 = 1;
    pub const REREAD: u8 = 2;
    pub const IS_ALIVE: u8 = 3;

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            Self::STOP => Some(DcCommand::Stop),
            Self::REREAD => Some(DcCommand::Reread),
            Self::IS_ALIVE => Some(DcCommand::IsAlive),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            DcCommand::Stop => Self::STOP,
            DcCommand::Reread => Self::REREAD,
            DcCommand::IsAlive => Self::IS_ALIVE,
        }
    }
}

/// Acknowledge byte written to `dc_resp`.
pub const ACKN: u8 = 6;

/// Create a fifo unless one already exists at `path`.
pub fn make_fifo(path: &Path) -> io::Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) => {
            if fs::metadata(path)?.file_type().is_fifo() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a fifo", path.display()),
                ))
            }
        }
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Create the fifo dir and every fifo in it.
pub fn ensure_fifos(fifo_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(fifo_dir)?;
    for name in ALL_FIFOS {
        make_fifo(&fifo_dir.join(name))?;
    }
    Ok(())
}

/// Read side of one fifo, opened read-write so it never sees EOF when the
/// last writer closes.
#[derive(Debug)]
pub struct FifoReader {
    path: PathBuf,
    rx: pipe::Receiver,
}

impl FifoReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let rx = pipe::OpenOptions::new().read_write(true).open_receiver(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until bytes are available and append them to `buf`.
    pub async fn read_some(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.rx.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Append whatever is buffered without waiting.
    pub fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.rx.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Write `bytes` to a fifo if a reader is attached.
///
/// # Returns
/// * `Ok(true)` - Written
/// * `Ok(false)` - Nobody reads the fifo right now, or its buffer is full
pub fn send(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let tx = match pipe::OpenOptions::new().open_sender(path) {
        Ok(tx) => tx,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
            debug!(fifo = %path.display(), "No reader on fifo");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    match tx.try_write(bytes) {
        Ok(n) if n == bytes.len() => Ok(true),
        Ok(n) => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write to {}: {} of {}", path.display(), n, bytes.len()),
        )),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_fifos_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(FIFO_DIR);
        ensure_fifos(&dir).unwrap();
        ensure_fifos(&dir).unwrap();
        for name in ALL_FIFOS {
            assert!(fs::metadata(dir.join(name)).unwrap().file_type().is_fifo());
        }
    }

    #[test]
    fn test_regular_file_is_not_a_fifo() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DC_CMD_FIFO);
        fs::write(&path, b"").unwrap();
        assert!(make_fifo(&path).is_err());
    }

    #[test]
    fn test_command_bytes() {
        for cmd in [DcCommand::Stop, DcCommand::Reread, DcCommand::IsAlive] {
            assert_eq!(DcCommand::from_byte(cmd.as_byte()), Some(cmd));
        }
        assert_eq!(DcCommand::from_byte(0), None);
        assert_eq!(DcCommand::from_byte(ACKN), None);
    }

    #[tokio::test]
    async fn test_send_without_reader_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DC_RESP_FIFO);
        make_fifo(&path).unwrap();
        assert!(!send(&path, &[ACKN]).unwrap());
    }

    #[tokio::test]
    async fn test_reader_receives_sent_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(DC_CMD_FIFO);
        make_fifo(&path).unwrap();
        let mut reader = FifoReader::open(&path).unwrap();

        assert!(send(&path, &[DcCommand::IS_ALIVE, DcCommand::STOP]).unwrap());
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_some(&mut buf))
            .await
            .unwrap()
            .unwrap();
        reader.drain(&mut buf).unwrap();
        assert_eq!(buf, vec![DcCommand::IS_ALIVE, DcCommand::STOP]);
        assert_eq!(reader.drain(&mut buf).unwrap(), 0);
    }
}
