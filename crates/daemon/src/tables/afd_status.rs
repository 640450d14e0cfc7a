//! AFD status area: a single record of process-wide counters and the
//! log-indicator rings shown by the operator views.

use crate::tables::codec::{FieldReader, FieldWriter};
use crate::tables::mapped::Record;

pub const AFD_STATUS_FILE: &str = "afd.status";
pub const AFD_STATUS_VERSION: u8 = 2;

pub const LOG_FIFO_SIZE: usize = 5;
pub const MAX_LOG_HISTORY: usize = 48;

/// One-character severity code kept in the log rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogSign {
    #[default]
    Unknown,
    Info,
    Config,
    Offline,
    Warn,
    Error,
    Fatal,
}

impl LogSign {
    pub fn as_char(self) -> char {
        match self {
            LogSign::Unknown => '?',
            LogSign::Info => 'I',
            LogSign::Config => 'C',
            LogSign::Offline => 'O',
            LogSign::Warn => 'W',
            LogSign::Error => 'E',
            LogSign::Fatal => 'F',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '?' => Some(LogSign::Unknown),
            'I' => Some(LogSign::Info),
            'C' => Some(LogSign::Config),
            'O' => Some(LogSign::Offline),
            'W' => Some(LogSign::Warn),
            'E' => Some(LogSign::Error),
            'F' => Some(LogSign::Fatal),
            _ => None,
        }
    }

    fn from_byte(b: u8) -> Self {
        Self::from_char(b as char).unwrap_or_default()
    }
}

/// Which ring a sign belongs to; each ring accepts a different alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Receive,
    System,
    Transfer,
}

impl LogKind {
    pub fn accepts(self, sign: LogSign) -> bool {
        match sign {
            LogSign::Config => self == LogKind::System,
            LogSign::Offline => self == LogKind::Transfer,
            _ => true,
        }
    }
}

/// Error counter, recent-sign fifo and hourly history of one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRing {
    pub counter: u32,
    /// Worst sign seen since the last history rotation.
    pub current: LogSign,
    pub fifo: [LogSign; LOG_FIFO_SIZE],
    pub history: [LogSign; MAX_LOG_HISTORY],
}

impl Default for LogRing {
    fn default() -> Self {
        Self {
            counter: 0,
            current: LogSign::Unknown,
            fifo: [LogSign::Unknown; LOG_FIFO_SIZE],
            history: [LogSign::Unknown; MAX_LOG_HISTORY],
        }
    }
}

const LOG_RING_SIZE: usize = 4 + 1 + LOG_FIFO_SIZE + MAX_LOG_HISTORY + 2;

impl LogRing {
    pub fn push(&mut self, sign: LogSign) {
        self.fifo[self.counter as usize % LOG_FIFO_SIZE] = sign;
        self.counter = self.counter.wrapping_add(1);
        if sign > self.current {
            self.current = sign;
        }
    }

    /// Shift the history by one hour, appending the worst sign of the
    /// hour that just ended.
    pub fn rotate_history(&mut self) {
        self.history.rotate_left(1);
        self.history[MAX_LOG_HISTORY - 1] = match self.current {
            LogSign::Unknown => LogSign::Info,
            sign => sign,
        };
        self.current = LogSign::Unknown;
    }

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.put_u32(self.counter);
        w.put_u8(self.current.as_char() as u8);
        for sign in self.fifo.iter().chain(self.history.iter()) {
            w.put_u8(sign.as_char() as u8);
        }
        w.skip(2);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        let counter = r.get_u32();
        let current = LogSign::from_byte(r.get_u8());
        let fifo = std::array::from_fn(|_| LogSign::from_byte(r.get_u8()));
        let history = std::array::from_fn(|_| LogSign::from_byte(r.get_u8()));
        r.skip(2);
        Self {
            counter,
            current,
            fifo,
            history,
        }
    }
}

/// Accumulated user or system CPU time of reaped children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub sec: i64,
    pub usec: i64,
}

impl CpuTime {
    pub fn add(&mut self, other: CpuTime) {
        let usec = self.usec + other.usec;
        self.sec += other.sec + usec / 1_000_000;
        self.usec = usec % 1_000_000;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AfdStatus {
    pub dir_check_pid: i32,
    pub amg_fork_counter: u32,
    pub fd_fork_counter: u32,
    pub burst2_counter: u32,
    pub max_queue_length: u32,
    pub dir_scans: u32,
    pub inotify_events: u32,
    pub amg_child_utime: CpuTime,
    pub amg_child_stime: CpuTime,
    pub fd_child_utime: CpuTime,
    pub fd_child_stime: CpuTime,
    pub receive_log: LogRing,
    pub system_log: LogRing,
    pub transfer_log: LogRing,
}

impl AfdStatus {
    pub fn ring_mut(&mut self, kind: LogKind) -> &mut LogRing {
        match kind {
            LogKind::Receive => &mut self.receive_log,
            LogKind::System => &mut self.system_log,
            LogKind::Transfer => &mut self.transfer_log,
        }
    }
}

impl Record for AfdStatus {
    const TABLE: &'static str = "AFD_STATUS";
    const SIZE: usize = 4 + 6 * 4 + 4 * 16 + 3 * LOG_RING_SIZE;
    const VERSION: u8 = AFD_STATUS_VERSION;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.put_i32(self.dir_check_pid);
        w.put_u32(self.amg_fork_counter);
        w.put_u32(self.fd_fork_counter);
        w.put_u32(self.burst2_counter);
        w.put_u32(self.max_queue_length);
        w.put_u32(self.dir_scans);
        w.put_u32(self.inotify_events);
        for t in [
            self.amg_child_utime,
            self.amg_child_stime,
            self.fd_child_utime,
            self.fd_child_stime,
        ] {
            w.put_i64(t.sec);
            w.put_i64(t.usec);
        }
        self.receive_log.encode(w);
        self.system_log.encode(w);
        self.transfer_log.encode(w);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        let dir_check_pid = r.get_i32();
        let amg_fork_counter = r.get_u32();
        let fd_fork_counter = r.get_u32();
        let burst2_counter = r.get_u32();
        let max_queue_length = r.get_u32();
        let dir_scans = r.get_u32();
        let inotify_events = r.get_u32();
        let mut times = [CpuTime::default(); 4];
        for t in times.iter_mut() {
            t.sec = r.get_i64();
            t.usec = r.get_i64();
        }
        Self {
            dir_check_pid,
            amg_fork_counter,
            fd_fork_counter,
            burst2_counter,
            max_queue_length,
            dir_scans,
            inotify_events,
            amg_child_utime: times[0],
            amg_child_stime: times[1],
            fd_child_utime: times[2],
            fd_child_stime: times[3],
            receive_log: LogRing::decode(r),
            system_log: LogRing::decode(r),
            transfer_log: LogRing::decode(r),
        }
    }
}
