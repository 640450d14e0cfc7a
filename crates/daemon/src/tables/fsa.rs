//! Filetransfer status area: one record per host, written by FD.
//!
//! dir_check only reads these rows to decide whether a batch may be
//! dispatched for a host.

use crate::tables::codec::{FieldReader, FieldWriter};
use crate::tables::flags::{HostStatus, ProtocolOptions, ProtocolSet};
use crate::tables::mapped::Record;

pub const FSA_FILE: &str = "fsa.status";
pub const FSA_VERSION: u8 = 4;

pub const MAX_HOSTNAME_LENGTH: usize = 16;
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 64;
pub const MAX_NO_PARALLEL_JOBS: usize = 5;

/// Which `real_hostname` slot is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostToggle {
    #[default]
    Primary,
    Secondary,
}

impl HostToggle {
    fn to_byte(self) -> u8 {
        match self {
            HostToggle::Primary => 1,
            HostToggle::Secondary => 2,
        }
    }

    fn from_byte(b: u8) -> Self {
        if b == 2 {
            HostToggle::Secondary
        } else {
            HostToggle::Primary
        }
    }

    pub fn index(self) -> usize {
        match self {
            HostToggle::Primary => 0,
            HostToggle::Secondary => 1,
        }
    }
}

/// Per-transfer sub-record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSlot {
    pub connect_status: u8,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    pub job_id: u32,
    pub bytes_send: u64,
}

const TRANSFER_SLOT_SIZE: usize = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub host_id: u32,
    pub host_alias: String,
    pub real_hostname: [String; 2],
    pub host_toggle: HostToggle,
    pub toggle_pos: u8,
    pub allowed_transfers: u8,
    pub active_transfers: u8,
    pub protocol: ProtocolSet,
    pub protocol_options: ProtocolOptions,
    pub host_status: HostStatus,
    pub error_counter: i32,
    pub max_errors: i32,
    pub file_counter_done: u32,
    pub total_errors: u32,
    pub connections: u32,
    pub bytes_send: u64,
    pub last_connection: i64,
    pub start_event_handle: i64,
    pub end_event_handle: i64,
    pub job_status: [TransferSlot; MAX_NO_PARALLEL_JOBS],
}

impl HostEntry {
    pub fn new(host_id: u32, host_alias: &str, hostname: &str) -> Self {
        Self {
            host_id,
            host_alias: host_alias.to_string(),
            real_hostname: [hostname.to_string(), String::new()],
            allowed_transfers: 2,
            max_errors: 10,
            ..Default::default()
        }
    }

    pub fn active_hostname(&self) -> &str {
        &self.real_hostname[self.host_toggle.index()]
    }

    /// Whether a new batch for this host may be handed to FD.
    pub fn accepts_batches(&self) -> bool {
        !self.host_status.is_disabled()
    }
}

impl Record for HostEntry {
    const TABLE: &'static str = "FSA";
    const SIZE: usize = 4
        + MAX_HOSTNAME_LENGTH
        + 2 * MAX_REAL_HOSTNAME_LENGTH
        + 4
        + 8 * 4
        + 4 * 8
        + MAX_NO_PARALLEL_JOBS * TRANSFER_SLOT_SIZE;
    const VERSION: u8 = FSA_VERSION;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.put_u32(self.host_id);
        w.put_str(&self.host_alias, MAX_HOSTNAME_LENGTH);
        for name in &self.real_hostname {
            w.put_str(name, MAX_REAL_HOSTNAME_LENGTH);
        }
        w.put_u8(self.host_toggle.to_byte());
        w.put_u8(self.toggle_pos);
        w.put_u8(self.allowed_transfers.min(MAX_NO_PARALLEL_JOBS as u8));
        w.put_u8(self.active_transfers);
        w.put_u32(self.protocol.bits());
        w.put_u32(self.protocol_options.bits());
        w.put_u32(self.host_status.bits());
        w.put_i32(self.error_counter.max(0));
        w.put_i32(self.max_errors);
        w.put_u32(self.file_counter_done);
        w.put_u32(self.total_errors);
        w.put_u32(self.connections);
        w.put_u64(self.bytes_send);
        w.put_i64(self.last_connection);
        w.put_i64(self.start_event_handle);
        w.put_i64(self.end_event_handle);
        for slot in &self.job_status {
            w.put_u8(slot.connect_status);
            w.skip(3);
            w.put_i32(slot.no_of_files);
            w.put_i32(slot.no_of_files_done);
            w.put_u32(slot.job_id);
            w.put_u64(slot.bytes_send);
        }
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        let host_id = r.get_u32();
        let host_alias = r.get_str(MAX_HOSTNAME_LENGTH);
        let real_hostname = [
            r.get_str(MAX_REAL_HOSTNAME_LENGTH),
            r.get_str(MAX_REAL_HOSTNAME_LENGTH),
        ];
        let host_toggle = HostToggle::from_byte(r.get_u8());
        let toggle_pos = r.get_u8();
        let allowed_transfers = r.get_u8();
        let active_transfers = r.get_u8();
        let protocol = ProtocolSet::from_bits(r.get_u32());
        let protocol_options = ProtocolOptions::from_bits(r.get_u32());
        let host_status = HostStatus::from_bits(r.get_u32());
        let error_counter = r.get_i32();
        let max_errors = r.get_i32();
        let file_counter_done = r.get_u32();
        let total_errors = r.get_u32();
        let connections = r.get_u32();
        let bytes_send = r.get_u64();
        let last_connection = r.get_i64();
        let start_event_handle = r.get_i64();
        let end_event_handle = r.get_i64();
        let job_status = std::array::from_fn(|_| {
            let connect_status = r.get_u8();
            r.skip(3);
            TransferSlot {
                connect_status,
                no_of_files: r.get_i32(),
                no_of_files_done: r.get_i32(),
                job_id: r.get_u32(),
                bytes_send: r.get_u64(),
            }
        });
        Self {
            host_id,
            host_alias,
            real_hostname,
            host_toggle,
            toggle_pos,
            allowed_transfers,
            active_transfers,
            protocol,
            protocol_options,
            host_status,
            error_counter,
            max_errors,
            file_counter_done,
            total_errors,
            connections,
            bytes_send,
            last_connection,
            start_event_handle,
            end_event_handle,
            job_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::mapped::{MappedTable, SizePolicy};
    use tempfile::TempDir;

    #[test]
    fn test_host_entry_survives_mapping() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(FSA_FILE);
        let mut host = HostEntry::new(0xdead, "h", "h.example.org");
        host.real_hostname[1] = "h2.example.org".into();
        host.host_toggle = HostToggle::Secondary;
        host.protocol = ProtocolSet::SFTP;
        host.host_status = HostStatus::PAUSE_QUEUE | HostStatus::ERROR_OFFLINE_T;
        host.job_status[4].job_id = 77;
        host.job_status[4].bytes_send = 1 << 40;
        MappedTable::create(&path, &[host.clone()], 0).unwrap();

        let fsa = MappedTable::<HostEntry>::attach(&path, SizePolicy::Exact).unwrap();
        let back = fsa.read(0).unwrap();
        assert_eq!(back, host);
        assert_eq!(back.active_hostname(), "h2.example.org");
        assert!(back.host_status.is_queue_paused());
    }

    #[test]
    fn test_negative_error_counter_is_stored_as_zero() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(FSA_FILE);
        let mut host = HostEntry::new(1, "h", "h");
        host.error_counter = -4;
        let fsa = MappedTable::create(&path, &[host], 0).unwrap();
        assert_eq!(fsa.read(0).unwrap().error_counter, 0);
    }

    #[test]
    fn test_disabled_host_refuses_batches() {
        let mut host = HostEntry::new(1, "h", "h");
        assert!(host.accepts_batches());
        host.host_status.insert(HostStatus::HOST_DISABLED);
        assert!(!host.accepts_batches());
    }
}
