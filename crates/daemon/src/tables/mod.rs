//! Memory-mapped status tables shared with the other AFD daemons.

pub mod afd_status;
pub mod codec;
pub mod flags;
pub mod fra;
pub mod fsa;
pub mod mapped;

pub use afd_status::{AfdStatus, CpuTime, LogKind, LogRing, LogSign};
pub use flags::{DirFlag, DirOptions, HostStatus, ProtocolOptions, ProtocolSet};
pub use fra::DirEntry;
pub use fsa::HostEntry;
pub use mapped::{AttachRetry, MappedTable, Record, SizePolicy, TableError, TableHeader};
