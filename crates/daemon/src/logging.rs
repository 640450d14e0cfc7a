//! tracing subscriber setup for the dir_check binaries.

use crate::fifo::SYSTEM_LOG_FIFO;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "afd_dir_check=info,dir_check=info,dc_worker=info";

/// Open the `system_log` fifo for writing if a reader is attached.
pub fn open_system_log(fifo_dir: &Path) -> Option<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo_dir.join(SYSTEM_LOG_FIFO))
        .ok()
}

/// Install the global subscriber.
///
/// Events go to the `system_log` fifo when `fifo_dir` is given and the
/// supervisor listens on it, else to stderr. `RUST_LOG` overrides the
/// default filter. Calling this twice is harmless.
pub fn init_logging(fifo_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match fifo_dir.and_then(open_system_log) {
        Some(fifo) => builder.with_ansi(false).with_writer(Mutex::new(fifo)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Subscriber already installed");
    }
}
