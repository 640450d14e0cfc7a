//! AFD dir_check
//!
//! Background service that scans local source directories, matches new
//! files against the distribution jobs of each directory, and hands the
//! selected files to short-lived workers that stage them for the transfer
//! daemon.

pub mod concurrency;
pub mod counter;
pub mod daemon;
pub mod dcpl;
pub mod dupcheck;
pub mod fifo;
pub mod filter;
pub mod jobs;
pub mod logging;
pub mod logs;
pub mod message;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod recovery;
pub mod rules;
pub mod scan;
pub mod selection;
pub mod stability;
pub mod startup;
pub mod system_data;
pub mod tables;
pub mod watch;
pub mod worker;
pub mod worker_pool;

pub use afd_config as config;
pub use afd_config::DirCheckConfig;
pub use concurrency::{DispatchPlan, Eligibility};
pub use daemon::{DaemonError, DirCheck, DirCheckArgs, Fifos};
pub use fifo::{DcCommand, ACKN};
pub use jobs::{ActiveJobDb, Job, JobDb};
pub use logging::init_logging;
pub use message::{FinishMessage, JobMessage};
pub use metrics::{DirCheckStats, QueueSnapshot};
pub use startup::{parse_octal_mode, run_startup_checks, StartupError};
pub use system_data::SystemData;
pub use worker::{run_batch, WorkerManifest};
