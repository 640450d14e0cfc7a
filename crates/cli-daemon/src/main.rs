//! CLI entry point for dir_check
//!
//! Started by the AFD supervisor with six positional arguments. Runs until
//! a STOP command, SIGTERM/SIGINT or the supervisor's exit.

use afd_dir_check::startup::fifo_dir;
use afd_dir_check::{init_logging, parse_octal_mode, DirCheck, DirCheckArgs};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Scan local directories and hand new files to the transfer daemon
#[derive(Parser, Debug)]
#[command(name = "dir_check")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// AFD working directory
    work_dir: PathBuf,

    /// Default rescan interval in seconds
    rescan_time: u64,

    /// Maximum number of concurrent workers
    max_process: usize,

    /// Number of local directories the supervisor expects
    no_of_local_dirs: usize,

    /// Mode for created source directories, in octal
    #[arg(value_parser = octal_mode)]
    create_source_dir_mode: u32,

    /// Pid of the supervising process, 0 to disable the liveness check
    supervisor_pid: i32,
}

fn octal_mode(s: &str) -> Result<u32, String> {
    parse_octal_mode(s).ok_or_else(|| format!("`{}` is not an octal file mode", s))
}

impl From<Args> for DirCheckArgs {
    fn from(args: Args) -> Self {
        DirCheckArgs {
            work_dir: args.work_dir,
            rescan_time: args.rescan_time,
            max_process: args.max_process,
            no_of_local_dirs: args.no_of_local_dirs,
            create_source_dir_mode: args.create_source_dir_mode,
            supervisor_pid: args.supervisor_pid,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(Some(&fifo_dir(&args.work_dir)));

    let mut dir_check = match DirCheck::start(args.into()) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "Failed to start dir_check");
            eprintln!("dir_check: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = dir_check.run().await {
        error!(error = %e, "dir_check stopped with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
