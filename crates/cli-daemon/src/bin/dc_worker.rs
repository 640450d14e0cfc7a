//! Batch worker started by dir_check
//!
//! Stages the files named in a manifest, logs one production line per
//! file and reports a finish message on `ip_fin`.

use afd_dir_check::scan::now_unix;
use afd_dir_check::worker::report;
use afd_dir_check::{init_logging, run_batch, WorkerManifest};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};

/// Stage one batch of files for the transfer daemon
#[derive(Parser, Debug)]
#[command(name = "dc_worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Manifest written by dir_check
    manifest: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(None);

    let manifest = match WorkerManifest::load(&args.manifest) {
        Ok(m) => m,
        Err(e) => {
            error!(manifest = %args.manifest.display(), error = %e, "Failed to load manifest");
            return ExitCode::FAILURE;
        }
    };

    let finish = match run_batch(&manifest, now_unix()) {
        Ok(msg) => msg,
        Err(e) => {
            error!(job_id = %format!("{:x}", manifest.job_id), error = %e, "Batch failed");
            return ExitCode::FAILURE;
        }
    };
    debug!(files = finish.files, bytes = finish.bytes, rc = finish.rc, "Batch staged");

    if let Err(e) = report(&manifest.fin_fifo, &finish) {
        error!(fifo = %manifest.fin_fifo.display(), error = %e, "Failed to report to dir_check");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
