//! End-to-end runs of the dir_check binary with real workers.

use afd_dir_check::dcpl::{ProcessList, DCPL_FILE};
use afd_dir_check::fifo::{self, DcCommand, ACKN, DC_CMD_FIFO, DC_RESP_FIFO};
use afd_dir_check::jobs::{CompiledConfig, CompiledDir, CompiledJob, COMPILED_DIR_CONFIG_FILE};
use afd_dir_check::logs::production::PRODUCTION_LOG_FILE;
use afd_dir_check::logs::{record_lines, ProductionRecord, LOG_DIR};
use afd_dir_check::message::MessageBuffer;
use afd_dir_check::startup::fifo_dir;
use afd_dir_check::system_data::SYSTEM_DATA_FILE;
use afd_dir_check::tables::afd_status::AFD_STATUS_FILE;
use afd_dir_check::tables::fra::FRA_FILE;
use afd_dir_check::tables::fsa::FSA_FILE;
use afd_dir_check::tables::{AfdStatus, DirEntry, HostEntry, MappedTable, SizePolicy};
use afd_dir_check::worker::OUTGOING_DIR;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

struct Site {
    _temp: TempDir,
    work: PathBuf,
    src: PathBuf,
}

impl Site {
    fn new(config: &str, masks: &[&str]) -> Self {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        let src = temp.path().join("in");
        fs::create_dir_all(work.join("etc")).unwrap();
        fs::create_dir_all(&src).unwrap();
        fs::write(work.join("etc").join("AFD_CONFIG"), config).unwrap();

        let fifos = fifo_dir(&work);
        fs::create_dir_all(&fifos).unwrap();
        MappedTable::create(&fifos.join(FSA_FILE), &[HostEntry::new(1, "h", "h")], 0).unwrap();
        MappedTable::create(&fifos.join(FRA_FILE), &[DirEntry::new(0x10, "in", &src)], 0).unwrap();
        MappedTable::create(&fifos.join(AFD_STATUS_FILE), &[AfdStatus::default()], 0).unwrap();

        let compiled = CompiledConfig {
            directories: vec![CompiledDir {
                dir_alias: "in".to_string(),
                jobs: vec![CompiledJob {
                    file_masks: masks.iter().map(|m| m.to_string()).collect(),
                    recipient: "sftp://h/".to_string(),
                    host_alias: None,
                    priority: '5',
                    local_options: Vec::new(),
                    standard_options: Vec::new(),
                }],
            }],
        };
        fs::write(
            fifos.join(COMPILED_DIR_CONFIG_FILE),
            serde_json::to_vec(&compiled).unwrap(),
        )
        .unwrap();

        Self {
            _temp: temp,
            work,
            src,
        }
    }

    fn put(&self, name: &str, content: &[u8]) {
        let path = self.src.join(name);
        fs::write(&path, content).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(10))
            .unwrap();
    }

    fn start(&self) -> Child {
        Command::new(env!("CARGO_BIN_EXE_dir_check"))
            .arg(&self.work)
            .args(["1", "2", "1", "755", "0"])
            .env("RUST_LOG", "info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn send(&self, cmd: DcCommand) -> bool {
        fifo::send(&fifo_dir(&self.work).join(DC_CMD_FIFO), &[cmd.as_byte()]).unwrap()
    }

    fn production(&self) -> Vec<ProductionRecord> {
        let content = fs::read_to_string(self.work.join(LOG_DIR).join(PRODUCTION_LOG_FILE)).unwrap_or_default();
        record_lines(&content)
            .filter_map(|l| ProductionRecord::parse(l).ok())
            .map(|(_, r)| r)
            .collect()
    }

    fn fra(&self) -> DirEntry {
        let table = MappedTable::<DirEntry>::attach(&fifo_dir(&self.work).join(FRA_FILE), SizePolicy::Exact).unwrap();
        table.read(0).unwrap()
    }

    fn staged(&self, name: &str) -> Option<PathBuf> {
        let outgoing = self.work.join(OUTGOING_DIR);
        for job in fs::read_dir(outgoing).ok()?.filter_map(Result::ok) {
            for unique in fs::read_dir(job.path()).ok()?.filter_map(Result::ok) {
                let candidate = unique.path().join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut done: F) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    done()
}

fn wait_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let mut status = None;
    wait_for(timeout, || {
        status = child.try_wait().unwrap();
        status.is_some()
    });
    if status.is_none() {
        let _ = child.kill();
    }
    status
}

/// Keep sending until dir_check has opened its command fifo.
fn stop(site: &Site, child: &mut Child) -> Option<ExitStatus> {
    wait_for(Duration::from_secs(10), || site.send(DcCommand::Stop));
    wait_exit(child, Duration::from_secs(20))
}

fn config(extra: &str) -> String {
    format!(
        "FILE_STABILITY_WINDOW 0\nDC_WORKER_PROGRAM {}\n{}",
        env!("CARGO_BIN_EXE_dc_worker"),
        extra
    )
}

#[tokio::test]
async fn test_single_file_is_staged_and_handed_over() {
    let site = Site::new(&config(""), &["*.txt"]);
    site.put("a.txt", b"hello");
    let mut child = site.start();

    assert!(wait_for(Duration::from_secs(15), || site.staged("a.txt").is_some()));
    assert!(wait_for(Duration::from_secs(10), || {
        MessageBuffer::open(&fifo_dir(&site.work))
            .and_then(|b| b.read_all())
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }));
    assert!(!site.src.join("a.txt").exists());

    let records = site.production();
    let record = records.iter().find(|r| r.orig_name == "a.txt").unwrap();
    assert_eq!(record.new_name, "a.txt");
    assert_eq!(record.orig_size, 5);
    assert_eq!(record.new_size, 5);
    assert_eq!(record.rc, 0);

    let messages = MessageBuffer::open(&fifo_dir(&site.work)).unwrap().read_all().unwrap();
    assert_eq!(messages[0].files, 1);
    assert_eq!(messages[0].bytes, 5);
    assert_eq!(messages[0].job_id, record.job_id);

    let status = stop(&site, &mut child).unwrap();
    assert!(status.success());
    assert_eq!(site.fra().no_of_process, 0);
    let dcpl = ProcessList::open(&fifo_dir(&site.work).join(DCPL_FILE), 2).unwrap();
    assert!(dcpl.is_empty());
    assert!(fifo_dir(&site.work).join(SYSTEM_DATA_FILE).exists());
}

#[tokio::test]
async fn test_worker_timeout_is_recorded_faulty() {
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("slow.sh");
    fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let cfg = format!(
        "FILE_STABILITY_WINDOW 0\nEXEC_TIMEOUT 1\nDIR_CHECK_SHUTDOWN_GRACE 1\nDC_WORKER_PROGRAM {}\n",
        script.display()
    );
    let site = Site::new(&cfg, &["*"]);
    site.put("a.txt", b"hello");
    let mut child = site.start();

    assert!(wait_for(Duration::from_secs(15), || {
        site.production().iter().any(|r| r.orig_name == "a.txt" && r.rc != 0)
    }));
    let status = stop(&site, &mut child).unwrap();
    assert!(status.success());

    assert_eq!(site.fra().no_of_process, 0);
    let dcpl = ProcessList::open(&fifo_dir(&site.work).join(DCPL_FILE), 2).unwrap();
    assert!(dcpl.is_empty());
    // nothing was staged, so the file stays for the next run
    assert!(site.src.join("a.txt").exists());
}

#[tokio::test]
async fn test_is_alive_is_acknowledged() {
    let site = Site::new(&config(""), &["*"]);
    let resp_path = fifo_dir(&site.work).join(DC_RESP_FIFO);
    let mut child = site.start();

    // the fifo exists once startup has run
    assert!(wait_for(Duration::from_secs(10), || resp_path.exists()));
    let mut resp = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&resp_path)
        .unwrap();
    assert!(wait_for(Duration::from_secs(10), || site.send(DcCommand::IsAlive)));

    let mut byte = [0u8; 1];
    assert!(wait_for(Duration::from_secs(5), || resp.read(&mut byte).map(|n| n == 1).unwrap_or(false)));
    assert_eq!(byte[0], ACKN);

    assert!(stop(&site, &mut child).unwrap().success());
}

#[test]
fn test_wrong_argument_count_fails() {
    let status = Command::new(env!("CARGO_BIN_EXE_dir_check"))
        .arg("/nonexistent")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn test_missing_work_dir_fails() {
    let temp = TempDir::new().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_dir_check"))
        .arg(temp.path().join("missing"))
        .args(["1", "2", "1", "755", "0"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn test_worker_rejects_missing_manifest() {
    let temp = TempDir::new().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_dc_worker"))
        .arg(temp.path().join("none.json"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}
