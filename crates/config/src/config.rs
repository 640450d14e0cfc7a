//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the configuration file below `<work_dir>/etc`.
pub const AFD_CONFIG_FILE: &str = "AFD_CONFIG";

/// Upper bound for the file-name pool of a single directory scan.
pub const MAX_FILE_BUFFER_SIZE: u32 = 10_240;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// A line carries a malformed key
    Parse { line: usize, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse { line, reason } => {
                write!(f, "Failed to parse config line {}: {}", line, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Runtime configuration of dir_check.
///
/// Every field maps to one `AFD_CONFIG` key of the same name in upper case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirCheckConfig {
    /// Scan budget per directory per tick, seconds (2-3600).
    pub one_dir_copy_timeout: u64,
    /// Bound on one full scan across all directories, seconds (0 = unbounded).
    pub full_scan_timeout: u64,
    /// Forced full scan cadence for event-driven directories (0 = disabled).
    pub force_reread_interval: u64,
    /// Outer loop budget, seconds (2-3600).
    pub dir_check_timeout: u64,
    /// File-name pool capacity per scan.
    pub max_copied_files: u32,
    /// Age limit for jobs without their own, seconds (0 = disabled).
    pub default_age_limit: u64,
    /// Per-worker timeout, seconds (0 = no limit).
    pub exec_timeout: u64,
    /// Locked-file filters; a leading `!` means "must not match".
    pub additional_locked_files: Vec<String>,
    /// Base niceness for workers; `None` leaves niceness untouched.
    pub exec_base_priority: Option<i32>,
    /// Add the job priority digit to the base niceness.
    pub add_afd_priority: bool,
    pub max_nice_value: i32,
    pub min_nice_value: i32,
    /// Bulletin rule file below `etc/`.
    pub bul_rule_file_name: Option<String>,
    /// Report rule file below `etc/`.
    pub rep_rule_file_name: Option<String>,
    /// Files younger than this many seconds are left for the next scan.
    pub file_stability_window: u64,
    /// Grace period for running workers at shutdown, seconds.
    pub shutdown_grace: u64,
    /// Dupcheck timeout when the job option does not name one, seconds.
    pub dupcheck_default_timeout: u64,
    /// Worker binary; defaults to `dc_worker` next to the running executable.
    pub dc_worker_program: Option<PathBuf>,
}

impl Default for DirCheckConfig {
    fn default() -> Self {
        Self {
            one_dir_copy_timeout: 10,
            full_scan_timeout: 0,
            force_reread_interval: 0,
            dir_check_timeout: 30,
            max_copied_files: 100,
            default_age_limit: 0,
            exec_timeout: 0,
            additional_locked_files: Vec::new(),
            exec_base_priority: None,
            add_afd_priority: false,
            max_nice_value: 19,
            min_nice_value: 0,
            bul_rule_file_name: None,
            rep_rule_file_name: None,
            file_stability_window: 2,
            shutdown_grace: 10,
            dupcheck_default_timeout: 3600,
            dc_worker_program: None,
        }
    }
}

/// Every key this crate understands, in the order they are documented.
pub const KNOWN_KEYS: &[&str] = &[
    "ONE_DIR_COPY_TIMEOUT",
    "FULL_SCAN_TIMEOUT",
    "FORCE_REREAD_INTERVAL",
    "DIR_CHECK_TIMEOUT",
    "MAX_COPIED_FILES",
    "DEFAULT_AGE_LIMIT",
    "EXEC_TIMEOUT",
    "ADDITIONAL_LOCKED_FILES",
    "EXEC_BASE_PRIORITY",
    "ADD_AFD_PRIORITY",
    "MAX_NICE_VALUE",
    "MIN_NICE_VALUE",
    "BUL_RULE_FILE_NAME",
    "REP_RULE_FILE_NAME",
    "FILE_STABILITY_WINDOW",
    "DIR_CHECK_SHUTDOWN_GRACE",
    "DUPCHECK_DEFAULT_TIMEOUT",
    "DC_WORKER_PROGRAM",
];

impl DirCheckConfig {
    /// Load configuration from an `AFD_CONFIG` file.
    ///
    /// A missing file is not an error: AFD runs fine without one, so the
    /// defaults are returned.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.as_ref().display(), "No AFD_CONFIG, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration from `AFD_CONFIG` text.
    ///
    /// Keys this daemon does not care about belong to sibling daemons and
    /// are ignored. A recognised key with a bad value keeps its default.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(|c: char| c.is_ascii_whitespace()) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            if !key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(ConfigError::Parse {
                    line: idx + 1,
                    reason: format!("invalid key `{}`", key),
                });
            }
            config.set(key, value);
        }

        config.clamp();
        Ok(config)
    }

    /// Apply one key/value pair. Returns false for keys this daemon ignores.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        match key {
            "ONE_DIR_COPY_TIMEOUT" => {
                set_number(key, value, &mut self.one_dir_copy_timeout);
            }
            "FULL_SCAN_TIMEOUT" => {
                set_number(key, value, &mut self.full_scan_timeout);
            }
            "FORCE_REREAD_INTERVAL" => {
                set_number(key, value, &mut self.force_reread_interval);
            }
            "DIR_CHECK_TIMEOUT" => {
                set_number(key, value, &mut self.dir_check_timeout);
            }
            "MAX_COPIED_FILES" => {
                set_number(key, value, &mut self.max_copied_files);
            }
            "DEFAULT_AGE_LIMIT" => {
                set_number(key, value, &mut self.default_age_limit);
            }
            "EXEC_TIMEOUT" => {
                set_number(key, value, &mut self.exec_timeout);
            }
            "ADDITIONAL_LOCKED_FILES" => {
                self.additional_locked_files = value
                    .split('|')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect();
            }
            "EXEC_BASE_PRIORITY" => {
                let mut prio = 0i32;
                if set_number(key, value, &mut prio) {
                    self.exec_base_priority = Some(prio);
                }
            }
            "ADD_AFD_PRIORITY" => match parse_yes_no(value) {
                Some(flag) => self.add_afd_priority = flag,
                None => warn!(key, value, "Expected YES or NO, keeping default"),
            },
            "MAX_NICE_VALUE" => {
                set_number(key, value, &mut self.max_nice_value);
            }
            "MIN_NICE_VALUE" => {
                set_number(key, value, &mut self.min_nice_value);
            }
            "BUL_RULE_FILE_NAME" => self.bul_rule_file_name = non_empty(value),
            "REP_RULE_FILE_NAME" => self.rep_rule_file_name = non_empty(value),
            "FILE_STABILITY_WINDOW" => {
                set_number(key, value, &mut self.file_stability_window);
            }
            "DIR_CHECK_SHUTDOWN_GRACE" => {
                set_number(key, value, &mut self.shutdown_grace);
            }
            "DUPCHECK_DEFAULT_TIMEOUT" => {
                set_number(key, value, &mut self.dupcheck_default_timeout);
            }
            "DC_WORKER_PROGRAM" => self.dc_worker_program = non_empty(value).map(PathBuf::from),
            _ => return false,
        }
        true
    }

    /// Clamp values into their documented ranges.
    pub fn clamp(&mut self) {
        clamp_logged("ONE_DIR_COPY_TIMEOUT", &mut self.one_dir_copy_timeout, 2, 3600);
        clamp_logged("FULL_SCAN_TIMEOUT", &mut self.full_scan_timeout, 0, 3600);
        clamp_logged("DIR_CHECK_TIMEOUT", &mut self.dir_check_timeout, 2, 3600);
        clamp_logged(
            "MAX_COPIED_FILES",
            &mut self.max_copied_files,
            1,
            MAX_FILE_BUFFER_SIZE,
        );
        if self.min_nice_value > self.max_nice_value {
            warn!(
                min = self.min_nice_value,
                max = self.max_nice_value,
                "MIN_NICE_VALUE above MAX_NICE_VALUE, swapping"
            );
            std::mem::swap(&mut self.min_nice_value, &mut self.max_nice_value);
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Every key of [`KNOWN_KEYS`] may be overridden by an environment
    /// variable of the same name.
    pub fn apply_env_overrides(&mut self) {
        for key in KNOWN_KEYS {
            if let Ok(val) = env::var(key) {
                self.set(key, val.trim());
            }
        }
        self.clamp();
    }

    /// Load configuration from `<work_dir>/etc/AFD_CONFIG` and apply environment overrides
    pub fn load<P: AsRef<Path>>(work_dir: P) -> Result<Self, ConfigError> {
        let path = work_dir.as_ref().join("etc").join(AFD_CONFIG_FILE);
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn set_number<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) -> bool {
    match value.parse::<T>() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => {
            warn!(key, value, "Not a number, keeping default");
            false
        }
    }
}

fn clamp_logged<T: PartialOrd + Copy + std::fmt::Display>(key: &str, slot: &mut T, min: T, max: T) {
    if *slot < min || *slot > max {
        let clamped = if *slot < min { min } else { max };
        warn!(key, value = %slot, clamped = %clamped, "Value out of range");
        *slot = clamped;
    }
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_uppercase().as_str() {
        "YES" | "ON" | "1" => Some(true),
        "NO" | "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
