//! Local (AMG) job options understood by dir_check.
//!
//! Standard (FD) options are opaque here and only passed through.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseChange {
    Upper,
    Lower,
}

impl CaseChange {
    pub fn apply(self, name: &str) -> String {
        match self {
            CaseChange::Upper => name.to_uppercase(),
            CaseChange::Lower => name.to_lowercase(),
        }
    }
}

/// What the duplicate check compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DupcheckMode {
    #[default]
    Name,
    NameSize,
    Content,
}

impl DupcheckMode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(DupcheckMode::Name),
            2 => Some(DupcheckMode::NameSize),
            3 => Some(DupcheckMode::Content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupcheckSpec {
    /// Seconds a key is remembered.
    pub timeout: u64,
    pub mode: DupcheckMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOptions {
    pub rename_rule: Option<String>,
    pub case: Option<CaseChange>,
    pub age_limit: Option<u64>,
    pub dupcheck: Option<DupcheckSpec>,
    pub exec_timeout: Option<u64>,
}

impl LocalOptions {
    /// Parse the option lines of one job.
    ///
    /// Unknown or malformed options are logged and ignored.
    ///
    /// # Arguments
    /// * `lines` - Local option lines, one option per entry
    /// * `default_dupcheck_timeout` - Timeout for a bare `dupcheck`
    pub fn parse(lines: &[String], default_dupcheck_timeout: u64) -> Self {
        let mut opts = LocalOptions::default();
        for line in lines {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let args: Vec<&str> = words.collect();
            match keyword {
                "rename" => match args.first() {
                    Some(rule) => opts.rename_rule = Some(rule.to_string()),
                    None => warn!(option = %line, "rename option without rule name"),
                },
                "toupper" => opts.case = Some(CaseChange::Upper),
                "tolower" => opts.case = Some(CaseChange::Lower),
                "age-limit" => match args.first().and_then(|a| a.parse().ok()) {
                    Some(secs) => opts.age_limit = Some(secs),
                    None => warn!(option = %line, "Invalid age-limit option"),
                },
                "exec-timeout" => match args.first().and_then(|a| a.parse().ok()) {
                    Some(secs) => opts.exec_timeout = Some(secs),
                    None => warn!(option = %line, "Invalid exec-timeout option"),
                },
                "dupcheck" => {
                    let timeout = args
                        .first()
                        .and_then(|a| a.parse().ok())
                        .unwrap_or(default_dupcheck_timeout);
                    let mode = match args.get(1) {
                        None => DupcheckMode::default(),
                        Some(code) => match code.parse().ok().and_then(DupcheckMode::from_code) {
                            Some(mode) => mode,
                            None => {
                                warn!(option = %line, "Unknown dupcheck mode, using name");
                                DupcheckMode::default()
                            }
                        },
                    };
                    opts.dupcheck = Some(DupcheckSpec { timeout, mode });
                }
                _ => warn!(option = %line, "Unknown local option ignored"),
            }
        }
        opts
    }

    /// Effective age limit: the job's own, else the configured default
    /// (0 disables).
    pub fn effective_age_limit(&self, default_age_limit: u64) -> Option<u64> {
        self.age_limit
            .or(Some(default_age_limit))
            .filter(|&secs| secs > 0)
    }
}
