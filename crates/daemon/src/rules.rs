//! Rename rules applied by workers while staging files.
//!
//! A rule file holds `[name]` sections followed by `filter replacement`
//! lines. The replacement may refer to wildcard captures of the filter:
//! `%*N` is the N-th `*`, `%?N` the N-th `?` (1-based), `%n` the batch
//! unique number in hex and `%%` a literal percent sign.

use crate::filter::glob_captures;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const RENAME_RULE_FILE: &str = "rename.rule";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    pub filter: String,
    pub replacement: String,
}

impl RenameRule {
    /// Rename `name` if the filter matches.
    pub fn apply(&self, name: &str, unique: u32) -> Option<String> {
        let caps = glob_captures(&self.filter, name)?;
        let mut out = String::with_capacity(self.replacement.len() + name.len());
        let mut chars = self.replacement.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                Some('n') => {
                    chars.next();
                    out.push_str(&format!("{:x}", unique));
                }
                Some(kind @ ('*' | '?')) => {
                    chars.next();
                    let mut digits = String::new();
                    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                        digits.push(*d);
                        chars.next();
                    }
                    let index = digits.parse::<usize>().ok().and_then(|n| n.checked_sub(1));
                    match (kind, index) {
                        ('*', Some(i)) => {
                            if let Some(text) = caps.stars.get(i) {
                                out.push_str(text);
                            }
                        }
                        ('?', Some(i)) => {
                            if let Some(ch) = caps.questions.get(i) {
                                out.push(*ch);
                            }
                        }
                        _ => {
                            out.push('%');
                            out.push(kind);
                            out.push_str(&digits);
                        }
                    }
                }
                _ => out.push('%'),
            }
        }
        Some(out)
    }
}

/// All rename rules, indexed by section name. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<String, Vec<RenameRule>>,
}

impl RuleSet {
    /// Load `etc/rename.rule` plus the optional extra rule files.
    ///
    /// Missing files are skipped. A section defined again in a later file
    /// replaces the earlier one.
    ///
    /// # Arguments
    /// * `etc_dir` - The `etc` directory below the working directory
    /// * `extra` - Additional file names resolved under `etc_dir`
    pub fn load(etc_dir: &Path, extra: &[&str]) -> Result<Self, RuleError> {
        let mut set = RuleSet::default();
        let names = std::iter::once(RENAME_RULE_FILE).chain(extra.iter().copied());
        for name in names {
            let path = etc_dir.join(name);
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No rule file");
                    continue;
                }
                Err(source) => return Err(RuleError::Io { path, source }),
            };
            for (rule, lines) in Self::parse(&path, &content)?.rules {
                if set.rules.insert(rule.clone(), lines).is_some() {
                    warn!(rule = %rule, path = %path.display(), "Rule redefined");
                }
            }
        }
        Ok(set)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, RuleError> {
        let mut rules: BTreeMap<String, Vec<RenameRule>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| RuleError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "unterminated rule header".into(),
                })?;
                rules.entry(name.trim().to_string()).or_default();
                current = Some(name.trim().to_string());
                continue;
            }
            let Some(rule) = current.as_ref() else {
                return Err(RuleError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "rule line outside of a [rule] section".into(),
                });
            };
            let mut parts = line.split_whitespace();
            let (Some(filter), Some(replacement)) = (parts.next(), parts.next()) else {
                return Err(RuleError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "missing replacement".into(),
                });
            };
            rules.entry(rule.clone()).or_default().push(RenameRule {
                filter: filter.to_string(),
                replacement: replacement.to_string(),
            });
        }
        Ok(Self { rules })
    }

    pub fn get(&self, rule: &str) -> Option<&[RenameRule]> {
        self.rules.get(rule).map(|v| v.as_slice())
    }

    pub fn contains(&self, rule: &str) -> bool {
        self.rules.contains_key(rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// New name for `name` under `rule`; the first matching line wins and
    /// an unmatched name keeps its name.
    pub fn rename(&self, rule: &str, name: &str, unique: u32) -> String {
        self.get(rule)
            .and_then(|lines| lines.iter().find_map(|r| r.apply(name, unique)))
            .unwrap_or_else(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const RULES: &str = "\
# comment
[gts]
*.tmp     %*1.dat
x??_*     %?2%?1-%*1

[unique]
*         %*1.%n
*         never
";

    fn rules() -> RuleSet {
        RuleSet::parse(Path::new("rename.rule"), RULES).unwrap()
    }

    #[test]
    fn test_first_matching_line_wins() {
        let set = rules();
        assert_eq!(set.rename("gts", "report.tmp", 0), "report.dat");
        assert_eq!(set.rename("gts", "x12_abc", 0), "21-abc");
        assert_eq!(set.rename("unique", "file", 0x2a), "file.2a");
    }

    #[test]
    fn test_unmatched_name_is_kept() {
        let set = rules();
        assert_eq!(set.rename("gts", "plain.bin", 0), "plain.bin");
        assert_eq!(set.rename("missing", "plain.bin", 0), "plain.bin");
    }

    #[test]
    fn test_percent_escapes() {
        let rule = RenameRule {
            filter: "*".into(),
            replacement: "100%%_%*1_%*9_%x".into(),
        };
        assert_eq!(rule.apply("a", 0).unwrap(), "100%_a__%x");
    }

    #[test]
    fn test_line_outside_section_is_error() {
        let err = RuleSet::parse(Path::new("r"), "*.a %*1.b\n").unwrap_err();
        assert!(matches!(err, RuleError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_missing_replacement_is_error() {
        let err = RuleSet::parse(Path::new("r"), "[a]\n*.a\n").unwrap_err();
        assert!(matches!(err, RuleError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_load_merges_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(RENAME_RULE_FILE), RULES).unwrap();
        fs::write(temp.path().join("bul.rule"), "[gts]\n* bul_%*1\n").unwrap();
        let set = RuleSet::load(temp.path(), &["bul.rule", "absent.rule"]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.rename("gts", "a.tmp", 0), "bul_a.tmp");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_identity_rule(name in "[a-zA-Z0-9._-]{1,30}") {
            let rule = RenameRule { filter: "*".into(), replacement: "%*1".into() };
            prop_assert_eq!(rule.apply(&name, 7), Some(name.clone()));
        }
    }
}
