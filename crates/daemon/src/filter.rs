//! Shell-style file filters with `!` negation.
//!
//! Patterns understand `*`, `?` and bracket classes (`[abc]`, `[a-z]`,
//! `[!x]`). A leading `!` turns a pattern into an exclusion.

/// Outcome of matching one mask against a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskResult {
    /// A plain pattern matched.
    Match,
    /// A `!` pattern matched: the name is excluded.
    Excluded,
    /// The pattern did not apply.
    NoMatch,
}

/// Text consumed by one wildcard during a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Star(String),
    Question(char),
}

/// Captures of a successful match, split by wildcard kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    pub stars: Vec<String>,
    pub questions: Vec<char>,
}

/// Match one mask, honouring a leading `!`.
pub fn pmatch(mask: &str, name: &str) -> MaskResult {
    match mask.strip_prefix('!') {
        Some(pattern) if glob_match(pattern, name) => MaskResult::Excluded,
        Some(_) => MaskResult::NoMatch,
        None if glob_match(mask, name) => MaskResult::Match,
        None => MaskResult::NoMatch,
    }
}

pub fn glob_match(pattern: &str, name: &str) -> bool {
    glob_captures(pattern, name).is_some()
}

/// Match `pattern` against `name`, returning what each wildcard consumed.
///
/// `*` takes the shortest text that still lets the rest match.
pub fn glob_captures(pattern: &str, name: &str) -> Option<Captures> {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = name.chars().collect();
    let mut caps = Vec::new();
    if match_from(&p, &s, &mut caps) {
        let mut out = Captures::default();
        for cap in caps {
            match cap {
                Capture::Star(text) => out.stars.push(text),
                Capture::Question(c) => out.questions.push(c),
            }
        }
        Some(out)
    } else {
        None
    }
}

fn match_from(p: &[char], s: &[char], caps: &mut Vec<Capture>) -> bool {
    let Some((&first, rest)) = p.split_first() else {
        return s.is_empty();
    };
    match first {
        '*' => {
            let mut rest = rest;
            while let Some(('*', tail)) = rest.split_first().map(|(c, t)| (*c, t)) {
                rest = tail;
            }
            for taken in 0..=s.len() {
                let mark = caps.len();
                caps.push(Capture::Star(s[..taken].iter().collect()));
                if match_from(rest, &s[taken..], caps) {
                    return true;
                }
                caps.truncate(mark);
            }
            false
        }
        '?' => match s.split_first() {
            Some((&c, tail)) => {
                let mark = caps.len();
                caps.push(Capture::Question(c));
                if match_from(rest, tail, caps) {
                    true
                } else {
                    caps.truncate(mark);
                    false
                }
            }
            None => false,
        },
        '[' => match (parse_class(rest), s.split_first()) {
            (Some((class, after)), Some((&c, tail))) => {
                class.contains(c) && match_from(after, tail, caps)
            }
            // An unterminated bracket is a literal '['
            (None, Some((&'[', tail))) => match_from(rest, tail, caps),
            _ => false,
        },
        '\\' if !rest.is_empty() => match s.split_first() {
            Some((&c, tail)) if c == rest[0] => match_from(&rest[1..], tail, caps),
            _ => false,
        },
        literal => match s.split_first() {
            Some((&c, tail)) if c == literal => match_from(rest, tail, caps),
            _ => false,
        },
    }
}

struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, c: char) -> bool {
        let hit = self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        hit != self.negated
    }
}

/// Parse the body of a bracket class; `p` starts after the `[`.
fn parse_class(p: &[char]) -> Option<(CharClass, &[char])> {
    let mut i = 0;
    let negated = matches!(p.first(), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    while i < p.len() {
        let c = p[i];
        if c == ']' && !first {
            return Some((CharClass { negated, ranges }, &p[i + 1..]));
        }
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            ranges.push((c, p[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
    None
}

/// Ordered mask list of a job.
///
/// The first mask that decides wins: a plain match selects the file, a
/// matching `!` mask rejects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMasks {
    masks: Vec<String>,
}

impl FileMasks {
    pub fn new(masks: Vec<String>) -> Self {
        Self { masks }
    }

    pub fn masks(&self) -> &[String] {
        &self.masks
    }

    pub fn matches(&self, name: &str) -> bool {
        for mask in &self.masks {
            match pmatch(mask, name) {
                MaskResult::Match => return true,
                MaskResult::Excluded => return false,
                MaskResult::NoMatch => {}
            }
        }
        false
    }
}

/// Filters deciding that a file is still being written and must be left
/// alone for now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockedFilter {
    plain: Vec<String>,
    required: Vec<String>,
}

impl LockedFilter {
    /// Build from `ADDITIONAL_LOCKED_FILES` entries.
    pub fn new(patterns: &[String]) -> Self {
        let mut filter = Self::default();
        for pattern in patterns.iter().filter(|p| !p.is_empty()) {
            match pattern.strip_prefix('!') {
                Some(required) => filter.required.push(required.to_string()),
                None => filter.plain.push(pattern.clone()),
            }
        }
        filter
    }

    /// A file is locked when it matches a plain filter, or when `!`
    /// filters exist and it matches none of them. Dot files are locked
    /// unless the directory accepts them.
    pub fn is_locked(&self, name: &str, accept_dot_files: bool) -> bool {
        if name.starts_with('.') && !accept_dot_files {
            return true;
        }
        if self.plain.iter().any(|p| glob_match(p, name)) {
            return true;
        }
        !self.required.is_empty() && !self.required.iter().any(|p| glob_match(p, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_wildcards() {
        assert!(glob_match("*.txt", "a.txt"));
        assert!(!glob_match("*.txt", "a.txt.gz"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*", ""));
        assert!(glob_match("**x", "abx"));
    }

    #[test]
    fn test_bracket_classes() {
        assert!(glob_match("file[0-9].dat", "file7.dat"));
        assert!(!glob_match("file[0-9].dat", "filex.dat"));
        assert!(glob_match("[!.]*", "visible"));
        assert!(!glob_match("[!.]*", ".hidden"));
        assert!(glob_match("[]]", "]"));
        assert!(glob_match("a[b", "a[b"));
    }

    #[test]
    fn test_escape() {
        assert!(glob_match("a\\*", "a*"));
        assert!(!glob_match("a\\*", "ab"));
    }

    #[test]
    fn test_captures_are_shortest_first() {
        let caps = glob_captures("*.*", "a.b.c").unwrap();
        assert_eq!(caps.stars, vec!["a".to_string(), "b.c".to_string()]);
        let caps = glob_captures("x??_*", "x12_rest").unwrap();
        assert_eq!(caps.questions, vec!['1', '2']);
        assert_eq!(caps.stars, vec!["rest".to_string()]);
    }

    #[test]
    fn test_mask_order_decides() {
        let masks = FileMasks::new(vec!["!*.tmp".into(), "*".into()]);
        assert!(masks.matches("data.bin"));
        assert!(!masks.matches("data.tmp"));

        let masks = FileMasks::new(vec!["*".into(), "!*.tmp".into()]);
        assert!(masks.matches("data.tmp"));

        assert!(!FileMasks::default().matches("anything"));
    }

    #[test]
    fn test_locked_filter_negation() {
        let filter = LockedFilter::new(&["!*.done".to_string()]);
        assert!(!filter.is_locked("c.done", false));
        assert!(filter.is_locked("c.tmp", false));
    }

    #[test]
    fn test_locked_filter_plain_and_dot_files() {
        let filter = LockedFilter::new(&["*.part".to_string()]);
        assert!(filter.is_locked("x.part", false));
        assert!(!filter.is_locked("x.dat", false));
        assert!(filter.is_locked(".x.dat", false));
        assert!(!filter.is_locked(".x.dat", true));
        assert!(!LockedFilter::default().is_locked("x", false));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_literal_matches_only_itself(a in "[a-z0-9._-]{0,12}", b in "[a-z0-9._-]{0,12}") {
            prop_assert!(glob_match(&a, &a));
            prop_assert_eq!(glob_match(&a, &b), a == b);
        }

        #[test]
        fn prop_star_captures_rebuild_name(prefix in "[a-z]{0,6}", middle in "[a-z.]{0,10}", suffix in "[a-z]{0,6}") {
            let name = format!("{}{}{}", prefix, middle, suffix);
            let pattern = format!("{}*{}", prefix, suffix);
            let caps = glob_captures(&pattern, &name).unwrap();
            prop_assert_eq!(caps.stars.len(), 1);
            prop_assert_eq!(format!("{}{}{}", prefix, caps.stars[0], suffix), name);
        }

        #[test]
        fn prop_negated_mask_excludes(name in "[a-z]{1,8}\\.(tmp|dat)") {
            let result = pmatch("!*.tmp", &name);
            if name.ends_with(".tmp") {
                prop_assert_eq!(result, MaskResult::Excluded);
            } else {
                prop_assert_eq!(result, MaskResult::NoMatch);
            }
        }
    }
}
