//! Stability checking for files that may still be written to.
//!
//! A file is stable once its modification time lies outside the stability
//! window and its size did not change since the previous scan that saw it.

use std::collections::HashMap;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged since the previous scan.
    Stable,
    /// File size changed since the previous scan.
    Unstable {
        /// Size seen by the previous scan.
        initial_size: u64,
        /// Size seen now.
        current_size: u64,
    },
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

/// Whether `mtime` is at least `window` seconds in the past.
#[inline]
pub fn is_settled(mtime: i64, now: i64, window: u64) -> bool {
    window == 0 || now.saturating_sub(mtime) >= window as i64
}

/// Sizes of young files seen by earlier scans of one directory.
#[derive(Debug, Default)]
pub struct SizeTracker {
    seen: HashMap<String, u64>,
}

impl SizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a file may be picked up.
    ///
    /// # Arguments
    /// * `name` - File name inside the directory
    /// * `size` - Size reported by the current scan
    /// * `mtime` - Modification time reported by the current scan
    /// * `now` - Current time in seconds
    /// * `window` - Stability window in seconds
    ///
    /// # Returns
    /// `true` when the file is settled and its size matches the previous
    /// scan, if there was one.
    pub fn check(&mut self, name: &str, size: u64, mtime: i64, now: i64, window: u64) -> bool {
        if !is_settled(mtime, now, window) {
            self.seen.insert(name.to_string(), size);
            return false;
        }
        match self.seen.remove(name) {
            Some(previous) => compare_sizes(previous, size) == StabilityResult::Stable,
            None => true,
        }
    }

    /// Drop every tracked name `present` rejects.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, present: F) {
        self.seen.retain(|name, _| present(name));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);

            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                match result {
                    StabilityResult::Unstable { initial_size: i, current_size: c } => {
                        prop_assert_eq!(i, initial_size);
                        prop_assert_eq!(c, current_size);
                    }
                    StabilityResult::Stable => {
                        prop_assert!(false, "Expected Unstable when sizes differ");
                    }
                }
            }
        }

        #[test]
        fn prop_old_files_are_settled(age in 0i64..100_000, window in 0u64..1000) {
            let now = 1_700_000_000;
            prop_assert_eq!(is_settled(now - age, now, window), window == 0 || age >= window as i64);
        }
    }

    #[test]
    fn test_compare_sizes_stable() {
        assert_eq!(compare_sizes(1000, 1000), StabilityResult::Stable);
    }

    #[test]
    fn test_compare_sizes_unstable_smaller() {
        assert_eq!(
            compare_sizes(2000, 1000),
            StabilityResult::Unstable {
                initial_size: 2000,
                current_size: 1000
            }
        );
    }

    #[test]
    fn test_young_file_waits_for_the_window() {
        let mut tracker = SizeTracker::new();
        let now = 1000;
        // unchanged size is not enough while the file is still young
        assert!(!tracker.check("a", 10, now, now, 5));
        assert!(!tracker.check("a", 10, now, now + 1, 5));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.check("a", 10, now, now + 5, 5));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_size_change_across_the_window_waits_one_more_scan() {
        let mut tracker = SizeTracker::new();
        assert!(!tracker.check("a", 10, 1000, 1000, 5));
        assert!(!tracker.check("a", 20, 1000, 1010, 5));
        assert!(tracker.check("a", 20, 1000, 1011, 5));
    }

    #[test]
    fn test_retain_prunes_vanished_names() {
        let mut tracker = SizeTracker::new();
        tracker.check("gone", 1, 1000, 1000, 5);
        tracker.check("here", 1, 1000, 1000, 5);
        tracker.retain(|name| name == "here");
        assert_eq!(tracker.len(), 1);
        assert!(tracker.check("here", 1, 1000, 1005, 5));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_settled_file_passes_at_once() {
        let mut tracker = SizeTracker::new();
        assert!(tracker.check("a", 10, 900, 1000, 5));
        assert!(tracker.is_empty());
    }
}
