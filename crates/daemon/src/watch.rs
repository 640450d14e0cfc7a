//! Filesystem watches for event-driven directories.
//!
//! notify delivers events on its own thread; they are forwarded into a
//! tokio channel that the driver selects on. Names are accumulated per
//! directory until the next dispatch pass consumes them.

use crate::tables::flags::DirOptions;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Map a notify event kind onto the option bit that requests it.
pub fn event_option(kind: &EventKind) -> Option<DirOptions> {
    match kind {
        EventKind::Create(_) => Some(DirOptions::INOTIFY_CREATE),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(DirOptions::INOTIFY_CLOSE),
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both | RenameMode::Any)) => {
            Some(DirOptions::INOTIFY_RENAME)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(DirOptions::INOTIFY_ATTRIB),
        EventKind::Remove(_) => Some(DirOptions::INOTIFY_DELETE),
        _ => None,
    }
}

/// Names reported by events, grouped by FRA position.
#[derive(Debug, Default)]
pub struct WatchAccumulator {
    per_dir: BTreeMap<usize, Vec<String>>,
    events: u32,
}

impl WatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event for a directory watched with `options`.
    ///
    /// Returns true when the event was of a requested kind.
    pub fn record(&mut self, fra_pos: usize, options: DirOptions, kind: &EventKind, name: &str) -> bool {
        let Some(bit) = event_option(kind) else {
            return false;
        };
        if !options.intersects(bit) {
            return false;
        }
        self.events = self.events.wrapping_add(1);
        let names = self.per_dir.entry(fra_pos).or_default();
        if bit == DirOptions::INOTIFY_DELETE {
            names.retain(|n| n != name);
        } else if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        true
    }

    /// Take and clear the names collected for one directory.
    pub fn take(&mut self, fra_pos: usize) -> Vec<String> {
        self.per_dir.remove(&fra_pos).unwrap_or_default()
    }

    pub fn has_names(&self, fra_pos: usize) -> bool {
        self.per_dir.get(&fra_pos).is_some_and(|n| !n.is_empty())
    }

    /// Events counted since the last call.
    pub fn take_event_count(&mut self) -> u32 {
        std::mem::take(&mut self.events)
    }
}

/// notify watcher plus the directories it covers.
pub struct DirWatcher {
    watcher: RecommendedWatcher,
    dirs: HashMap<PathBuf, (usize, DirOptions)>,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl DirWatcher {
    pub fn new() -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        Ok(Self {
            watcher,
            dirs: HashMap::new(),
            rx,
        })
    }

    /// Watch one directory (non-recursive).
    pub fn add(&mut self, fra_pos: usize, dir: &Path, options: DirOptions) -> notify::Result<()> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!(path = %dir.display(), "Watching directory");
        self.dirs.insert(dir.to_path_buf(), (fra_pos, options));
        Ok(())
    }

    /// Drop every watch, e.g. before the directory set is rebuilt.
    pub fn clear(&mut self) {
        for dir in self.dirs.keys() {
            if let Err(e) = self.watcher.unwatch(dir) {
                debug!(path = %dir.display(), error = %e, "Failed to remove watch");
            }
        }
        self.dirs.clear();
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Wait for the next event batch from notify.
    pub async fn recv(&mut self) -> Option<notify::Result<Event>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used to drain after a wakeup.
    pub fn try_recv(&mut self) -> Option<notify::Result<Event>> {
        self.rx.try_recv().ok()
    }

    /// Feed one notify result into the accumulator.
    pub fn apply(&self, result: notify::Result<Event>, acc: &mut WatchAccumulator) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Filesystem watch error");
                return;
            }
        };
        for path in &event.paths {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };
            if let Some(&(fra_pos, options)) = self.dirs.get(parent) {
                acc.record(fra_pos, options, &event.kind, &name.to_string_lossy());
            }
        }
    }
}
