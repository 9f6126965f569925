//! File watching for restart triggers.
//!
//! Wraps a recursive `notify` watcher on the working directory and reports
//! an event whenever a path matching the configured globs changes. The
//! supervisor only cares that something changed, so events are dropped
//! rather than queued when the channel is full.

use crate::config::WatchConfig;
use glob::{MatchOptions, Pattern};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

/// A batch of changed paths reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid glob {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("cannot watch {}: {source}", path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Include/exclude glob matching relative to the watch root.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathFilter {
    pub fn new(root: impl Into<PathBuf>, include: &[String], exclude: &[String]) -> Result<Self, WatchError> {
        Ok(Self {
            root: root.into(),
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// True when `path` matches an include glob and neither it nor any of its
    /// ancestor directories (below the root) matches an exclude glob.
    pub fn matches(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if !self.include.iter().any(|p| p.matches_path_with(relative, MATCH_OPTIONS)) {
            return false;
        }
        !relative
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| self.exclude.iter().any(|p| p.matches_path_with(a, MATCH_OPTIONS)))
    }

    /// Existing files under the root that pass the filter.
    pub fn existing_matches(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for pattern in &self.include {
            let root = Pattern::escape(&self.root.to_string_lossy());
            let full = Path::new(&root).join(pattern.as_str());
            let Ok(paths) = glob::glob_with(&full.to_string_lossy(), MATCH_OPTIONS) else {
                continue;
            };
            for path in paths.flatten() {
                if self.matches(&path) && !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        found
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatchError> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|source| WatchError::Pattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// Keeps the OS watcher alive; dropping it stops change reporting.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching `config.root` recursively.
    ///
    /// When `config.ignore_initial` is false, files that already match are
    /// reported once as an initial change.
    pub fn start(config: &WatchConfig) -> Result<(Self, mpsc::Receiver<ChangeEvent>), WatchError> {
        let root = std::fs::canonicalize(&config.root).map_err(|source| WatchError::Root {
            path: config.root.clone(),
            source,
        })?;
        let filter = PathFilter::new(&root, &config.patterns, &config.ignore)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        if !config.ignore_initial {
            let existing = filter.existing_matches();
            if !existing.is_empty() {
                let _ = tx.try_send(ChangeEvent { paths: existing });
            }
        }

        let handler_filter = filter.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = relevant_change(&handler_filter, event) {
                        // A full channel already guarantees a pending restart.
                        let _ = tx.try_send(change);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watching error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        tracing::info!(
            root = %root.display(),
            patterns = ?config.patterns,
            ignore = ?config.ignore,
            "watching for changes"
        );
        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Reduce a raw notify event to the paths the filter cares about.
fn relevant_change(filter: &PathFilter, event: notify::Event) -> Option<ChangeEvent> {
    if matches!(event.kind, EventKind::Access(_)) {
        return None;
    }
    let paths: Vec<PathBuf> = event.paths.into_iter().filter(|p| filter.matches(p)).collect();
    if paths.is_empty() {
        None
    } else {
        Some(ChangeEvent { paths })
    }
}
