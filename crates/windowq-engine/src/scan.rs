//! Implementation of the inventory scanner.
//!
//! Windows are discovered at `<root>/<group>/<category>/<subtype><sep><seq>`
//! and yielded in dispatch order: group, category and subtype
//! lexicographically, then the sequence number numerically.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;
use walkdir::DirEntry;
use walkdir::WalkDir;

use crate::WindowDescriptor;
use crate::WindowId;
use crate::config::ScanConfig;
use crate::ledger::Ledger;
use crate::ledger::LedgerError;
use crate::ledger::unpersistable_field;

/// The directory depth of a window below the scan root.
const WINDOW_DEPTH: usize = 3;

/// Represents a scan error.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scan root does not exist or is not a directory.
    #[error("scan root `{path}` is not a directory", path = .0.display())]
    MissingRoot(PathBuf),

    /// The scan root could not be made absolute.
    #[error("failed to resolve scan root `{path}`: {source}", path = .path.display())]
    Root {
        /// The configured scan root.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The window directory pattern could not be built.
    #[error("failed to build window directory pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The ledger still has queued or active work.
    #[error(
        "the ledger has {queued} queued and {active} active window(s); clear the ledger before \
         scanning again"
    )]
    LedgerNotEmpty {
        /// The number of queued windows.
        queued: usize,
        /// The number of active jobs.
        active: usize,
    },

    /// The ledger rejected the discovered windows.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Discovers eligible windows on storage.
#[derive(Debug, Clone)]
pub struct Scanner {
    /// The scan root.
    root: PathBuf,
    /// The scan configuration.
    config: ScanConfig,
    /// The groups to restrict the scan to, if any.
    groups: Option<BTreeSet<String>>,
    /// Whether candidate windows are validated.
    validate: bool,
    /// Matches window directory names, capturing the subtype and sequence.
    pattern: Regex,
}

impl Scanner {
    /// Constructs a scanner for the configured root.
    pub fn new(config: &ScanConfig) -> Result<Self, ScanError> {
        let subtypes = config
            .subtypes
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"^(?P<subtype>{subtypes})[._-](?P<sequence>\d+)$"))?;

        Ok(Self {
            root: config.root.clone(),
            config: config.clone(),
            groups: None,
            validate: true,
            pattern,
        })
    }

    /// Overrides the scan root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Restricts the scan to the given groups.
    ///
    /// An empty set of groups scans every group.
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        let groups: BTreeSet<_> = groups.into_iter().collect();
        self.groups = (!groups.is_empty()).then_some(groups);
        self
    }

    /// Sets whether candidate validation is skipped.
    ///
    /// Without validation only the directory layout is checked.
    pub fn skip_validation(mut self, skip: bool) -> Self {
        self.validate = !skip;
        self
    }

    /// Gets the scan root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans the root for windows.
    ///
    /// The returned iterator walks storage lazily; calling `scan` again
    /// restarts the walk. Window locations are absolute even when the root
    /// is relative.
    pub fn scan(&self) -> Result<impl Iterator<Item = WindowDescriptor> + '_, ScanError> {
        if !self.root.is_dir() {
            return Err(ScanError::MissingRoot(self.root.clone()));
        }

        let root = std::path::absolute(&self.root).map_err(|e| ScanError::Root {
            path: self.root.clone(),
            source: e,
        })?;

        if let Some(groups) = &self.groups {
            for group in groups {
                if !self.root.join(group).is_dir() {
                    warn!(
                        "group `{group}` was not found in scan root `{root}`",
                        root = self.root.display()
                    );
                }
            }
        }

        let pattern = self.pattern.clone();
        // `filter_entry` never sees entries skipped by `min_depth`; windows
        // are selected by depth below instead.
        let walker = WalkDir::new(root)
            .max_depth(WINDOW_DEPTH)
            .follow_links(true)
            .sort_by(move |a, b| compare_entries(&pattern, a, b))
            .into_iter()
            .filter_entry(move |e| self.descend(e));

        let mut seen = HashSet::new();
        Ok(walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) if entry.depth() == WINDOW_DEPTH => entry,
                Ok(_) => return None,
                Err(e) => {
                    warn!("skipping unreadable scan entry: {e}");
                    return None;
                }
            };

            let window = self.candidate(&entry)?;
            if !seen.insert(window.id().clone()) {
                warn!(
                    "skipping `{path}`: window `{window}` was already found",
                    path = entry.path().display()
                );
                return None;
            }

            if let Some(field) = unpersistable_field(&window) {
                warn!(
                    "skipping `{path}`: its {field} contains a reserved character",
                    path = entry.path().display()
                );
                return None;
            }

            if self.validate && !self.is_valid(&window) {
                return None;
            }

            Some(window)
        }))
    }

    /// Scans the root and appends every discovered window to the ledger.
    ///
    /// The ledger must not have queued or active work. Returns the number of
    /// windows queued.
    pub fn scan_into_ledger(&self, ledger: &mut Ledger) -> Result<usize, ScanError> {
        if !ledger.is_idle() {
            return Err(ScanError::LedgerNotEmpty {
                queued: ledger.queued_count(),
                active: ledger.active_count(),
            });
        }

        let windows: Vec<_> = self.scan()?.collect();
        let count = ledger.enqueue_all(windows)?;
        info!(
            "queued {count} window(s) from `{root}`",
            root = self.root.display()
        );
        Ok(count)
    }

    /// Determines if the walk descends into (or yields) an entry.
    fn descend(&self, entry: &DirEntry) -> bool {
        if !entry.file_type().is_dir() {
            return false;
        }

        let name = entry.file_name().to_string_lossy();
        match entry.depth() {
            1 => self
                .groups
                .as_ref()
                .is_none_or(|g| g.contains(&*name)),
            2 => self.config.categories.iter().any(|c| *c == name),
            _ => true,
        }
    }

    /// Builds a window from a directory at window depth.
    fn candidate(&self, entry: &DirEntry) -> Option<WindowDescriptor> {
        let path = entry.path();
        let name = entry.file_name().to_str()?;
        let (subtype, sequence) = match parse_window_name(&self.pattern, name) {
            Some(parsed) => parsed,
            None => {
                debug!(
                    "ignoring `{path}`: not a window directory",
                    path = path.display()
                );
                return None;
            }
        };

        let category = path.parent()?.file_name()?.to_str()?;
        let group = path.parent()?.parent()?.file_name()?.to_str()?;
        Some(WindowDescriptor::new(
            WindowId::new(group, category, subtype, sequence),
            path,
        ))
    }

    /// Validates the inputs of a candidate window.
    fn is_valid(&self, window: &WindowDescriptor) -> bool {
        let location = window.location();
        let missing = std::iter::once(self.config.entry_point.clone())
            .chain(self.config.required_files.iter().cloned())
            .chain(self.config.stage_files())
            .find(|f| !location.join(f).is_file());

        match missing {
            Some(file) => {
                debug!("excluding window `{window}`: missing `{file}`");
                false
            }
            None => true,
        }
    }
}

/// Parses a window directory name into its subtype and sequence number.
fn parse_window_name<'a>(pattern: &Regex, name: &'a str) -> Option<(&'a str, u32)> {
    let captures = pattern.captures(name)?;
    let subtype = captures.name("subtype")?.as_str();
    let sequence = captures.name("sequence")?.as_str().parse().ok()?;
    Some((subtype, sequence))
}

/// Orders sibling walk entries for dispatch.
///
/// Window directories sort by subtype and then numerically by sequence;
/// everything else sorts by name.
fn compare_entries(pattern: &Regex, a: &DirEntry, b: &DirEntry) -> Ordering {
    let key = |e: &DirEntry| {
        e.file_name()
            .to_str()
            .and_then(|n| parse_window_name(pattern, n))
            .map(|(subtype, sequence)| (subtype.to_string(), sequence))
    };

    if a.depth() == WINDOW_DEPTH {
        match (key(a), key(b)) {
            (Some(ka), Some(kb)) if ka != kb => return ka.cmp(&kb),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            _ => {}
        }
    }

    a.file_name().cmp(b.file_name())
}
