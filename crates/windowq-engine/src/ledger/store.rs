//! Implementation of ledger persistence.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::io::BufWriter;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::trace;

/// The name of the presence-only pause marker file.
const PAUSED_MARKER: &str = "paused";

/// Identifies one of the four persisted ledger collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// The FIFO queue of windows awaiting dispatch.
    Queue,
    /// The jobs currently bound to a device.
    Active,
    /// The jobs that finished with the success marker.
    Completed,
    /// The jobs that finished without the success marker or failed to
    /// launch.
    Failed,
}

impl Collection {
    /// All collections, in the order they are loaded.
    pub const ALL: [Collection; 4] = [
        Collection::Queue,
        Collection::Active,
        Collection::Completed,
        Collection::Failed,
    ];

    /// Gets the name of the collection.
    ///
    /// This is also the file name used by [`FileStore`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persists the ledger's collections as ordered lists of record lines.
///
/// Implementations must replace a collection atomically: a concurrent reader
/// observes either the previous or the new contents of a collection, never a
/// partial write. A collection that was never written reads as empty.
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Reads every line of a collection.
    fn read(&self, collection: Collection) -> io::Result<Vec<String>>;

    /// Replaces the contents of a collection.
    fn write(&self, collection: Collection, lines: &[String]) -> io::Result<()>;

    /// Determines if the pause marker is present.
    fn paused(&self) -> io::Result<bool>;

    /// Sets or removes the pause marker.
    fn set_paused(&self, paused: bool) -> io::Result<()>;
}

/// A ledger store that keeps collections in memory.
///
/// Clones share the same underlying collections, which lets tests observe a
/// ledger from the "outside" or reopen it as a restarted scheduler would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// The shared state of the store.
    inner: Arc<Mutex<MemoryState>>,
}

/// The state of a memory store.
#[derive(Debug, Default)]
struct MemoryState {
    /// The lines of each written collection.
    collections: HashMap<Collection, Vec<String>>,
    /// Whether the pause marker is present.
    paused: bool,
}

impl MemoryStore {
    /// Constructs a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn read(&self, collection: Collection) -> io::Result<Vec<String>> {
        let state = self.inner.lock().expect("failed to lock state");
        Ok(state
            .collections
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    fn write(&self, collection: Collection, lines: &[String]) -> io::Result<()> {
        let mut state = self.inner.lock().expect("failed to lock state");
        state.collections.insert(collection, lines.to_vec());
        Ok(())
    }

    fn paused(&self) -> io::Result<bool> {
        Ok(self.inner.lock().expect("failed to lock state").paused)
    }

    fn set_paused(&self, paused: bool) -> io::Result<()> {
        self.inner.lock().expect("failed to lock state").paused = paused;
        Ok(())
    }
}

/// A ledger store that keeps each collection in a file of a directory.
///
/// Collections are written to a temporary file in the same directory which
/// then atomically replaces the previous file.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// The directory holding the collection files.
    dir: PathBuf,
}

impl FileStore {
    /// Opens a file store in the given directory, creating the directory if
    /// needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Opens a file store for reading without creating its directory.
    ///
    /// A missing directory reads as an empty ledger.
    pub fn open_read_only(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Gets the directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Gets the path of a collection file.
    pub fn path(&self, collection: Collection) -> PathBuf {
        self.dir.join(collection.name())
    }
}

impl LedgerStore for FileStore {
    fn read(&self, collection: Collection) -> io::Result<Vec<String>> {
        match fs::read_to_string(self.path(collection)) {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write(&self, collection: Collection, lines: &[String]) -> io::Result<()> {
        let file = NamedTempFile::new_in(&self.dir)?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writeln!(writer, "{line}")?;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.as_file().sync_all()?;
        file.persist(self.path(collection)).map_err(|e| e.error)?;

        trace!(
            "wrote {count} record(s) to ledger collection `{collection}`",
            count = lines.len()
        );
        Ok(())
    }

    fn paused(&self) -> io::Result<bool> {
        match fs::metadata(self.dir.join(PAUSED_MARKER)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn set_paused(&self, paused: bool) -> io::Result<()> {
        let marker = self.dir.join(PAUSED_MARKER);
        if paused {
            fs::write(marker, b"")
        } else {
            match fs::remove_file(marker) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                r => r,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("ledger")).unwrap();

        assert!(store.read(Collection::Queue).unwrap().is_empty());

        let lines = vec!["a|b".to_string(), "c|d".to_string()];
        store.write(Collection::Queue, &lines).unwrap();
        assert_eq!(store.read(Collection::Queue).unwrap(), lines);
        assert_eq!(
            fs::read_to_string(store.path(Collection::Queue)).unwrap(),
            "a|b\nc|d\n"
        );

        store.write(Collection::Queue, &[]).unwrap();
        assert!(store.read(Collection::Queue).unwrap().is_empty());

        // No temporary files are left behind
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["queue"]);
    }

    #[test]
    fn pause_marker() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(!store.paused().unwrap());

        store.set_paused(true).unwrap();
        assert!(store.paused().unwrap());
        assert!(dir.path().join("paused").exists());

        store.set_paused(false).unwrap();
        store.set_paused(false).unwrap();
        assert!(!store.paused().unwrap());
    }

    #[test]
    fn read_only_store_tolerates_missing_directory() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_read_only(dir.path().join("missing"));
        for collection in Collection::ALL {
            assert!(store.read(collection).unwrap().is_empty());
        }
        assert!(!store.paused().unwrap());
    }

    #[test]
    fn memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store
            .write(Collection::Failed, &["x".to_string()])
            .unwrap();
        other.set_paused(true).unwrap();

        assert_eq!(other.read(Collection::Failed).unwrap(), ["x"]);
        assert!(store.paused().unwrap());
    }
}
