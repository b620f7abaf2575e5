//! Implementation of window descriptors.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

/// The identity of a window.
///
/// The derived ordering is the dispatch order used by the scanner: group,
/// then category, then subtype (all lexicographic) and finally the numeric
/// sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId {
    /// The group that owns the window.
    pub group: String,
    /// The top-level category of the window.
    pub category: String,
    /// The subtype tag of the window.
    pub subtype: String,
    /// The sequence number of the window within its subtype.
    pub sequence: u32,
}

impl WindowId {
    /// Constructs a new window identity.
    pub fn new(
        group: impl Into<String>,
        category: impl Into<String>,
        subtype: impl Into<String>,
        sequence: u32,
    ) -> Self {
        Self {
            group: group.into(),
            category: category.into(),
            subtype: subtype.into(),
            sequence,
        }
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{group}/{category}/{subtype}.{sequence}",
            group = self.group,
            category = self.category,
            subtype = self.subtype,
            sequence = self.sequence
        )
    }
}

/// Describes one unit of work discovered on storage.
///
/// A descriptor is immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDescriptor {
    /// The identity of the window.
    id: WindowId,
    /// The directory holding the window's entry point and inputs.
    location: PathBuf,
}

impl WindowDescriptor {
    /// Constructs a new window descriptor.
    pub fn new(id: WindowId, location: impl Into<PathBuf>) -> Self {
        Self {
            id,
            location: location.into(),
        }
    }

    /// Gets the identity of the window.
    pub fn id(&self) -> &WindowId {
        &self.id
    }

    /// Gets the storage location of the window.
    pub fn location(&self) -> &Path {
        &self.location
    }
}

impl fmt::Display for WindowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}
