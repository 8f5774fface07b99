use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use super::Coordinates;
use crate::tree::FileRef;

/// A handle to a file as found by a resolver.
///
/// The virtual path records how the file was reached when that differs from where it really
/// lives: through a symlink, or inside an archive.  Archive nesting is written as colon-joined
/// segments (`app.war:WEB-INF/lib/lib.jar:META-INF/MANIFEST.MF`).
///
/// Locations also carry a reference that is private to the resolver that produced them.  It takes
/// no part in equality, hashing or ordering: two locations are the same location exactly when
/// their real path, virtual path and filesystem id agree.
#[derive(Debug, Default, Clone)]
pub struct Location {
    pub coordinates: Coordinates,
    pub virtual_path: Option<String>,
    pub(crate) reference: Option<FileRef>,
}

impl Location {
    /// A location for a path with no filesystem id and no distinct access path.
    pub fn new(real_path: impl Into<String>) -> Self {
        Self::from_coordinates(Coordinates::new(real_path, ""))
    }

    /// A location reached via `virtual_path`.  The virtual path is dropped when it equals the real
    /// path.
    pub fn new_virtual(real_path: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        Self::new(real_path).with_virtual_path(virtual_path)
    }

    pub fn from_coordinates(coordinates: Coordinates) -> Self {
        Location {
            coordinates,
            virtual_path: None,
            reference: None,
        }
    }

    pub(crate) fn from_image(
        real_path: impl Into<String>,
        layer_digest: &str,
        reference: FileRef,
    ) -> Self {
        Location {
            coordinates: Coordinates::new(real_path, layer_digest),
            virtual_path: None,
            reference: Some(reference),
        }
    }

    pub(crate) fn from_directory(real_path: impl Into<String>, reference: FileRef) -> Self {
        Location {
            coordinates: Coordinates::new(real_path, ""),
            virtual_path: None,
            reference: Some(reference),
        }
    }

    pub fn with_virtual_path(mut self, virtual_path: impl Into<String>) -> Self {
        let virtual_path = virtual_path.into();
        self.virtual_path = match virtual_path == self.coordinates.real_path {
            true => None,
            false => Some(virtual_path),
        };
        self
    }

    /// The location of `member` inside the archive found at this location.  The member becomes
    /// the real path; the virtual path chains onto this location's access path.
    pub fn nested(&self, member: &str) -> Self {
        Location::new_virtual(member, format!("{}:{member}", self.access_path()))
    }

    pub fn real_path(&self) -> &str {
        &self.coordinates.real_path
    }

    pub fn file_system_id(&self) -> &str {
        &self.coordinates.file_system_id
    }

    /// The path a consumer used to reach the file: the virtual path if there is one, otherwise the
    /// real path.
    pub fn access_path(&self) -> &str {
        self.virtual_path
            .as_deref()
            .unwrap_or(&self.coordinates.real_path)
    }

    fn key(&self) -> (&Coordinates, Option<&str>) {
        (&self.coordinates, self.virtual_path.as_deref())
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location<{}", self.coordinates)?;
        if let Some(virtual_path) = &self.virtual_path {
            write!(f, " VirtualPath={virtual_path:?}")?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_equality_ignores_reference() {
        let a = Location::from_image("/bin/sh", "sha256:1", FileRef::new(1, "/bin/sh"));
        let b = Location::from_image("/bin/sh", "sha256:1", FileRef::new(2, "/bin/sh"));
        assert_eq!(a, b);
        assert_eq!(HashSet::from([a.clone(), b]).len(), 1);

        assert!(a != Location::from_image("/bin/sh", "sha256:2", FileRef::new(1, "/bin/sh")));
        assert!(a != a.clone().with_virtual_path("/usr/bin/sh"));
    }

    #[test]
    fn test_virtual_path_dropped_when_equal() {
        assert_eq!(Location::new_virtual("/a", "/a").virtual_path, None);
        assert_eq!(Location::new_virtual("/a", "/b").access_path(), "/b");
        assert_eq!(Location::new("/a").access_path(), "/a");
    }

    #[test]
    fn test_nested_chains_virtual_paths() {
        let outer = Location::new("a.jar");
        let inner = outer.nested("b.jar");
        assert_eq!(inner.real_path(), "b.jar");
        assert_eq!(inner.access_path(), "a.jar:b.jar");

        let leaf = inner.nested("c.class");
        assert_eq!(leaf.real_path(), "c.class");
        assert_eq!(leaf.virtual_path.as_deref(), Some("a.jar:b.jar:c.class"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Location::new_virtual("/usr/lib/a", "/lib/a").to_string(),
            "Location<RealPath=\"/usr/lib/a\" VirtualPath=\"/lib/a\">"
        );
    }
}
