use std::io::Read;

use anyhow::Result;

use super::{FileMetadata, Location};

/// Uniform access to "a file, anywhere".
///
/// Every resolver answers the same questions the same way: lookups follow symlinks to their
/// terminal target, never return directories, and represent a missing path as an empty result
/// rather than an error.  Returned [`Location`]s may only be passed back to the resolver that
/// produced them.
pub trait FileResolver {
    /// Whether `path` exists.  No content is accessed.
    fn has_path(&self, path: &str) -> bool;

    /// Looks up exact paths.
    fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>>;

    /// Looks up paths matching double-star glob patterns.  Results are unique by content.
    fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>>;

    /// Looks up regular files by their sniffed MIME type.
    fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>>;

    /// Looks up `path` in the filesystem view that contains `from`.  For layered images this is
    /// the squash of `from`'s layer, not of the whole image.
    fn relative_file_by_path(&self, from: &Location, path: &str) -> Option<Location>;

    /// Opens the content at `location`, resolving links to their target first.
    fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>>;

    fn file_metadata_by_location(&self, location: &Location) -> Result<FileMetadata>;

    /// Lazily enumerates every indexed file (everything but directories).  Dropping the iterator
    /// early stops the enumeration.
    fn all_locations(&self) -> Box<dyn Iterator<Item = Location> + '_>;
}
