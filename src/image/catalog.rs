use std::{
    fs::File,
    io::{self, Cursor, Read},
    path::PathBuf,
};

use crate::{source::FileMetadata, tree::FileRef};

/// Where the bytes of a cataloged file live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Not a regular file.
    None,
    /// Small files are kept in memory.
    Inline(Vec<u8>),
    /// Larger files are spilled to a file in the image's scratch directory.
    External(PathBuf),
}

/// Everything known about one file of one layer.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub metadata: FileMetadata,
    /// Index of the layer that introduced the file.
    pub layer: usize,
    pub content: Content,
}

/// The metadata and content of every file of every layer, indexed by [`FileRef::id`].
#[derive(Debug, Default)]
pub struct FileCatalog {
    entries: Vec<CatalogEntry>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry` and returns a reference to it.
    pub fn add(&mut self, real_path: &str, entry: CatalogEntry) -> FileRef {
        let id = self.entries.len() as u64;
        self.entries.push(entry);
        FileRef::new(id, real_path)
    }

    pub fn get(&self, reference: &FileRef) -> Option<&CatalogEntry> {
        usize::try_from(reference.id)
            .ok()
            .and_then(|idx| self.entries.get(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens the content of the referenced file.  Files without content read as empty.
    pub fn open(&self, reference: &FileRef) -> io::Result<Box<dyn Read + '_>> {
        let Some(entry) = self.get(reference) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no catalog entry for {:?}", reference.real_path),
            ));
        };

        Ok(match &entry.content {
            Content::None => Box::new(io::empty()),
            Content::Inline(data) => Box::new(Cursor::new(&data[..])),
            Content::External(path) => Box::new(File::open(path)?),
        })
    }
}
