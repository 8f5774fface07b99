//! Zip archive access: opening (with prepended-data support), manifests, and traversal of
//! selected members.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use zip::{read::ZipFile, ZipArchive};

use super::{glob::glob_match, locator::find_archive_start_offset};
use crate::error::Result;

/// A `Read + Seek` view of the byte range `[start, start + len)` of another reader.
#[derive(Debug)]
pub struct SectionReader<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SectionReader<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(SectionReader {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

/// An open zip archive.  The archive owns the underlying reader: dropping it closes the file.
pub struct ZipReadCloser<R: Read + Seek = File> {
    archive: ZipArchive<SectionReader<R>>,
    start: u64,
}

impl ZipReadCloser<File> {
    /// Opens the zip archive at `path`, skipping any data prepended to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> ZipReadCloser<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        let start = find_archive_start_offset(&mut reader, size)?;
        let section = SectionReader::new(reader, start, size - start)?;

        Ok(ZipReadCloser {
            archive: ZipArchive::new(section)?,
            start,
        })
    }

    /// Where the archive starts within the underlying reader.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    pub fn by_index(&mut self, index: usize) -> Result<ZipFile<'_, SectionReader<R>>> {
        Ok(self.archive.by_index(index)?)
    }

    /// Calls `visitor` for each member named in `paths`, in central directory order.
    pub fn traverse(
        &mut self,
        paths: &BTreeSet<&str>,
        mut visitor: impl FnMut(&mut ZipFile<'_, SectionReader<R>>) -> Result<()>,
    ) -> Result<()> {
        for index in 0..self.archive.len() {
            let mut file = self.archive.by_index(index)?;
            if paths.contains(file.name()) {
                log::trace!("visiting zip member {:?}", file.name());
                visitor(&mut file)?;
            }
        }
        Ok(())
    }
}

/// What the central directory says about one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipEntryInfo {
    pub size: u64,
    pub compressed_size: u64,
    pub mode: Option<u32>,
    pub is_dir: bool,
}

/// All members of a zip archive, keyed by their raw entry name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ZipFileManifest {
    entries: BTreeMap<String, ZipEntryInfo>,
}

impl ZipFileManifest {
    /// Reads the manifest of the zip archive at `archive_path`.
    pub fn new(archive_path: impl AsRef<Path>) -> Result<Self> {
        Self::from_archive(&mut ZipReadCloser::open(archive_path)?)
    }

    pub fn from_archive<R: Read + Seek>(archive: &mut ZipReadCloser<R>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for index in 0..archive.len() {
            let file = archive.by_index(index)?;
            entries.insert(
                file.name().to_string(),
                ZipEntryInfo {
                    size: file.size(),
                    compressed_size: file.compressed_size(),
                    mode: file.unix_mode(),
                    is_dir: file.is_dir(),
                },
            );
        }
        Ok(ZipFileManifest { entries })
    }

    pub fn get(&self, name: &str) -> Option<&ZipEntryInfo> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ZipEntryInfo)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the (sorted, unique) entry names matching any of `patterns`.
    ///
    /// Entry names are matched with a leading '/', since zip entries are usually stored without
    /// one and patterns are usually written with one.  The returned names are the raw ones.
    pub fn glob_match<S: AsRef<str>>(&self, patterns: &[S]) -> Vec<String> {
        let mut matches = BTreeSet::new();

        for name in self.entries.keys() {
            let normalized = match name.starts_with('/') {
                true => name.clone(),
                false => format!("/{name}"),
            };
            if patterns
                .iter()
                .any(|pattern| glob_match(pattern.as_ref(), &normalized))
            {
                matches.insert(name.clone());
            }
        }

        matches.into_iter().collect()
    }
}
