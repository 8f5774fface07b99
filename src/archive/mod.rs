//! Defensive archive handling.
//!
//! Every member that leaves an archive goes through [`safety::bounded_copy_with_limit`], and every
//! member written to a real directory goes through [`safety::safe_join`].  Selected members are
//! extracted into uniquely named temporary files inside a caller-supplied scratch directory; the
//! caller owns that directory and, with it, the lifetime of every [`Opener`] handed out.

pub mod glob;
pub mod locator;
pub mod nested;
pub mod safety;
pub mod tar;
pub mod zip;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions, Permissions},
    io::{self, Read},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use crate::{
    error::{ArchiveError, Result},
    util::clean_path,
};

use self::{
    glob::compile_all,
    safety::{bounded_copy_with_limit, safe_join, ZIP_READ_LIMIT},
    tar::{compression_for_name, traverse_files_in_tar},
    zip::{ZipFileManifest, ZipReadCloser},
};

/// A deferred handle to extracted content on disk.  Every call to [`Opener::open`] yields a fresh
/// stream positioned at the start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Opener {
    path: PathBuf,
}

impl Opener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Opener { path: path.into() }
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Extracts archive members, refusing to expand any single member past `limit` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extractor {
    limit: u64,
}

impl Default for Extractor {
    fn default() -> Self {
        Extractor {
            limit: ZIP_READ_LIMIT,
        }
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowers (or raises) the per-member ceiling.
    pub fn with_limit(limit: u64) -> Self {
        Extractor { limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub(crate) fn copy_to_unique_temp_file(
        &self,
        dir: &Path,
        name: &str,
        src: impl Read,
    ) -> Result<Opener> {
        let cleaned = clean_path(name);
        let base = cleaned.rsplit('/').next().unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{base}-"))
            .tempfile_in(dir)?;

        // on error the NamedTempFile is dropped, which removes the partial file
        bounded_copy_with_limit(&mut file, src, self.limit)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(Opener::new(path))
    }

    /// Extracts the named zip members into unique temporary files in `dir`, keyed by member name.
    ///
    /// Requesting nothing does not touch the archive at all.  Requesting a directory member is an
    /// error, as is any member that expands past the limit.
    pub fn extract_by_path<S: AsRef<str>>(
        &self,
        archive_path: impl AsRef<Path>,
        dir: &Path,
        paths: &[S],
    ) -> Result<BTreeMap<String, Opener>> {
        let mut results = BTreeMap::new();
        if paths.is_empty() {
            return Ok(results);
        }

        let wanted: BTreeSet<&str> = paths.iter().map(AsRef::as_ref).collect();
        ZipReadCloser::open(archive_path)?.traverse(&wanted, |file| {
            let name = file.name().to_string();
            if file.is_dir() {
                return Err(ArchiveError::DirectoryEntry(name));
            }
            let opener = self.copy_to_unique_temp_file(dir, &name, file)?;
            results.insert(name, opener);
            Ok(())
        })?;

        Ok(results)
    }

    /// Like [`Extractor::extract_by_path`], selecting members with manifest glob semantics
    /// (see [`ZipFileManifest::glob_match`]).  Matching directory members are skipped.
    pub fn extract_by_glob<S: AsRef<str>>(
        &self,
        archive_path: impl AsRef<Path>,
        dir: &Path,
        patterns: &[S],
    ) -> Result<BTreeMap<String, Opener>> {
        if patterns.is_empty() {
            return Ok(BTreeMap::new());
        }

        let archive_path = archive_path.as_ref();
        let manifest = ZipFileManifest::new(archive_path)?;
        let paths: Vec<String> = manifest
            .glob_match(patterns)
            .into_iter()
            .filter(|name| manifest.get(name).is_some_and(|info| !info.is_dir))
            .collect();

        self.extract_by_path(archive_path, dir, &paths)
    }

    /// Reads the named zip members into memory.  Meant for small metadata files.
    pub fn read_contents<S: AsRef<str>>(
        &self,
        archive_path: impl AsRef<Path>,
        paths: &[S],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut results = BTreeMap::new();
        if paths.is_empty() {
            return Ok(results);
        }

        let wanted: BTreeSet<&str> = paths.iter().map(AsRef::as_ref).collect();
        ZipReadCloser::open(archive_path)?.traverse(&wanted, |file| {
            let name = file.name().to_string();
            if file.is_dir() {
                return Err(ArchiveError::DirectoryEntry(name));
            }
            let mut content = vec![];
            bounded_copy_with_limit(&mut content, file, self.limit)?;
            results.insert(name, content);
            Ok(())
        })?;

        Ok(results)
    }

    /// Extracts every member of the zip archive below `target`, preserving mode bits.
    ///
    /// Fails without writing anything outside of `target` if a member name would escape it.
    pub fn extract_all_to_dir(&self, archive_path: impl AsRef<Path>, target: &Path) -> Result<()> {
        let mut archive = ZipReadCloser::open(archive_path)?;

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            let name = file.name().to_string();
            let destination = safe_join(target, &[name.as_str()])?;
            let mode = file.unix_mode().map(|m| m & 0o7777);

            if file.is_dir() {
                fs::create_dir_all(&destination)?;
                if let Some(mode) = mode {
                    fs::set_permissions(&destination, Permissions::from_mode(mode | 0o700))?;
                }
                continue;
            }

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode.unwrap_or(0o644))
                .open(&destination)?;

            if let Err(err) = bounded_copy_with_limit(&mut out, &mut file, self.limit) {
                drop(out);
                fs::remove_file(&destination)?;
                return Err(err);
            }
        }

        Ok(())
    }

    /// Streams a (possibly compressed) tar archive once and extracts the regular files matching
    /// any of the path-aware glob `patterns` into unique temporary files in `dir`.
    pub fn extract_tar_by_glob<S: AsRef<str>>(
        &self,
        archive_path: impl AsRef<Path>,
        dir: &Path,
        patterns: &[S],
    ) -> Result<BTreeMap<String, Opener>> {
        let mut results = BTreeMap::new();
        if patterns.is_empty() {
            return Ok(results);
        }

        let archive_path = archive_path.as_ref();
        let hint = compression_for_name(&archive_path.to_string_lossy());
        let patterns = compile_all(patterns)?;
        traverse_files_in_tar(archive_path, hint, &patterns, |name, entry| {
            let opener = self.copy_to_unique_temp_file(dir, name, entry)?;
            results.insert(name.to_string(), opener);
            Ok(())
        })?;

        Ok(results)
    }
}
