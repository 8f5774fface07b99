//! Guards applied to every archive member that is extracted.

use std::{
    io::{Read, Write},
    path::{Component, Path, PathBuf},
};

use crate::{
    error::{ArchiveError, Result},
    util::lexical_clean,
};

/// The most data a single archive member may expand to: 2 GiB.
pub const ZIP_READ_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Copies `src` into `dst`, failing with [`ArchiveError::DecompressionBomb`] once
/// [`ZIP_READ_LIMIT`] bytes have been copied.
pub fn bounded_copy<W: Write + ?Sized>(dst: &mut W, src: impl Read) -> Result<u64> {
    bounded_copy_with_limit(dst, src, ZIP_READ_LIMIT)
}

/// Like [`bounded_copy`], with an explicit ceiling.
///
/// Reaching the ceiling is an error even if the source happens to end exactly there: a limited
/// reader can't tell "exhausted" from "more data available", and truncated content must never be
/// mistaken for the real thing.
pub fn bounded_copy_with_limit<W: Write + ?Sized>(
    dst: &mut W,
    src: impl Read,
    limit: u64,
) -> Result<u64> {
    let copied = std::io::copy(&mut src.take(limit), dst)?;
    if copied >= limit {
        return Err(ArchiveError::DecompressionBomb { limit });
    }
    Ok(copied)
}

/// Joins `segments` onto `prefix` and lexically cleans the result, failing with
/// [`ArchiveError::PathTraversal`] if the result is not inside `prefix`.
///
/// Absolute segments are joined, not substituted: `safe_join("/out", &["/etc"])` is `/out/etc`.
pub fn safe_join(prefix: &Path, segments: &[&str]) -> Result<PathBuf> {
    let mut joined = prefix.to_path_buf();
    for segment in segments {
        for component in Path::new(segment).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {}
                other => joined.push(other),
            }
        }
    }

    let destination = lexical_clean(&joined);
    if !destination.starts_with(lexical_clean(prefix)) {
        return Err(ArchiveError::PathTraversal {
            prefix: prefix.to_path_buf(),
            segments: segments.iter().map(|s| s.to_string()).collect(),
        });
    }
    Ok(destination)
}
