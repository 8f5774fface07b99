//! Error types for archive handling.
//!
//! Archive failures are reported per archive or per member.  Callers that walk many archives
//! (nested discovery, catalogers) log these and continue with the next archive or member.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while locating, listing or extracting archive contents.
///
/// Variants:
/// - `Format`: the bytes are not a valid archive (missing EOCD, bad ZIP64 record, out of range
///   directory offset)
/// - `DecompressionBomb`: a member expanded to the configured copy ceiling
/// - `PathTraversal`: a member name would escape the extraction root
/// - `DirectoryEntry`: a directory was requested where only files can be extracted
/// - `Pattern`: a glob pattern could not be compiled
/// - `Io`/`Zip`: underlying I/O or zip decoding failures
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive format error: {0}")]
    Format(String),

    #[error("read limit of {limit} bytes hit (potential decompression bomb attack)")]
    DecompressionBomb { limit: u64 },

    #[error("path traversal detected: {segments:?} escapes {prefix:?} (potential zip slip attack)")]
    PathTraversal {
        prefix: PathBuf,
        segments: Vec<String>,
    },

    #[error("unable to extract directories, only files: {0}")]
    DirectoryEntry(String),

    #[error("invalid glob pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl ArchiveError {
    /// Errors that only affect a single archive member, as opposed to the whole archive.
    pub fn is_member_error(&self) -> bool {
        matches!(
            self,
            Self::DecompressionBomb { .. } | Self::PathTraversal { .. } | Self::DirectoryEntry(..)
        )
    }
}

/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;
