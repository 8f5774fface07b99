//! Search configuration.
//!
//! ```toml
//! scope = "all-layers"
//! include-unindexed-archives = true
//! max-nested-depth = 4
//! ```

use std::{io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::source::Scope;

/// Zip-family archives: they carry a central directory, so members can be listed without
/// streaming the whole file.
pub const INDEXED_ARCHIVE_GLOBS: &[&str] = &[
    "**/*.jar",
    "**/*.war",
    "**/*.ear",
    "**/*.par",
    "**/*.sar",
    "**/*.jpi",
    "**/*.hpi",
    "**/*.lpkg",
    "**/*.zip",
];

/// Tar-family archives, compressed or not.
pub const UNINDEXED_ARCHIVE_GLOBS: &[&str] = &[
    "**/*.tar",
    "**/*.tar.gz",
    "**/*.tgz",
    "**/*.tar.bz",
    "**/*.tar.bz2",
    "**/*.tbz",
    "**/*.tbz2",
    "**/*.tar.br",
    "**/*.tbr",
    "**/*.tar.lz4",
    "**/*.tlz4",
    "**/*.tar.sz",
    "**/*.tsz",
    "**/*.tar.xz",
    "**/*.txz",
    "**/*.tar.zst",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SearchConfig {
    pub scope: Scope,
    pub include_indexed_archives: bool,
    pub include_unindexed_archives: bool,
    /// How many archives deep nested discovery descends.  Zero disables descending entirely.
    pub max_nested_depth: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            scope: Scope::Squashed,
            include_indexed_archives: true,
            include_unindexed_archives: false,
            max_nested_depth: 8,
        }
    }
}

impl SearchConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse search configuration")
    }

    /// Loads the configuration at `path`.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).with_context(|| format!("In {path:?}")),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("Failed to read {path:?}")),
        }
    }

    /// The globs selecting which nested archives get opened, per the include flags.
    pub fn archive_globs(&self) -> Vec<&'static str> {
        let mut globs = vec![];
        if self.include_indexed_archives {
            globs.extend_from_slice(INDEXED_ARCHIVE_GLOBS);
        }
        if self.include_unindexed_archives {
            globs.extend_from_slice(UNINDEXED_ARCHIVE_GLOBS);
        }
        globs
    }
}
