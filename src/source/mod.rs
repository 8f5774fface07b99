//! Where files come from, and how to find them again.
//!
//! A [`Source`] is a directory, a single file or a container image.  Each hands out a
//! [`FileResolver`] that answers path, glob and MIME type queries with [`Location`]s, the handle
//! every cataloger uses to attribute what it finds.

mod all_layers;
mod coordinates;
mod directory;
mod image_squash;
mod location;
mod metadata;
pub mod mime;
mod mock;
mod resolver;

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub use self::{
    all_layers::ImageAllLayersResolver,
    coordinates::Coordinates,
    directory::{DirectoryResolver, PathFilter},
    image_squash::ImageSquashResolver,
    location::Location,
    metadata::{FileMetadata, FileType},
    mock::MockResolver,
    resolver::FileResolver,
};
use crate::image::{Image, ImageMetadata};

/// Which view of an image to catalog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// The filesystem as the image runs it.
    #[default]
    Squashed,
    /// Every layer on its own.
    AllLayers,
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "squashed" => Ok(Scope::Squashed),
            "all-layers" | "alllayers" => Ok(Scope::AllLayers),
            other => bail!("Unknown scope {other:?} (expected 'squashed' or 'all-layers')"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Squashed => "squashed",
            Scope::AllLayers => "all-layers",
        })
    }
}

/// Something to catalog.
#[derive(Debug)]
pub enum Source {
    Directory(PathBuf),
    File(PathBuf),
    Image(Box<Image>),
}

impl Source {
    /// Interprets user input: `dir:<path>`, `file:<path>` and `oci-dir:<path>` are explicit;
    /// anything else is inspected on disk.  A directory containing `index.json` is an OCI image
    /// layout.
    pub fn detect(input: &str) -> Result<Self> {
        if let Some(path) = input.strip_prefix("dir:") {
            return Ok(Source::Directory(path.into()));
        }
        if let Some(path) = input.strip_prefix("file:") {
            return Ok(Source::File(path.into()));
        }
        if let Some(path) = input.strip_prefix("oci-dir:") {
            return Self::oci_layout(Path::new(path));
        }

        let path = Path::new(input);
        let stat =
            fs::metadata(path).with_context(|| format!("Unable to detect source {input:?}"))?;
        if !stat.is_dir() {
            return Ok(Source::File(path.into()));
        }
        match path.join("index.json").is_file() {
            true => Self::oci_layout(path),
            false => Ok(Source::Directory(path.into())),
        }
    }

    fn oci_layout(path: &Path) -> Result<Self> {
        log::debug!("loading OCI image layout {path:?}");
        Ok(Source::Image(Box::new(Image::from_oci_layout(path)?)))
    }

    /// A resolver over this source.  `scope` only matters for images.
    pub fn file_resolver(&self, scope: Scope) -> Result<Box<dyn FileResolver + '_>> {
        Ok(match self {
            Source::Directory(path) => Box::new(DirectoryResolver::new(path)?),
            Source::File(path) => {
                let file = fs::canonicalize(path)
                    .with_context(|| format!("Could not evaluate file {path:?}"))?;
                let Some(parent) = file.parent().map(Path::to_path_buf) else {
                    bail!("File source {path:?} has no parent directory");
                };
                let root = parent.clone();
                let only_file: PathFilter = Box::new(move |candidate, _| {
                    candidate != file.as_path() && candidate != parent.as_path()
                });
                Box::new(DirectoryResolver::with_filters(root, vec![only_file])?)
            }
            Source::Image(image) => match scope {
                Scope::Squashed => Box::new(ImageSquashResolver::new(image)),
                Scope::AllLayers => Box::new(ImageAllLayersResolver::new(image)?),
            },
        })
    }

    pub fn image_metadata(&self) -> Option<&ImageMetadata> {
        match self {
            Source::Image(image) => Some(&image.metadata),
            _ => None,
        }
    }
}
