use std::{collections::HashSet, io::Read};

use anyhow::{bail, Context, Result};

use super::{FileMetadata, FileResolver, FileType, Location};
use crate::{
    archive::glob::Pattern,
    image::{resolve_link, Image},
    tree::FileRef,
};

/// A location for `reference`, attributed to the layer that introduced it.
pub(super) fn image_location(image: &Image, virtual_path: &str, reference: &FileRef) -> Location {
    let digest = match image.layer_of(reference) {
        Some(layer) => layer.metadata.digest.as_str(),
        None => {
            log::warn!("no catalog entry for {:?}", reference.real_path);
            ""
        }
    };
    Location::from_image(reference.real_path.clone(), digest, reference.clone())
        .with_virtual_path(virtual_path)
}

pub(super) fn reference_of(location: &Location) -> Result<&FileRef> {
    location
        .reference
        .as_ref()
        .with_context(|| format!("{location} was not produced by this resolver"))
}

pub(super) fn is_link(file_type: FileType) -> bool {
    matches!(file_type, FileType::SymbolicLink | FileType::HardLink)
}

/// Resolves paths against the image's squashed filesystem: one file per path, as a container
/// running the image would see it.
#[derive(Debug)]
pub struct ImageSquashResolver<'a> {
    image: &'a Image,
}

impl<'a> ImageSquashResolver<'a> {
    pub fn new(image: &'a Image) -> Self {
        ImageSquashResolver { image }
    }

    fn resolve(&self, path: &str, seen: &mut HashSet<u64>) -> Option<Location> {
        let (_, inode) = resolve_link(self.image.squashed_tree(), path)?;
        if inode.is_dir() {
            return None;
        }
        let reference = inode.reference()?;
        match seen.insert(reference.id) {
            true => Some(image_location(self.image, path, reference)),
            false => None,
        }
    }
}

impl FileResolver for ImageSquashResolver<'_> {
    fn has_path(&self, path: &str) -> bool {
        self.image.squashed_tree().has_path(path)
    }

    fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>> {
        let mut seen = HashSet::new();
        Ok(paths
            .iter()
            .filter_map(|path| self.resolve(path, &mut seen))
            .collect())
    }

    fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>> {
        let mut seen = HashSet::new();
        let mut locations = vec![];

        for pattern in patterns {
            let pattern = Pattern::new(pattern)?;
            for (path, inode) in self.image.squashed_tree().glob(&pattern) {
                if inode.is_dir() {
                    continue;
                }
                locations.extend(self.resolve(&path, &mut seen));
            }
        }

        Ok(locations)
    }

    fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>> {
        Ok(self
            .image
            .files_by_mime_type_from_squash(types)
            .iter()
            .map(|reference| image_location(self.image, &reference.real_path, reference))
            .collect())
    }

    fn relative_file_by_path(&self, _from: &Location, path: &str) -> Option<Location> {
        self.resolve(path, &mut HashSet::new())
    }

    fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>> {
        let mut reference = reference_of(location)?;
        let entry = self
            .image
            .entry(reference)
            .with_context(|| format!("No catalog entry for {location}"))?;

        let resolved;
        if is_link(entry.metadata.file_type) {
            match self.files_by_path(&[location.real_path()])?.as_slice() {
                [] => bail!("Link resolution failed while resolving content of {location}"),
                [target] => resolved = target.clone(),
                _ => bail!("Link resolution of {location} resulted in multiple locations"),
            }
            reference = reference_of(&resolved)?;
        }

        Ok(self.image.open(reference)?)
    }

    fn file_metadata_by_location(&self, location: &Location) -> Result<FileMetadata> {
        let entry = self
            .image
            .entry(reference_of(location)?)
            .with_context(|| format!("No catalog entry for {location}"))?;
        Ok(entry.metadata.clone())
    }

    fn all_locations(&self) -> Box<dyn Iterator<Item = Location> + '_> {
        let image = self.image;
        Box::new(image.squashed_tree().leaves().map(move |(_, leaf)| {
            image_location(image, &leaf.reference.real_path, &leaf.reference)
        }))
    }
}
