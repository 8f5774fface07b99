use std::{collections::HashSet, io::Read};

use anyhow::{ensure, Context, Result};

use super::{
    image_squash::{image_location, is_link, reference_of},
    FileMetadata, FileResolver, Location,
};
use crate::{
    archive::glob::Pattern,
    image::{resolve_link, Image},
    tree::{FileRef, LinkPolicy},
};

/// Resolves paths against every layer individually, reporting each distinct piece of content
/// once, attributed to the layer that introduced it.
#[derive(Debug)]
pub struct ImageAllLayersResolver<'a> {
    image: &'a Image,
}

impl<'a> ImageAllLayersResolver<'a> {
    pub fn new(image: &'a Image) -> Result<Self> {
        ensure!(!image.layers.is_empty(), "the image does not contain any layers");
        Ok(ImageAllLayersResolver { image })
    }

    /// The content `reference` stands for.  Links are resolved in the squash of their own layer
    /// and of every layer above it, since a later layer may supply the target.
    fn files_by_ref(
        &self,
        reference: &FileRef,
        seen: &mut HashSet<u64>,
        layer_idx: usize,
    ) -> Result<Vec<FileRef>> {
        let image = self.image;
        let entry = image
            .entry(reference)
            .with_context(|| format!("Unable to fetch metadata for {:?}", reference.real_path))?;

        let mut found = vec![];
        if is_link(entry.metadata.file_type) {
            for layer in &image.layers[layer_idx..] {
                let Some((_, resolved)) = resolve_link(&layer.squashed_tree, &reference.real_path)
                else {
                    continue;
                };
                if resolved.is_dir() {
                    continue;
                }
                if let Some(target) = resolved.reference() {
                    if seen.insert(target.id) {
                        found.push(target.clone());
                    }
                }
            }
        } else if seen.insert(reference.id) {
            found.push(reference.clone());
        }

        Ok(found)
    }

    fn files_in_layer(
        &self,
        layer_idx: usize,
        path: &str,
        seen: &mut HashSet<u64>,
    ) -> Result<Vec<Location>> {
        let tree = &self.image.layers[layer_idx].tree;
        let Some((_, inode)) = tree.resolve(path, LinkPolicy::FollowBasenameKeepDead) else {
            return Ok(vec![]);
        };
        let Some(reference) = inode.reference().filter(|_| !inode.is_dir()) else {
            return Ok(vec![]);
        };

        Ok(self
            .files_by_ref(reference, seen, layer_idx)?
            .into_iter()
            .map(|found| image_location(self.image, path, &found))
            .collect())
    }
}

impl FileResolver for ImageAllLayersResolver<'_> {
    fn has_path(&self, path: &str) -> bool {
        self.image.layers.iter().any(|layer| layer.tree.has_path(path))
    }

    fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>> {
        let mut seen = HashSet::new();
        let mut locations = vec![];

        for path in paths {
            for layer_idx in 0..self.image.layers.len() {
                locations.extend(self.files_in_layer(layer_idx, path, &mut seen)?);
            }
        }

        Ok(locations)
    }

    fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>> {
        let mut seen = HashSet::new();
        let mut locations = vec![];

        for pattern in patterns {
            let pattern = Pattern::new(pattern)?;
            for (layer_idx, layer) in self.image.layers.iter().enumerate() {
                for (path, inode) in layer.tree.glob(&pattern) {
                    if inode.is_dir() {
                        continue;
                    }
                    locations.extend(self.files_in_layer(layer_idx, &path, &mut seen)?);
                }
            }
        }

        Ok(locations)
    }

    fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>> {
        Ok(self
            .image
            .layers
            .iter()
            .flat_map(|layer| layer.files_by_mime_type(types))
            .map(|reference| image_location(self.image, &reference.real_path, &reference))
            .collect())
    }

    fn relative_file_by_path(&self, from: &Location, path: &str) -> Option<Location> {
        let layer = self.image.layer_of(from.reference.as_ref()?)?;
        let (_, inode) = resolve_link(&layer.squashed_tree, path)?;
        if inode.is_dir() {
            return None;
        }
        Some(image_location(self.image, path, inode.reference()?))
    }

    fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>> {
        let mut reference = reference_of(location)?;
        let entry = self
            .image
            .entry(reference)
            .with_context(|| format!("No catalog entry for {location}"))?;

        let resolved;
        if is_link(entry.metadata.file_type) {
            resolved = self
                .relative_file_by_path(location, location.access_path())
                .with_context(|| format!("No contents for {location}"))?;
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
        Box::new(image.layers.iter().flat_map(move |layer| {
            layer
                .tree
                .leaves()
                .map(move |(_, leaf)| {
                    image_location(image, &leaf.reference.real_path, &leaf.reference)
                })
        }))
    }
}
