use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::Read,
    os::unix::fs::MetadataExt,
};

use anyhow::{bail, Result};

use super::{FileMetadata, FileResolver, FileType, Location};
use crate::archive::glob::Pattern;

/// An in-memory resolver over a fixed set of locations, for testing catalogers.  Contents and
/// (unless given explicitly) metadata are read from the real path on the host.
#[derive(Debug, Default, Clone)]
pub struct MockResolver {
    locations: Vec<Location>,
    metadata: HashMap<Location, FileMetadata>,
    mime_types: BTreeMap<String, Vec<Location>>,
}

impl MockResolver {
    pub fn for_paths<S: AsRef<str>>(paths: impl IntoIterator<Item = S>) -> Self {
        MockResolver {
            locations: paths
                .into_iter()
                .map(|path| Location::new(path.as_ref()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn for_paths_with_metadata(
        metadata: impl IntoIterator<Item = (Location, FileMetadata)>,
    ) -> Self {
        let mut resolver = MockResolver::default();
        for (location, file_metadata) in metadata {
            resolver
                .mime_types
                .entry(file_metadata.mime_type.clone())
                .or_default()
                .push(location.clone());
            resolver.locations.push(location.clone());
            resolver.metadata.insert(location, file_metadata);
        }
        resolver
    }
}

impl FileResolver for MockResolver {
    fn has_path(&self, path: &str) -> bool {
        self.locations.iter().any(|l| l.real_path() == path)
    }

    fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>> {
        Ok(paths
            .iter()
            .flat_map(|path| {
                self.locations
                    .iter()
                    .filter(move |l| l.real_path() == *path)
                    .cloned()
            })
            .collect())
    }

    fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>> {
        let mut results = vec![];
        for pattern in patterns {
            let pattern = Pattern::new(pattern)?;
            results.extend(
                self.locations
                    .iter()
                    .filter(|l| pattern.matches(l.real_path()))
                    .cloned(),
            );
        }
        Ok(results)
    }

    fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>> {
        Ok(types
            .iter()
            .filter_map(|ty| self.mime_types.get(*ty))
            .flatten()
            .cloned()
            .collect())
    }

    fn relative_file_by_path(&self, _from: &Location, path: &str) -> Option<Location> {
        self.files_by_path(&[path]).ok()?.into_iter().next()
    }

    fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>> {
        if !self.locations.contains(location) {
            bail!("No file for location {location}");
        }
        Ok(Box::new(File::open(location.real_path())?))
    }

    fn file_metadata_by_location(&self, location: &Location) -> Result<FileMetadata> {
        if let Some(metadata) = self.metadata.get(location) {
            return Ok(metadata.clone());
        }

        let stat = fs::metadata(location.real_path())?;
        Ok(FileMetadata {
            mode: stat.mode() & 0o7777,
            file_type: match stat.is_dir() {
                true => FileType::Directory,
                false => FileType::RegularFile,
            },
            size: stat.len(),
            ..Default::default()
        })
    }

    fn all_locations(&self) -> Box<dyn Iterator<Item = Location> + '_> {
        Box::new(self.locations.iter().cloned())
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::source::Coordinates;

    #[test]
    fn test_paths() {
        let resolver =
            MockResolver::for_paths(["/etc/os-release", "/usr/lib/os-release", "/bin/sh"]);
        assert!(resolver.has_path("/bin/sh"));
        assert!(!resolver.has_path("/bin"));

        assert_eq!(
            resolver.files_by_path(&["/bin/sh", "/nope"]).unwrap(),
            [Location::new("/bin/sh")]
        );
        assert_eq!(
            resolver.files_by_glob(&["**/os-release"]).unwrap(),
            [Location::new("/etc/os-release"), Location::new("/usr/lib/os-release")]
        );
        assert_eq!(resolver.all_locations().count(), 3);
        assert_eq!(
            resolver.relative_file_by_path(&Location::new("/bin/sh"), "/etc/os-release"),
            Some(Location::new("/etc/os-release"))
        );
    }

    #[test]
    fn test_stored_locations_are_returned() {
        let layered = Location::from_coordinates(Coordinates::new("/lib/libc.so.6", "sha256:abcd"))
            .with_virtual_path("/lib/libc.so");
        let resolver = MockResolver::for_paths_with_metadata([(
            layered.clone(),
            FileMetadata::default(),
        )]);

        let by_path = resolver.files_by_path(&["/lib/libc.so.6"]).unwrap();
        assert_eq!(by_path, resolver.files_by_glob(&["/lib/*"]).unwrap());
        assert_eq!(by_path, [layered.clone()]);
        assert_eq!(by_path[0].file_system_id(), "sha256:abcd");
        assert_eq!(
            resolver.file_metadata_by_location(&by_path[0]).unwrap(),
            FileMetadata::default()
        );
    }

    #[test]
    fn test_metadata_and_mime_types() {
        let jar = Location::new("/app/a.jar");
        let resolver = MockResolver::for_paths_with_metadata([(
            jar.clone(),
            FileMetadata {
                size: 42,
                mime_type: "application/jar".into(),
                ..Default::default()
            },
        )]);

        assert_eq!(resolver.files_by_mime_type(&["application/jar"]).unwrap(), [jar.clone()]);
        assert!(resolver.files_by_mime_type(&["text/plain"]).unwrap().is_empty());
        assert_eq!(resolver.file_metadata_by_location(&jar).unwrap().size, 42);
    }

    #[test]
    fn test_contents_from_host() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("hello.txt");
        fs::write(&path, "hello").unwrap();
        let path = path.to_string_lossy().into_owned();

        let resolver = MockResolver::for_paths([&path]);
        let mut contents = String::new();
        resolver
            .file_contents_by_location(&Location::new(&path))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello");
        assert_eq!(resolver.file_metadata_by_location(&Location::new(&path)).unwrap().size, 5);

        assert!(resolver.file_contents_by_location(&Location::new("/elsewhere")).is_err());
    }
}
