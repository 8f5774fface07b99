//! Catalogers that record facts about every file a resolver can see.

use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use sha2::{Digest as _, Sha256, Sha512};

use crate::source::{Coordinates, FileMetadata, FileResolver, FileType};

/// Records the metadata of every indexed file.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataCataloger;

impl MetadataCataloger {
    pub fn new() -> Self {
        MetadataCataloger
    }

    pub fn catalog(
        &self,
        resolver: &dyn FileResolver,
    ) -> Result<BTreeMap<Coordinates, FileMetadata>> {
        let mut results = BTreeMap::new();
        for location in resolver.all_locations() {
            let metadata = resolver
                .file_metadata_by_location(&location)
                .with_context(|| format!("Failed to read metadata of {location}"))?;
            results.insert(location.coordinates, metadata);
        }
        Ok(results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// The lowercase, dash-free name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => bail!("Unsupported digest algorithm {other:?}"),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Feeds every write to all hashers, so content is read exactly once.
struct MultiHasher(Vec<(DigestAlgorithm, Hasher)>);

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (_, hasher) in &mut self.0 {
            hasher.update(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub value: String,
}

/// Hashes the content of every regular file.
#[derive(Debug, Clone)]
pub struct DigestsCataloger {
    algorithms: Vec<DigestAlgorithm>,
}

fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
    })
}

impl DigestsCataloger {
    pub fn new(algorithms: Vec<DigestAlgorithm>) -> Self {
        DigestsCataloger { algorithms }
    }

    pub fn algorithms(&self) -> &[DigestAlgorithm] {
        &self.algorithms
    }

    /// Digests of regular files, keyed by where they were found.  Empty files get an empty list.
    /// Files that cannot be read for lack of permission are left out.
    pub fn catalog(
        &self,
        resolver: &dyn FileResolver,
    ) -> Result<BTreeMap<Coordinates, Vec<Digest>>> {
        let mut results = BTreeMap::new();

        for location in resolver.all_locations() {
            let metadata = resolver
                .file_metadata_by_location(&location)
                .with_context(|| format!("Failed to read metadata of {location}"))?;
            if metadata.file_type != FileType::RegularFile {
                continue;
            }
            if metadata.size == 0 {
                results.insert(location.coordinates, vec![]);
                continue;
            }

            let mut reader = match resolver.file_contents_by_location(&location) {
                Ok(reader) => reader,
                Err(err) if is_permission_denied(&err) => {
                    log::debug!("skipping digests of {location}: {err}");
                    continue;
                }
                Err(err) => return Err(err.context(format!("Failed to open {location}"))),
            };

            let mut hashers = MultiHasher(
                self.algorithms
                    .iter()
                    .map(|&algorithm| (algorithm, algorithm.hasher()))
                    .collect(),
            );
            match io::copy(&mut reader, &mut hashers) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    log::debug!("skipping digests of {location}: {err}");
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to read {location}"));
                }
            }
            drop(reader);

            let digests = hashers
                .0
                .into_iter()
                .map(|(algorithm, hasher)| Digest {
                    algorithm: algorithm.name().to_string(),
                    value: hasher.finalize(),
                })
                .collect();
            results.insert(location.coordinates, digests);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Read};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        source::{DirectoryResolver, Location, MockResolver},
        test::tempdir,
    };

    #[test]
    fn test_algorithm_names() {
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("sha512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);
        assert!("md5".parse::<DigestAlgorithm>().is_err());
        assert_eq!(DigestAlgorithm::Sha512.to_string(), "sha512");
    }

    #[test]
    fn test_digests_of_directory() {
        let dir = tempdir();
        fs::write(dir.path().join("hello.txt"), "hello\n").unwrap();
        fs::write(dir.path().join("empty"), "").unwrap();
        std::os::unix::fs::symlink("hello.txt", dir.path().join("link")).unwrap();

        let resolver = DirectoryResolver::new(dir.path()).unwrap();
        let cataloger =
            DigestsCataloger::new(vec![DigestAlgorithm::Sha256, DigestAlgorithm::Sha512]);
        let digests = cataloger.catalog(&resolver).unwrap();

        let keys: Vec<&str> = digests.keys().map(|c| c.real_path.as_str()).collect();
        assert_eq!(keys, ["/empty", "/hello.txt"]);
        assert!(digests[&Coordinates::new("/empty", "")].is_empty());
        assert_eq!(
            digests[&Coordinates::new("/hello.txt", "")],
            [
                Digest {
                    algorithm: "sha256".into(),
                    value: "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".into()
                },
                Digest {
                    algorithm: "sha512".into(),
                    value: "e7c22b994c59d9cf2b48e549b1e24666636045930d3da7c1acb299d1c3b7f931f94aae41edda2c2b207a36e10f8bcb8d45223e54878f5b316e7ce3b6bc019629".into()
                }
            ]
        );
    }

    #[test]
    fn test_metadata_of_mock() {
        let dir = tempdir();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();
        let path = path.to_str().unwrap();

        let declared = FileMetadata {
            mode: 0o600,
            size: 3,
            mime_type: "text/plain".into(),
            ..Default::default()
        };
        let resolver =
            MockResolver::for_paths_with_metadata([(Location::new(path), declared.clone())]);
        let catalog = MetadataCataloger::new().catalog(&resolver).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[&Coordinates::new(path, "")], declared);

        let resolver = MockResolver::for_paths(["/nonexistent/minicat/file"]);
        assert!(MetadataCataloger::new().catalog(&resolver).is_err());
    }

    /// Denies reading one path, delegating everything else.  With `on_read`, opening succeeds
    /// and the first read fails instead.
    struct DenyingResolver {
        inner: MockResolver,
        denied: String,
        on_read: bool,
    }

    struct DeniedReader;

    impl Read for DeniedReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    impl FileResolver for DenyingResolver {
        fn has_path(&self, path: &str) -> bool {
            self.inner.has_path(path)
        }

        fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>> {
            self.inner.files_by_path(paths)
        }

        fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>> {
            self.inner.files_by_glob(patterns)
        }

        fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>> {
            self.inner.files_by_mime_type(types)
        }

        fn relative_file_by_path(&self, from: &Location, path: &str) -> Option<Location> {
            self.inner.relative_file_by_path(from, path)
        }

        fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>> {
            if location.real_path() == self.denied {
                if self.on_read {
                    return Ok(Box::new(DeniedReader));
                }
                return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
            }
            self.inner.file_contents_by_location(location)
        }

        fn file_metadata_by_location(&self, location: &Location) -> Result<FileMetadata> {
            self.inner.file_metadata_by_location(location)
        }

        fn all_locations(&self) -> Box<dyn Iterator<Item = Location> + '_> {
            self.inner.all_locations()
        }
    }

    #[test]
    fn test_permission_denied_is_skipped() {
        let dir = tempdir();
        let readable = dir.path().join("readable");
        let secret = dir.path().join("secret");
        fs::write(&readable, "x").unwrap();
        fs::write(&secret, "y").unwrap();
        let readable = readable.to_str().unwrap();
        let secret = secret.to_str().unwrap();

        for on_read in [false, true] {
            let resolver = DenyingResolver {
                inner: MockResolver::for_paths([readable, secret]),
                denied: secret.to_string(),
                on_read,
            };
            let digests = DigestsCataloger::new(vec![DigestAlgorithm::Sha256])
                .catalog(&resolver)
                .unwrap();

            assert_eq!(digests.len(), 1, "on_read: {on_read}");
            assert_eq!(
                digests[&Coordinates::new(readable, "")][0].value,
                "2d711642b726b04401627ca9fbac32f5c8530fb1903cc4db02258717921a4881"
            );
        }
    }
}
