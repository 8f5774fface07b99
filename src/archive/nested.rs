//! Discovery of files inside archives inside archives.
//!
//! A jar inside a war inside a tarball is reported with a chained virtual path such as
//! `app.tar:app.war:WEB-INF/lib/lib.jar:META-INF/MANIFEST.MF`.  Every archive on the way is
//! extracted into a scratch directory owned by [`NestedArchives`], so the [`Opener`]s handed out
//! stay valid for as long as that value lives.

use std::{
    collections::{BTreeSet, VecDeque},
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::TempDir;

use super::{
    glob::{compile_all, Pattern},
    tar::{compression_for_name, traverse_files_in_tar},
    zip::{ZipFileManifest, ZipReadCloser},
    Extractor, Opener,
};
use crate::{
    config::{SearchConfig, INDEXED_ARCHIVE_GLOBS, UNINDEXED_ARCHIVE_GLOBS},
    error::{self, ArchiveError},
    source::Location,
};

/// A file found somewhere below the outer archive.
#[derive(Debug, Clone)]
pub struct NestedFile {
    /// Real path is the member name within its innermost archive; the virtual path is the
    /// whole chain.
    pub location: Location,
    pub opener: Opener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
}

/// An archive waiting in the work queue.
#[derive(Debug)]
struct Pending {
    location: Location,
    path: PathBuf,
    depth: usize,
}

/// What one pass over an archive produced.
#[derive(Debug, Default)]
struct Visited {
    found: Vec<NestedFile>,
    archives: Vec<(String, Opener)>,
}

pub struct NestedArchives {
    config: SearchConfig,
    extractor: Extractor,
    indexed: Vec<Pattern>,
    unindexed: Vec<Pattern>,
    descend: Vec<Pattern>,
    scratch: TempDir,
}

impl NestedArchives {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Ok(NestedArchives {
            config: config.clone(),
            extractor: Extractor::new(),
            indexed: compile_all(INDEXED_ARCHIVE_GLOBS)?,
            unindexed: compile_all(UNINDEXED_ARCHIVE_GLOBS)?,
            descend: compile_all(&config.archive_globs())?,
            scratch: TempDir::with_prefix("minicat-nested-")
                .context("Failed to create scratch directory")?,
        })
    }

    /// Uses `extractor` (and its per-member ceiling) for everything extracted from now on.
    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn kind_of(&self, name: &str) -> Option<ArchiveKind> {
        if self.indexed.iter().any(|p| p.matches(name)) {
            Some(ArchiveKind::Zip)
        } else if self.unindexed.iter().any(|p| p.matches(name)) {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }

    /// Finds the members matching `wanted` in the archive read from `reader` and, breadth first,
    /// in every archive nested within it up to the configured depth.
    ///
    /// `wanted` uses the zip manifest glob syntax for zip archives (`*` crosses '/', names are
    /// matched with a leading '/') and the path-aware syntax for tar archives.  An outer archive
    /// that cannot be read is an error; a nested one that cannot be read is logged and skipped,
    /// as is any single member that is unsafe to extract.
    pub fn discover(
        &self,
        virtual_path: &str,
        reader: impl Read,
        wanted: &[&str],
    ) -> Result<Vec<NestedFile>> {
        let outer = self
            .extractor
            .copy_to_unique_temp_file(self.scratch.path(), virtual_path, reader)
            .with_context(|| format!("Failed to copy {virtual_path:?} to scratch"))?;
        let wanted_tar = compile_all(wanted)?;

        let mut found = vec![];
        let mut queue = VecDeque::from([Pending {
            location: Location::new(virtual_path),
            path: outer.path().to_path_buf(),
            depth: 0,
        }]);

        while let Some(pending) = queue.pop_front() {
            let kind = self
                .kind_of(pending.location.real_path())
                .unwrap_or(ArchiveKind::Zip);
            let descend = pending.depth < self.config.max_nested_depth;

            let visited = match kind {
                ArchiveKind::Zip => self.visit_zip(&pending, wanted, descend),
                ArchiveKind::Tar => self.visit_tar(&pending, &wanted_tar, descend),
            };
            let visited = match visited {
                Ok(visited) => visited,
                Err(err) if pending.depth == 0 => {
                    return Err(err).with_context(|| format!("Failed to read {virtual_path:?}"));
                }
                Err(err) => {
                    log::warn!(
                        "skipping nested archive {}: {err}",
                        pending.location.access_path()
                    );
                    continue;
                }
            };

            found.extend(visited.found);
            for (member, opener) in visited.archives {
                log::debug!(
                    "descending into {}:{member} (depth {})",
                    pending.location.access_path(),
                    pending.depth + 1
                );
                queue.push_back(Pending {
                    location: pending.location.nested(&member),
                    path: opener.path().to_path_buf(),
                    depth: pending.depth + 1,
                });
            }
        }

        Ok(found)
    }

    /// Logs and swallows errors that only concern one member.
    fn tolerate(
        &self,
        pending: &Pending,
        name: &str,
        result: error::Result<Opener>,
    ) -> error::Result<Option<Opener>> {
        match result {
            Ok(opener) => Ok(Some(opener)),
            Err(err) if err.is_member_error() => {
                log::warn!("skipping {}:{name}: {err}", pending.location.access_path());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn visit_zip(&self, pending: &Pending, wanted: &[&str], descend: bool) -> Result<Visited> {
        let mut archive = ZipReadCloser::open(&pending.path)?;
        let manifest = ZipFileManifest::from_archive(&mut archive)?;
        let is_file = |name: &String| manifest.get(name).is_some_and(|info| !info.is_dir);

        let targets: BTreeSet<String> = manifest
            .glob_match(wanted)
            .into_iter()
            .filter(is_file)
            .collect();
        let archives: BTreeSet<String> = match descend {
            true => manifest
                .iter()
                .filter(|(_, info)| !info.is_dir)
                .filter(|(name, _)| self.descend.iter().any(|p| p.matches(name)))
                .map(|(name, _)| name.to_string())
                .collect(),
            false => BTreeSet::new(),
        };

        let selected: BTreeSet<&str> = targets
            .iter()
            .chain(&archives)
            .map(String::as_str)
            .collect();
        let mut visited = Visited::default();
        archive.traverse(&selected, |file| {
            let name = file.name().to_string();
            let result = self
                .extractor
                .copy_to_unique_temp_file(self.scratch.path(), &name, file);
            if let Some(opener) = self.tolerate(pending, &name, result)? {
                self.record(pending, &mut visited, name, opener, &targets, &archives);
            }
            Ok(())
        })?;

        Ok(visited)
    }

    fn visit_tar(&self, pending: &Pending, wanted: &[Pattern], descend: bool) -> Result<Visited> {
        let mut patterns = wanted.to_vec();
        if descend {
            patterns.extend(self.descend.iter().cloned());
        }

        let mut visited = Visited::default();
        let mut targets = BTreeSet::new();
        let mut archives = BTreeSet::new();
        // scratch copies lose the member's extension
        let hint = compression_for_name(pending.location.real_path());
        traverse_files_in_tar(&pending.path, hint, &patterns, |name, entry| {
            if wanted.iter().any(|p| p.matches(name)) {
                targets.insert(name.to_string());
            }
            if descend && self.descend.iter().any(|p| p.matches(name)) {
                archives.insert(name.to_string());
            }
            let result = self
                .extractor
                .copy_to_unique_temp_file(self.scratch.path(), name, entry);
            if let Some(opener) = self.tolerate(pending, name, result)? {
                self.record(pending, &mut visited, name.to_string(), opener, &targets, &archives);
            }
            Ok::<_, ArchiveError>(())
        })?;

        Ok(visited)
    }

    fn record(
        &self,
        pending: &Pending,
        visited: &mut Visited,
        name: String,
        opener: Opener,
        targets: &BTreeSet<String>,
        archives: &BTreeSet<String>,
    ) {
        if targets.contains(&name) {
            visited.found.push(NestedFile {
                location: pending.location.nested(&name),
                opener: opener.clone(),
            });
        }
        if archives.contains(&name) {
            visited.archives.push((name, opener));
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{brotli, gzip, lz4, snappy, tar_bytes, zip_bytes, TarFixture};

    fn virtual_paths(found: &[NestedFile]) -> Vec<String> {
        found
            .iter()
            .map(|f| f.location.access_path().to_string())
            .collect()
    }

    fn read(file: &NestedFile) -> String {
        let mut content = String::new();
        file.opener.open().unwrap().read_to_string(&mut content).unwrap();
        content
    }

    fn nested_jars() -> Vec<u8> {
        let inner = zip_bytes(&[("c.class", "cafe"), ("META-INF/MANIFEST.MF", "inner\n")]);
        let middle = zip_bytes(&[("b.jar", inner.as_slice()), ("b.class", b"babe".as_slice())]);
        zip_bytes(&[
            ("META-INF/", b"".as_slice()),
            ("META-INF/MANIFEST.MF", b"outer\n".as_slice()),
            ("lib/b.jar", middle.as_slice()),
        ])
    }

    #[test]
    fn test_chained_virtual_paths() {
        let nested = NestedArchives::new(&SearchConfig::default()).unwrap();
        let found = nested
            .discover("a.jar", Cursor::new(nested_jars()), &["*.class"])
            .unwrap();

        assert_eq!(
            virtual_paths(&found),
            ["a.jar:lib/b.jar:b.class", "a.jar:lib/b.jar:b.jar:c.class"]
        );
        assert_eq!(found[1].location.real_path(), "c.class");
        assert_eq!(read(&found[1]), "cafe");
        assert!(found[1].opener.path().starts_with(nested.scratch_dir()));
    }

    #[test]
    fn test_wanted_archive_is_reported_and_descended() {
        let nested = NestedArchives::new(&SearchConfig::default()).unwrap();
        let found = nested
            .discover(
                "a.jar",
                Cursor::new(nested_jars()),
                &["*/MANIFEST.MF", "/lib/b.jar"],
            )
            .unwrap();

        assert_eq!(
            virtual_paths(&found),
            [
                "a.jar:META-INF/MANIFEST.MF",
                "a.jar:lib/b.jar",
                "a.jar:lib/b.jar:b.jar:META-INF/MANIFEST.MF"
            ]
        );
        assert_eq!(read(&found[0]), "outer\n");
        assert_eq!(read(&found[2]), "inner\n");
    }

    #[test]
    fn test_depth_bound() {
        let config = SearchConfig {
            max_nested_depth: 1,
            ..Default::default()
        };
        let nested = NestedArchives::new(&config).unwrap();
        let found = nested
            .discover("a.jar", Cursor::new(nested_jars()), &["*.class"])
            .unwrap();
        assert_eq!(virtual_paths(&found), ["a.jar:lib/b.jar:b.class"]);

        let config = SearchConfig {
            max_nested_depth: 0,
            ..Default::default()
        };
        let nested = NestedArchives::new(&config).unwrap();
        let found = nested
            .discover("a.jar", Cursor::new(nested_jars()), &["*.class"])
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_corrupt_nested_archive_is_skipped() {
        let outer = zip_bytes(&[
            ("broken.jar", b"not a zip at all".as_slice()),
            ("ok.txt", b"ok".as_slice()),
        ]);
        let nested = NestedArchives::new(&SearchConfig::default()).unwrap();
        let found = nested
            .discover("outer.zip", Cursor::new(outer), &["*.txt"])
            .unwrap();
        assert_eq!(virtual_paths(&found), ["outer.zip:ok.txt"]);
    }

    #[test]
    fn test_corrupt_outer_archive_is_an_error() {
        let nested = NestedArchives::new(&SearchConfig::default()).unwrap();
        let err = nested
            .discover("outer.jar", Cursor::new(b"garbage".to_vec()), &["*"])
            .unwrap_err();
        assert!(format!("{err:#}").contains("outer.jar"), "{err:#}");
    }

    #[test]
    fn test_oversized_member_is_skipped() {
        let big = "x".repeat(4096);
        let outer = zip_bytes(&[("big.txt", big.as_str()), ("small.txt", "small")]);

        let nested = NestedArchives::new(&SearchConfig::default())
            .unwrap()
            .with_extractor(Extractor::with_limit(1024));
        let found = nested
            .discover("outer.zip", Cursor::new(outer.clone()), &["*.txt"])
            .unwrap();
        assert_eq!(virtual_paths(&found), ["outer.zip:small.txt"]);

        // the outer copy goes through the same ceiling
        let nested = NestedArchives::new(&SearchConfig::default())
            .unwrap()
            .with_extractor(Extractor::with_limit(32));
        assert!(nested
            .discover("outer.zip", Cursor::new(outer), &["*.txt"])
            .is_err());
    }

    #[test]
    fn test_tar_family() {
        let jar = zip_bytes(&[("c.class", "cafe")]);
        let tarball = gzip(&tar_bytes(&[
            TarFixture::Dir("app"),
            TarFixture::File("app/lib.jar", &jar),
            TarFixture::File("app/notes.txt", b"notes"),
        ]));

        // tarballs are only descended into when unindexed archives are included
        let nested = NestedArchives::new(&SearchConfig::default()).unwrap();
        let outer = zip_bytes(&[("dist/app.tar.gz", tarball.as_slice())]);
        let found = nested
            .discover("bundle.zip", Cursor::new(outer.clone()), &["*.class", "*.txt"])
            .unwrap();
        assert!(found.is_empty());

        let config = SearchConfig {
            include_unindexed_archives: true,
            ..Default::default()
        };
        let nested = NestedArchives::new(&config).unwrap();
        let found = nested
            .discover("bundle.zip", Cursor::new(outer), &["**/*.class", "**/*.txt"])
            .unwrap();
        assert_eq!(
            virtual_paths(&found),
            [
                "bundle.zip:dist/app.tar.gz:app/notes.txt",
                "bundle.zip:dist/app.tar.gz:app/lib.jar:c.class"
            ]
        );
        assert_eq!(read(&found[0]), "notes");
    }

    #[test]
    fn test_tar_codecs() {
        let tarball = tar_bytes(&[TarFixture::File("app/notes.txt", b"notes")]);
        let config = SearchConfig {
            include_unindexed_archives: true,
            ..Default::default()
        };
        let nested = NestedArchives::new(&config).unwrap();

        for (name, compressed) in [
            ("dist/app.tar.lz4", lz4(&tarball)),
            ("dist/app.tlz4", lz4(&tarball)),
            ("dist/app.tar.sz", snappy(&tarball)),
            ("dist/app.tsz", snappy(&tarball)),
            ("dist/app.tar.br", brotli(&tarball)),
            ("dist/app.tbr", brotli(&tarball)),
        ] {
            let outer = zip_bytes(&[(name, compressed.as_slice())]);
            let found = nested
                .discover("bundle.zip", Cursor::new(outer), &["**/*.txt"])
                .unwrap();
            assert_eq!(
                virtual_paths(&found),
                [format!("bundle.zip:{name}:app/notes.txt")],
                "{name}"
            );
            assert_eq!(read(&found[0]), "notes");
        }
    }
}
