use std::{
    collections::BTreeMap,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use anyhow::{Context, Result};
use tar::{Archive, Entry, EntryType};

use super::{
    catalog::{CatalogEntry, Content, FileCatalog},
    LayerMetadata,
};
use crate::{
    archive::{safety::bounded_copy_with_limit, tar::decompress},
    source::{mime, FileMetadata, FileType},
    tree::{FileRef, FileTree, Inode, LeafKind},
    util::{clean_path, join_path, parent_path},
    INLINE_CONTENT_MAX,
};

/// One layer of an image.
#[derive(Debug)]
pub struct Layer {
    pub metadata: LayerMetadata,
    /// The files this layer adds or changes, on their own.
    pub tree: FileTree,
    /// The filesystem after applying this layer on top of all layers below it.
    pub squashed_tree: FileTree,
    mime_types: BTreeMap<String, Vec<FileRef>>,
}

impl Layer {
    /// The regular files of this layer with any of the given MIME types.
    pub fn files_by_mime_type(&self, types: &[&str]) -> Vec<FileRef> {
        types
            .iter()
            .filter_map(|ty| self.mime_types.get(*ty))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Counts the bytes read through it: the size of the raw (compressed) layer blob.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Reads layer tarballs into the catalog, applying each on top of the running squash.
pub(super) struct LayerReader<'a> {
    pub catalog: &'a mut FileCatalog,
    pub scratch: &'a Path,
    pub squash: &'a mut FileTree,
    pub limit: u64,
}

impl LayerReader<'_> {
    pub fn read_layer(&mut self, mut metadata: LayerMetadata, reader: impl Read) -> Result<Layer> {
        let mut counter = CountingReader {
            inner: reader,
            count: 0,
        };
        let mut tree = FileTree::new();
        let mut mime_types: BTreeMap<String, Vec<FileRef>> = BTreeMap::new();

        {
            let mut archive = Archive::new(decompress(&mut counter)?);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if let Some((path, inode, mime_type)) =
                    self.read_entry(metadata.index, &mut entry)?
                {
                    if let Err(e) = tree.add(&path, inode.clone()) {
                        log::warn!("layer {}: skipping {path:?}: {e}", metadata.digest);
                        continue;
                    }
                    if let (Some(mime_type), Some(reference)) = (mime_type, inode.reference()) {
                        mime_types
                            .entry(mime_type)
                            .or_default()
                            .push(reference.clone());
                    }
                    if let Err(e) = self.squash.add(&path, inode) {
                        log::warn!("layer {}: skipping {path:?} in squash: {e}", metadata.digest);
                    }
                }
            }
            // consume the tar trailer and any padding so the blob size is complete
            io::copy(&mut archive.into_inner(), &mut io::sink())?;
        }

        if metadata.size == 0 {
            metadata.size = counter.count;
        }
        log::debug!(
            "read layer {} ({} bytes, {} entries)",
            metadata.digest,
            metadata.size,
            tree.walk().count() - 1
        );

        Ok(Layer {
            metadata,
            tree,
            squashed_tree: self.squash.clone(),
            mime_types,
        })
    }

    /// Catalogs one tar entry.  Whiteouts are applied to the squash and produce nothing.
    fn read_entry<R: Read>(
        &mut self,
        layer: usize,
        entry: &mut Entry<'_, R>,
    ) -> Result<Option<(String, Inode, Option<String>)>> {
        let path = clean_path(&format!("/{}", entry.path()?.to_string_lossy()));
        let filename = path.rsplit('/').next().unwrap_or_default();

        if let Some(whiteout) = filename.strip_prefix(".wh.") {
            let dirname = parent_path(&path);
            // complete name is '.wh..wh..opq'
            if whiteout == ".wh..opq" {
                if let Err(e) = self.squash.clear_directory(dirname) {
                    log::debug!("opaque whiteout {path:?}: {e}");
                }
            } else {
                self.squash.remove(&join_path([dirname, whiteout]));
            }
            return Ok(None);
        }

        let mut metadata = FileMetadata::from_tar_header(entry.header())
            .with_context(|| format!("Invalid tar header for {path:?}"))?;

        let content = match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let Some((content, mime_type)) = self.read_content(&path, &mut *entry)? else {
                    return Ok(None);
                };
                metadata.mime_type = mime_type.to_string();
                content
            }
            _ => Content::None,
        };

        let kind = match metadata.file_type {
            FileType::SymbolicLink => Some(LeafKind::Symlink(metadata.link_destination.clone())),
            // hard link targets are relative to the image root
            FileType::HardLink => {
                let target = clean_path(&format!("/{}", metadata.link_destination));
                metadata.link_destination = target.clone();
                Some(LeafKind::Hardlink(target))
            }
            FileType::Directory => None,
            _ => Some(LeafKind::File),
        };

        let mime_type = match metadata.mime_type.is_empty() {
            true => None,
            false => Some(metadata.mime_type.clone()),
        };
        let reference = self.catalog.add(
            &path,
            CatalogEntry {
                metadata,
                layer,
                content,
            },
        );

        let inode = match kind {
            Some(kind) => Inode::leaf(reference, kind),
            None => Inode::directory(Some(reference)),
        };
        Ok(Some((path, inode, mime_type)))
    }

    /// Reads the content of a regular file.  A file reaching the copy ceiling is left out of
    /// the layer (`None`); the rest of the layer is still read.
    fn read_content(
        &self,
        path: &str,
        mut src: impl Read,
    ) -> Result<Option<(Content, &'static str)>> {
        let mut data = vec![];

        // read one byte past the inline limit to find out which side of it we are on
        (&mut src)
            .take(INLINE_CONTENT_MAX as u64 + 1)
            .read_to_end(&mut data)?;
        if data.len() <= INLINE_CONTENT_MAX {
            let mime_type = mime::sniff(&data);
            return Ok(Some((Content::Inline(data), mime_type)));
        }

        let name = path.rsplit('/').next().unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{name}-"))
            .tempfile_in(self.scratch)?;
        match bounded_copy_with_limit(&mut file, data.as_slice().chain(src), self.limit) {
            Ok(_) => {}
            Err(err) if err.is_member_error() => {
                // dropping the temp file removes the partial copy
                log::warn!("skipping {path:?}: {err}");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read content of {path:?}"));
            }
        }

        file.seek(SeekFrom::Start(0))?;
        let mime_type = mime::sniff_reader(&mut file)?;
        let (_, spilled) = file.keep()?;
        Ok(Some((Content::External(spilled), mime_type)))
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tar_bytes, tempdir, TarFixture};

    #[test]
    fn test_oversized_file_is_left_out() {
        let scratch = tempdir();
        let mut catalog = FileCatalog::new();
        let mut squash = FileTree::new();
        let big = vec![b'x'; 10_000];
        let tarball = tar_bytes(&[
            TarFixture::File("big", &big),
            TarFixture::File("small", b"ok"),
        ]);

        let mut reader = LayerReader {
            catalog: &mut catalog,
            scratch: scratch.path(),
            squash: &mut squash,
            limit: 8192,
        };
        let layer = reader
            .read_layer(LayerMetadata::default(), &tarball[..])
            .unwrap();

        assert!(layer.tree.node("/big").is_none());
        assert!(layer.squashed_tree.node("/big").is_none());
        let small = layer.tree.node("/small").unwrap().reference().unwrap();
        let mut content = String::new();
        catalog
            .open(small)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "ok");
        assert_eq!(catalog.len(), 1);

        // no partial copy is left behind
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_mime_index_follows_the_tree() {
        let scratch = tempdir();
        let mut catalog = FileCatalog::new();
        let mut squash = FileTree::new();
        let tarball = tar_bytes(&[
            TarFixture::File("etc", b"a file"),
            // cannot be added below a regular file
            TarFixture::File("etc/hosts", b"127.0.0.1 localhost\n"),
            TarFixture::File("motd", b"hello\n"),
        ]);

        let mut reader = LayerReader {
            catalog: &mut catalog,
            scratch: scratch.path(),
            squash: &mut squash,
            limit: 8192,
        };
        let layer = reader
            .read_layer(LayerMetadata::default(), &tarball[..])
            .unwrap();

        assert!(layer.tree.node("/etc/hosts").is_none());
        let paths: Vec<String> = layer
            .files_by_mime_type(&[mime::TEXT_PLAIN])
            .into_iter()
            .map(|r| r.real_path)
            .collect();
        assert_eq!(paths, ["/etc", "/motd"]);
    }
}
