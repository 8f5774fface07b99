//! Container images as stacks of layer tarballs.
//!
//! Layers are read once, in order.  Every entry is recorded in a [`FileCatalog`] (metadata plus,
//! for regular files, the content) and in two trees: the layer's own tree and the cumulative
//! squash up to that layer, which follows overlay semantics (`.wh.<name>` deletes `<name>`,
//! `.wh..wh..opq` empties its directory).  The last layer's squash is the image's filesystem.

mod catalog;
mod layer;

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub use self::{
    catalog::{CatalogEntry, Content, FileCatalog},
    layer::Layer,
};
use self::layer::LayerReader;
use crate::{
    archive::{
        safety::ZIP_READ_LIMIT,
        tar::{detect_compression, Compression},
    },
    tree::{FileRef, FileTree, Inode, Leaf, LeafKind, LinkPolicy, MAX_LINK_DEPTH},
};

pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    pub index: usize,
    pub digest: String,
    pub media_type: String,
    /// Size of the raw layer blob, as stored.
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub manifest_digest: Option<String>,
    pub layers: Vec<LayerMetadata>,
    pub size: u64,
}

/// A loaded image.  Spilled file content lives in a scratch directory removed on drop.
#[derive(Debug)]
pub struct Image {
    pub metadata: ImageMetadata,
    pub layers: Vec<Layer>,
    pub catalog: FileCatalog,
    squash: FileTree,
    _scratch: TempDir,
}

impl Image {
    /// Loads an image from `(digest, reader)` pairs, bottom layer first.  Readers may be
    /// compressed.
    pub fn from_layer_readers<R: Read>(
        layers: impl IntoIterator<Item = (String, R)>,
    ) -> Result<Self> {
        let layers = layers.into_iter().map(|(digest, reader)| {
            let metadata = LayerMetadata {
                digest,
                media_type: MEDIA_TYPE_LAYER.to_string(),
                ..Default::default()
            };
            (metadata, reader)
        });
        Self::load(layers, None)
    }

    /// Loads an image from layer tarballs on disk, bottom layer first.  Each layer's digest is the
    /// sha256 of the file as stored.
    pub fn from_layer_tars<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut layers = vec![];
        for path in paths {
            let path = path.as_ref();
            let (digest, compression) = digest_file(path)
                .with_context(|| format!("Failed to read layer {path:?}"))?;
            let media_type = match compression {
                Compression::Gzip => format!("{MEDIA_TYPE_LAYER}+gzip"),
                Compression::Zstd => format!("{MEDIA_TYPE_LAYER}+zstd"),
                _ => MEDIA_TYPE_LAYER.to_string(),
            };
            let metadata = LayerMetadata {
                digest,
                media_type,
                size: std::fs::metadata(path)?.len(),
                ..Default::default()
            };
            layers.push((metadata, File::open(path)?));
        }
        Self::load(layers, None)
    }

    /// Loads the first image of an OCI image layout directory.
    pub fn from_oci_layout(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let index = ImageIndex::from_file(dir.join("index.json"))
            .with_context(|| format!("Failed to read OCI index in {dir:?}"))?;
        let Some(manifest_descriptor) = index.manifests().first() else {
            bail!("OCI layout {dir:?} does not list any manifests");
        };
        let manifest = ImageManifest::from_file(blob_path(dir, manifest_descriptor)?)
            .context("Failed to read image manifest")?;

        let mut layers = vec![];
        for descriptor in manifest.layers() {
            let path = blob_path(dir, descriptor)?;
            let file = File::open(&path).with_context(|| format!("Missing layer blob {path:?}"))?;
            let metadata = LayerMetadata {
                digest: descriptor.digest().to_string(),
                media_type: descriptor.media_type().to_string(),
                size: descriptor.size(),
                ..Default::default()
            };
            layers.push((metadata, file));
        }

        Self::load(layers, Some(manifest_descriptor.digest().to_string()))
    }

    fn load<R: Read>(
        layers: impl IntoIterator<Item = (LayerMetadata, R)>,
        manifest_digest: Option<String>,
    ) -> Result<Self> {
        let scratch = TempDir::with_prefix("minicat-image-")?;
        let mut catalog = FileCatalog::new();
        let mut squash = FileTree::new();
        let mut loaded = vec![];

        for (index, (mut metadata, reader)) in layers.into_iter().enumerate() {
            metadata.index = index;
            let digest = metadata.digest.clone();
            let mut layer_reader = LayerReader {
                catalog: &mut catalog,
                scratch: scratch.path(),
                squash: &mut squash,
                limit: ZIP_READ_LIMIT,
            };
            loaded.push(
                layer_reader
                    .read_layer(metadata, reader)
                    .with_context(|| format!("Failed to read layer {index} ({digest})"))?,
            );
        }
        ensure!(!loaded.is_empty(), "the image does not contain any layers");

        let metadata = ImageMetadata {
            manifest_digest,
            size: loaded.iter().map(|layer| layer.metadata.size).sum(),
            layers: loaded.iter().map(|layer| layer.metadata.clone()).collect(),
        };

        Ok(Image {
            metadata,
            layers: loaded,
            catalog,
            squash,
            _scratch: scratch,
        })
    }

    /// The image's filesystem: all layers applied in order.
    pub fn squashed_tree(&self) -> &FileTree {
        &self.squash
    }

    pub fn entry(&self, reference: &FileRef) -> Option<&CatalogEntry> {
        self.catalog.get(reference)
    }

    /// The layer that introduced the referenced file.
    pub fn layer_of(&self, reference: &FileRef) -> Option<&Layer> {
        self.entry(reference)
            .and_then(|entry| self.layers.get(entry.layer))
    }

    pub fn open(&self, reference: &FileRef) -> io::Result<Box<dyn Read + '_>> {
        self.catalog.open(reference)
    }

    /// Regular files of the squash with any of the given MIME types.  Files that were later
    /// replaced or deleted are not reported.
    pub fn files_by_mime_type_from_squash(&self, types: &[&str]) -> Vec<FileRef> {
        self.layers
            .iter()
            .flat_map(|layer| layer.files_by_mime_type(types))
            .filter(|reference| {
                self.squash
                    .node(&reference.real_path)
                    .and_then(Inode::reference)
                    == Some(reference)
            })
            .collect()
    }
}

/// Resolves `path` in `tree`, following symlinks everywhere and hard links at the end.  Returns
/// the terminal node with its real path, or `None` for missing paths and dead links.
pub fn resolve_link<'a>(tree: &'a FileTree, path: &str) -> Option<(String, &'a Inode)> {
    let mut resolved = tree.resolve(path, LinkPolicy::FollowBasename)?;
    for _ in 0..MAX_LINK_DEPTH {
        match resolved.1 {
            Inode::Leaf(Leaf {
                kind: LeafKind::Hardlink(target),
                ..
            }) => resolved = tree.resolve(target, LinkPolicy::FollowBasename)?,
            _ => return Some(resolved),
        }
    }
    None
}

fn digest_file(path: &Path) -> io::Result<(String, Compression)> {
    let mut reader = BufReader::new(File::open(path)?);
    let compression = detect_compression(reader.fill_buf()?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), compression))
}

fn blob_path(dir: &Path, descriptor: &Descriptor) -> Result<PathBuf> {
    let digest = descriptor.digest().to_string();
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        bail!("Malformed digest {digest:?}");
    };
    ensure!(
        !algorithm.contains('/') && !encoded.contains('/'),
        "Malformed digest {digest:?}"
    );
    Ok(dir.join("blobs").join(algorithm).join(encoded))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        source::FileType,
        test::{gzip, tar_bytes, TarFixture},
    };

    fn image(layers: &[Vec<u8>]) -> Image {
        Image::from_layer_readers(
            layers
                .iter()
                .enumerate()
                .map(|(idx, data)| (format!("sha256:{idx:064}"), &data[..])),
        )
        .unwrap()
    }

    fn squash_paths(image: &Image) -> Vec<String> {
        image.squashed_tree().walk().map(|(path, _)| path).collect()
    }

    fn read(image: &Image, reference: &FileRef) -> Vec<u8> {
        let mut out = vec![];
        image.open(reference).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_zero_layers_is_an_error() {
        let layers: Vec<(String, &[u8])> = vec![];
        assert!(Image::from_layer_readers(layers).is_err());
    }

    #[test]
    fn test_whiteouts() {
        let image = image(&[
            tar_bytes(&[
                TarFixture::Dir("etc"),
                TarFixture::File("etc/passwd", b"root:x:0:0"),
                TarFixture::File("etc/group", b"root:x:0:"),
                TarFixture::Dir("opt"),
                TarFixture::File("opt/a", b"a"),
                TarFixture::File("opt/b", b"b"),
                TarFixture::File("tmp/x", b"x"),
            ]),
            tar_bytes(&[
                TarFixture::File("etc/.wh.group", b""),
                TarFixture::Dir("opt"),
                TarFixture::File("opt/.wh..wh..opq", b""),
                TarFixture::File("opt/c", b"c"),
                TarFixture::File(".wh.tmp", b""),
            ]),
        ]);

        assert_eq!(
            squash_paths(&image),
            ["/", "/etc", "/etc/passwd", "/opt", "/opt/c"]
        );
        // the lower layer's squash is unaffected
        assert!(image.layers[0].squashed_tree.has_path("/etc/group"));
        // whiteouts are not files of the upper layer
        let upper: Vec<String> = image.layers[1].tree.walk().map(|(path, _)| path).collect();
        assert_eq!(upper, ["/", "/opt", "/opt/c"]);

        assert_eq!(image.metadata.layers.len(), 2);
        assert_eq!(image.metadata.layers[1].index, 1);
        assert!(image.metadata.layers[0].size > 0);
    }

    #[test]
    fn test_content_inline_and_spilled() {
        let big = vec![b'x'; crate::INLINE_CONTENT_MAX + 1];
        let image = image(&[gzip(&tar_bytes(&[
            TarFixture::File("small", b"small"),
            TarFixture::File("big", &big),
            TarFixture::File("empty", b""),
        ]))]);

        let tree = image.squashed_tree();
        let (_, small) = tree.resolve("/small", LinkPolicy::FollowBasename).unwrap();
        let small = small.reference().unwrap();
        assert!(matches!(image.entry(small).unwrap().content, Content::Inline(..)));
        assert_eq!(read(&image, small), b"small");
        assert_eq!(
            image.entry(small).unwrap().metadata.mime_type,
            crate::source::mime::TEXT_PLAIN
        );

        let (_, spilled) = tree.resolve("/big", LinkPolicy::FollowBasename).unwrap();
        let spilled = spilled.reference().unwrap();
        assert!(matches!(image.entry(spilled).unwrap().content, Content::External(..)));
        assert_eq!(read(&image, spilled), big);

        let (_, empty) = tree.resolve("/empty", LinkPolicy::FollowBasename).unwrap();
        assert_eq!(read(&image, empty.reference().unwrap()), b"");
    }

    #[test]
    fn test_links() {
        let image = image(&[tar_bytes(&[
            TarFixture::File("usr/bin/busybox", b"#!/bin/sh\n"),
            TarFixture::Hardlink("bin/sh", "usr/bin/busybox"),
            TarFixture::Symlink("bin/ash", "sh"),
            TarFixture::Symlink("bin/dead", "/nowhere"),
            TarFixture::Fifo("run/fifo"),
        ])]);
        let tree = image.squashed_tree();

        let (path, inode) = resolve_link(tree, "/bin/ash").unwrap();
        assert_eq!(path, "/usr/bin/busybox");
        assert_eq!(read(&image, inode.reference().unwrap()), b"#!/bin/sh\n");
        assert!(resolve_link(tree, "/bin/dead").is_none());

        let (_, sh) = tree.resolve("/bin/sh", LinkPolicy::NoFollowBasename).unwrap();
        let entry = image.entry(sh.reference().unwrap()).unwrap();
        assert_eq!(entry.metadata.file_type, FileType::HardLink);
        assert_eq!(entry.metadata.link_destination, "/usr/bin/busybox");

        let (_, fifo) = tree.resolve("/run/fifo", LinkPolicy::NoFollowBasename).unwrap();
        assert_eq!(
            image.entry(fifo.reference().unwrap()).unwrap().metadata.file_type,
            FileType::Fifo
        );
    }

    #[test]
    fn test_mime_types_from_squash() {
        let image = image(&[
            tar_bytes(&[
                TarFixture::File("a.sh", b"#!/bin/sh\n"),
                TarFixture::File("b.sh", b"#!/bin/sh\n"),
            ]),
            tar_bytes(&[TarFixture::File("b.sh", b"plain now")]),
        ]);

        let found: Vec<String> = image
            .files_by_mime_type_from_squash(&["text/x-shellscript"])
            .into_iter()
            .map(|r| r.real_path)
            .collect();
        assert_eq!(found, ["/a.sh"]);
        assert_eq!(image.layers[0].files_by_mime_type(&["text/x-shellscript"]).len(), 2);
    }

    #[test]
    fn test_from_layer_tars_digests() {
        let dir = crate::test::tempdir();
        let data = gzip(&tar_bytes(&[TarFixture::File("a", b"a")]));
        let path = dir.path().join("layer.tar.gz");
        std::fs::write(&path, &data).unwrap();

        let image = Image::from_layer_tars(&[&path]).unwrap();
        let layer = &image.metadata.layers[0];
        assert_eq!(layer.digest, format!("sha256:{}", hex::encode(Sha256::digest(&data))));
        assert_eq!(layer.media_type, format!("{MEDIA_TYPE_LAYER}+gzip"));
        assert_eq!(layer.size, data.len() as u64);
    }
}
