//! Tar-family archives: compression sniffing and streaming traversal.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::Path,
};

use tar::{Archive, Entry, EntryType};

use super::glob::Pattern;
use crate::error::Result;

/// The compression wrapped around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Lz4,
    Snappy,
    /// Brotli streams carry no magic; only the file name gives them away.
    Brotli,
}

/// Identifies the compression of a stream from its first few bytes.
pub fn detect_compression(header: &[u8]) -> Compression {
    match header {
        [0x1f, 0x8b, ..] => Compression::Gzip,
        [b'B', b'Z', b'h', ..] => Compression::Bzip2,
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Compression::Xz,
        [0x28, 0xb5, 0x2f, 0xfd, ..] => Compression::Zstd,
        [0x04, 0x22, 0x4d, 0x18, ..] => Compression::Lz4,
        // framed stream identifier chunk: "sNaPpY"
        [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y', ..] => Compression::Snappy,
        _ => Compression::None,
    }
}

/// The compression implied by a file name, for formats that cannot be sniffed.
pub fn compression_for_name(name: &str) -> Option<Compression> {
    (name.ends_with(".br") || name.ends_with(".tbr")).then_some(Compression::Brotli)
}

/// Wraps `reader` in the decoder matching its (sniffed) compression.
pub fn decompress<'a>(reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
    decompress_with_hint(reader, None)
}

/// Like [`decompress`], falling back to `hint` when the leading bytes are not recognized.
pub fn decompress_with_hint<'a>(
    reader: impl Read + 'a,
    hint: Option<Compression>,
) -> io::Result<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(reader);
    let compression = match detect_compression(reader.fill_buf()?) {
        Compression::None => hint.unwrap_or(Compression::None),
        sniffed => sniffed,
    };
    log::trace!("tar stream compression: {compression:?}");

    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(bzip2::bufread::MultiBzDecoder::new(reader)),
        Compression::Xz => Box::new(xz2::bufread::XzDecoder::new_multi_decoder(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        Compression::Snappy => Box::new(snap::read::FrameDecoder::new(reader)),
        Compression::Brotli => Box::new(brotli::Decompressor::new(reader, BROTLI_BUFFER_SIZE)),
    })
}

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Opens the (possibly compressed) tar archive at `path`.  `hint` names the compression when it
/// cannot be sniffed, see [`compression_for_name`].
pub fn open_tar(
    path: impl AsRef<Path>,
    hint: Option<Compression>,
) -> io::Result<Archive<Box<dyn Read>>> {
    Ok(Archive::new(decompress_with_hint(File::open(path)?, hint)?))
}

/// The entry path as written in the archive, lossily converted to UTF-8.
pub fn entry_name<R: Read>(entry: &Entry<'_, R>) -> io::Result<String> {
    Ok(entry.path()?.to_string_lossy().into_owned())
}

/// Streams the archive once, calling `visitor` for every regular file whose name matches one of
/// `patterns`.  Directories, links and special files are skipped.
pub fn traverse_files_in_tar(
    archive_path: impl AsRef<Path>,
    hint: Option<Compression>,
    patterns: &[Pattern],
    mut visitor: impl FnMut(&str, &mut Entry<'_, Box<dyn Read>>) -> Result<()>,
) -> Result<()> {
    let mut archive = open_tar(archive_path, hint)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !matches!(
            entry.header().entry_type(),
            EntryType::Regular | EntryType::Continuous
        ) {
            continue;
        }

        let name = entry_name(&entry)?;
        if patterns.iter().any(|p| p.matches(&name)) {
            log::trace!("visiting tar member {name:?}");
            visitor(&name, &mut entry)?;
        }
    }

    Ok(())
}
