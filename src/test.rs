//! Fixture builders shared by the unit tests.

use std::{
    fs::write,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use tar::{EntryType, Header};
use tempfile::TempDir;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

pub fn tempdir() -> TempDir {
    TempDir::with_prefix("minicat-test-").unwrap()
}

fn file_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode)
}

/// Builds an in-memory zip archive.  Names ending in '/' become directory entries.
pub fn zip_bytes<C: AsRef<[u8]>>(entries: &[(&str, C)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(vec![]));

    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, file_options(0o755)).unwrap();
        } else {
            writer.start_file(*name, file_options(0o644)).unwrap();
            writer.write_all(content.as_ref()).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

pub fn write_zip<C: AsRef<[u8]>>(dir: &Path, name: &str, entries: &[(&str, C)]) -> PathBuf {
    let path = dir.join(name);
    write(&path, zip_bytes(entries)).unwrap();
    path
}

fn put16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Hand-assembles a single-entry (stored) zip archive whose legacy end record carries the
/// sentinel values, forcing readers through the ZIP64 records.
pub fn zip64_bytes(name: &str, content: &[u8]) -> Vec<u8> {
    let mut crc = flate2::Crc::new();
    crc.update(content);
    let crc = crc.sum();
    let mut out = vec![];

    // local file header
    put32(&mut out, 0x04034b50);
    put16(&mut out, 45); // version needed
    put16(&mut out, 0); // flags
    put16(&mut out, 0); // stored
    put16(&mut out, 0); // time
    put16(&mut out, 0x21); // date: 1980-01-01
    put32(&mut out, crc);
    put32(&mut out, content.len() as u32);
    put32(&mut out, content.len() as u32);
    put16(&mut out, name.len() as u16);
    put16(&mut out, 0);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(content);

    // central directory
    let directory_offset = out.len() as u64;
    put32(&mut out, 0x02014b50);
    put16(&mut out, 0x0300 | 45); // made by: unix
    put16(&mut out, 45);
    put16(&mut out, 0);
    put16(&mut out, 0);
    put16(&mut out, 0);
    put16(&mut out, 0x21);
    put32(&mut out, crc);
    put32(&mut out, content.len() as u32);
    put32(&mut out, content.len() as u32);
    put16(&mut out, name.len() as u16);
    put16(&mut out, 0); // extra
    put16(&mut out, 0); // comment
    put16(&mut out, 0); // disk start
    put16(&mut out, 0); // internal attributes
    put32(&mut out, 0o100644 << 16); // external attributes
    put32(&mut out, 0); // local header offset
    out.extend_from_slice(name.as_bytes());
    let directory_size = out.len() as u64 - directory_offset;

    // ZIP64 end of central directory
    let end64_offset = out.len() as u64;
    put32(&mut out, 0x06064b50);
    put64(&mut out, 44);
    put16(&mut out, 45);
    put16(&mut out, 45);
    put32(&mut out, 0);
    put32(&mut out, 0);
    put64(&mut out, 1);
    put64(&mut out, 1);
    put64(&mut out, directory_size);
    put64(&mut out, directory_offset);

    // ZIP64 locator
    put32(&mut out, 0x07064b50);
    put32(&mut out, 0);
    put64(&mut out, end64_offset);
    put32(&mut out, 1);

    // legacy end of central directory, all sentinels
    put32(&mut out, 0x06054b50);
    put16(&mut out, 0);
    put16(&mut out, 0);
    put16(&mut out, 0xffff);
    put16(&mut out, 0xffff);
    put32(&mut out, 0xffff_ffff);
    put32(&mut out, 0xffff_ffff);
    put16(&mut out, 0);

    out
}

/// One entry of a test layer tarball.  Paths are relative, as tar requires.
#[derive(Debug, Clone, Copy)]
pub enum TarFixture<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
    Hardlink(&'a str, &'a str),
    Fifo(&'a str),
}

fn fixture_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
}

pub fn tar_bytes(entries: &[TarFixture]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);

    for entry in entries {
        match *entry {
            TarFixture::File(path, content) => {
                let mut header = fixture_header(EntryType::Regular, 0o644, content.len() as u64);
                builder.append_data(&mut header, path, content).unwrap();
            }
            TarFixture::Dir(path) => {
                let mut header = fixture_header(EntryType::Directory, 0o755, 0);
                builder.append_data(&mut header, path, &[][..]).unwrap();
            }
            TarFixture::Symlink(path, target) => {
                let mut header = fixture_header(EntryType::Symlink, 0o777, 0);
                builder.append_link(&mut header, path, target).unwrap();
            }
            TarFixture::Hardlink(path, target) => {
                let mut header = fixture_header(EntryType::Link, 0o644, 0);
                builder.append_link(&mut header, path, target).unwrap();
            }
            TarFixture::Fifo(path) => {
                let mut header = fixture_header(EntryType::Fifo, 0o644, 0);
                builder.append_data(&mut header, path, &[][..]).unwrap();
            }
        }
    }

    builder.into_inner().unwrap()
}

pub fn write_tar(dir: &Path, name: &str, entries: &[TarFixture]) -> PathBuf {
    let path = dir.join(name);
    write(&path, tar_bytes(entries)).unwrap();
    path
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(vec![], flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn lz4(data: &[u8]) -> Vec<u8> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(vec![]);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn snappy(data: &[u8]) -> Vec<u8> {
    let mut encoder = snap::write::FrameEncoder::new(vec![]);
    encoder.write_all(data).unwrap();
    let Ok(compressed) = encoder.into_inner() else {
        panic!("failed to flush snappy frame");
    };
    compressed
}

pub fn brotli(data: &[u8]) -> Vec<u8> {
    let mut encoder = brotli::CompressorWriter::new(vec![], 4096, 9, 22);
    encoder.write_all(data).unwrap();
    encoder.into_inner()
}
