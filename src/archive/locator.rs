//! ZIP end-of-central-directory and ZIP64 record location.
//!
//! A zip archive is read from its end: the end-of-central-directory (EOCD) record says where the
//! central directory is and how big it is.  The offsets stored there are relative to the start of
//! the archive, which is not necessarily the start of the file.  Self-extracting archives, for
//! example, have an executable stub prepended.  Comparing where the EOCD actually is with where
//! the central directory claims it should end gives us the size of that prefix.
//!
//! All records are little-endian and parsed with zerocopy.

use std::io::{Read, Seek, SeekFrom};

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, KnownLayout,
};

use crate::error::{ArchiveError, Result};

pub const DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
pub const DIRECTORY64_LOC_SIGNATURE: u32 = 0x07064b50;
pub const DIRECTORY64_END_SIGNATURE: u32 = 0x06064b50;

pub const DIRECTORY_END_LEN: usize = 22;
pub const DIRECTORY64_LOC_LEN: usize = 20;
pub const DIRECTORY64_END_LEN: usize = 56;

// The EOCD is followed by a comment of up to 64k, so search the last 1k first and fall back to the
// maximum comment size plus some slack.
const SEARCH_WINDOWS: [u64; 2] = [1024, 65 * 1024];

#[derive(Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DirectoryEndRecord {
    signature: U32,
    disk_nbr: U16,
    dir_disk_nbr: U16,
    dir_records_this_disk: U16,
    directory_records: U16,
    directory_size: U32,
    directory_offset: U32,
    comment_len: U16,
}

#[derive(Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Directory64Locator {
    signature: U32,
    disk: U32,
    offset: U64,
    total_disks: U32,
}

#[derive(Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Directory64EndRecord {
    signature: U32,
    record_size: U64,
    version_made_by: U16,
    version_needed: U16,
    disk_nbr: U32,
    dir_disk_nbr: U32,
    dir_records_this_disk: U64,
    directory_records: U64,
    directory_size: U64,
    directory_offset: U64,
}

/// The decoded end-of-central-directory information, widened to the ZIP64 field sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEnd {
    pub disk_nbr: u32,
    pub dir_disk_nbr: u32,
    pub dir_records_this_disk: u64,
    pub directory_records: u64,
    pub directory_size: u64,
    pub directory_offset: u64,
}

impl DirectoryEnd {
    fn needs_zip64(&self) -> bool {
        self.directory_records == 0xffff
            || self.directory_size == 0xffff_ffff
            || self.directory_offset == 0xffff_ffff
    }
}

impl From<&DirectoryEndRecord> for DirectoryEnd {
    fn from(record: &DirectoryEndRecord) -> Self {
        DirectoryEnd {
            disk_nbr: record.disk_nbr.get().into(),
            dir_disk_nbr: record.dir_disk_nbr.get().into(),
            dir_records_this_disk: record.dir_records_this_disk.get().into(),
            directory_records: record.directory_records.get().into(),
            directory_size: record.directory_size.get().into(),
            directory_offset: record.directory_offset.get().into(),
        }
    }
}

impl From<&Directory64EndRecord> for DirectoryEnd {
    fn from(record: &Directory64EndRecord) -> Self {
        DirectoryEnd {
            disk_nbr: record.disk_nbr.get(),
            dir_disk_nbr: record.dir_disk_nbr.get(),
            dir_records_this_disk: record.dir_records_this_disk.get(),
            directory_records: record.directory_records.get(),
            directory_size: record.directory_size.get(),
            directory_offset: record.directory_offset.get(),
        }
    }
}

fn format_error(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::Format(msg.into())
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)?;
    Ok(())
}

/// Scans `block` backwards for an EOCD signature whose declared comment length fits in what
/// remains of the block.  Coincidental signature bytes inside a comment fail that check.
fn find_signature_in_block(block: &[u8]) -> Option<usize> {
    let last = block.len().checked_sub(DIRECTORY_END_LEN)?;
    (0..=last).rev().find(|&i| {
        block[i..i + 4] == DIRECTORY_END_SIGNATURE.to_le_bytes() && {
            let comment_len = u16::from_le_bytes([
                block[i + DIRECTORY_END_LEN - 2],
                block[i + DIRECTORY_END_LEN - 1],
            ]) as usize;
            comment_len + DIRECTORY_END_LEN + i <= block.len()
        }
    })
}

/// Looks for a ZIP64 locator immediately before the EOCD at `directory_end_offset` and returns the
/// offset it records for the ZIP64 end record.  A missing or unusable locator is not an error: the
/// legacy record is used as is.
fn find_directory64_end<R: Read + Seek>(
    reader: &mut R,
    directory_end_offset: u64,
) -> Result<Option<u64>> {
    let Some(locator_offset) = directory_end_offset.checked_sub(DIRECTORY64_LOC_LEN as u64) else {
        return Ok(None);
    };

    let mut buf = [0u8; DIRECTORY64_LOC_LEN];
    read_at(reader, locator_offset, &mut buf)?;
    let locator = Directory64Locator::read_from_bytes(&buf)
        .map_err(|_| format_error("short ZIP64 locator"))?;

    if locator.signature.get() != DIRECTORY64_LOC_SIGNATURE
        || locator.disk.get() != 0
        || locator.total_disks.get() != 1
    {
        return Ok(None);
    }
    Ok(Some(locator.offset.get()))
}

fn read_directory64_record<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    size: u64,
) -> Result<Option<Directory64EndRecord>> {
    if offset.saturating_add(DIRECTORY64_END_LEN as u64) > size {
        return Ok(None);
    }
    let mut buf = [0u8; DIRECTORY64_END_LEN];
    read_at(reader, offset, &mut buf)?;
    let record = Directory64EndRecord::read_from_bytes(&buf)
        .map_err(|_| format_error("short ZIP64 end record"))?;
    Ok((record.signature.get() == DIRECTORY64_END_SIGNATURE).then_some(record))
}

/// Reads the ZIP64 end record the locator points at, returning it with its absolute position.
///
/// The locator's offset is relative to the archive start, so it only points at the record when
/// nothing was prepended.  Otherwise the record is found where it normally sits: directly before
/// the locator.
fn read_directory64_end<R: Read + Seek>(
    reader: &mut R,
    recorded_offset: u64,
    directory_end_offset: u64,
    size: u64,
) -> Result<(DirectoryEnd, u64)> {
    if let Some(record) = read_directory64_record(reader, recorded_offset, size)? {
        return Ok((DirectoryEnd::from(&record), recorded_offset));
    }

    let adjacent = directory_end_offset
        .checked_sub((DIRECTORY64_LOC_LEN + DIRECTORY64_END_LEN) as u64)
        .ok_or_else(|| format_error("invalid ZIP64 end record offset"))?;
    match read_directory64_record(reader, adjacent, size)? {
        Some(record) => Ok((DirectoryEnd::from(&record), adjacent)),
        None => Err(format_error("invalid ZIP64 end record signature")),
    }
}

/// Locates and decodes the end-of-central-directory record of a zip archive of `size` bytes.
///
/// Returns the decoded record (following the ZIP64 extension when the legacy record carries
/// sentinel values) together with the absolute file offset of the record that was used.
pub fn read_directory_end<R: Read + Seek>(
    reader: &mut R,
    size: u64,
) -> Result<(DirectoryEnd, u64)> {
    let mut block = vec![];
    let mut found = None;

    for window in SEARCH_WINDOWS {
        let window = window.min(size);
        block.resize(window as usize, 0);
        read_at(reader, size - window, &mut block)?;
        if let Some(p) = find_signature_in_block(&block) {
            found = Some((size - window + p as u64, p));
            break;
        }
    }

    let Some((mut directory_end_offset, p)) = found else {
        return Err(format_error("not a valid zip file: no end of central directory"));
    };

    let record = DirectoryEndRecord::ref_from_bytes(&block[p..p + DIRECTORY_END_LEN])
        .map_err(|_| format_error("short end of central directory record"))?;
    let mut directory_end = DirectoryEnd::from(record);

    if directory_end.needs_zip64() {
        if let Some(offset) = find_directory64_end(reader, directory_end_offset)? {
            (directory_end, directory_end_offset) =
                read_directory64_end(reader, offset, directory_end_offset, size)?;
        }
    }

    if directory_end.directory_offset >= size {
        return Err(format_error(format!(
            "central directory offset {} is outside of the {size} byte file",
            directory_end.directory_offset
        )));
    }

    Ok((directory_end, directory_end_offset))
}

/// Returns the offset at which the real zip archive starts within `reader` (non-zero when
/// arbitrary bytes precede the archive).
pub fn find_archive_start_offset<R: Read + Seek>(reader: &mut R, size: u64) -> Result<u64> {
    let (directory_end, directory_end_offset) = read_directory_end(reader, size)?;

    directory_end_offset
        .checked_sub(directory_end.directory_size)
        .and_then(|v| v.checked_sub(directory_end.directory_offset))
        .ok_or_else(|| {
            format_error(format!(
                "central directory ({} bytes at {}) does not fit before its end record at {}",
                directory_end.directory_size, directory_end.directory_offset, directory_end_offset
            ))
        })
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{zip_bytes, zip64_bytes};

    fn start_offset(data: &[u8]) -> Result<u64> {
        find_archive_start_offset(&mut Cursor::new(data), data.len() as u64)
    }

    #[test]
    fn test_plain_archive_starts_at_zero() {
        let data = zip_bytes(&[("a.txt", "a"), ("dir/b.txt", "bb")]);
        assert_eq!(start_offset(&data).unwrap(), 0);

        let (end, _) = read_directory_end(&mut Cursor::new(&data), data.len() as u64).unwrap();
        assert_eq!(end.directory_records, 2);
        assert_eq!(end.dir_records_this_disk, 2);
    }

    #[test]
    fn test_prefixed_archive() {
        let data = zip_bytes(&[("a.txt", "a")]);
        for prefix_len in [1, 511, 4096, 64 * 1024] {
            let mut prefixed = vec![0x5a; prefix_len];
            prefixed.extend_from_slice(&data);
            assert_eq!(start_offset(&prefixed).unwrap(), prefix_len as u64);
        }
    }

    #[test]
    fn test_signature_inside_comment_is_ignored() {
        let mut data = zip_bytes(&[("a.txt", "a")]);
        // append a fake EOCD as a comment: its own comment length claims more bytes than remain
        let mut fake = vec![];
        fake.extend_from_slice(&DIRECTORY_END_SIGNATURE.to_le_bytes());
        fake.extend_from_slice(&[0u8; 16]);
        fake.extend_from_slice(&1000u16.to_le_bytes());
        let len = data.len();
        data[len - 2..].copy_from_slice(&(fake.len() as u16).to_le_bytes());
        data.extend_from_slice(&fake);

        assert_eq!(start_offset(&data).unwrap(), 0);
    }

    #[test]
    fn test_not_a_zip() {
        for data in [&b""[..], &b"PK"[..], &[0u8; 4096][..]] {
            assert!(matches!(start_offset(data), Err(ArchiveError::Format(..))));
        }
    }

    #[test]
    fn test_directory_offset_out_of_bounds() {
        let mut data = zip_bytes(&[("a.txt", "a")]);
        let len = data.len();
        // directoryOffset lives at bytes 16..20 of the 22-byte EOCD (no comment)
        data[len - 6..len - 2].copy_from_slice(&0x7fff_0000u32.to_le_bytes());
        assert!(matches!(start_offset(&data), Err(ArchiveError::Format(..))));
    }

    #[test]
    fn test_zip64() {
        let data = zip64_bytes("hello.txt", b"hello, world\n");
        let (end, offset) = read_directory_end(&mut Cursor::new(&data), data.len() as u64).unwrap();
        assert_eq!(end.directory_records, 1);
        assert_eq!(end.dir_records_this_disk, 1);
        assert_eq!(offset, end.directory_offset + end.directory_size);
        assert_eq!(start_offset(&data).unwrap(), 0);

        let mut prefixed = vec![0u8; 1000];
        prefixed.extend_from_slice(&data);
        assert_eq!(start_offset(&prefixed).unwrap(), 1000);
    }

    #[test]
    fn test_zip64_bad_end_record_signature() {
        let mut data = zip64_bytes("hello.txt", b"hello");
        let end64 = data.len() - DIRECTORY_END_LEN - DIRECTORY64_LOC_LEN - DIRECTORY64_END_LEN;
        data[end64] = 0;
        assert!(matches!(start_offset(&data), Err(ArchiveError::Format(..))));
    }
}
