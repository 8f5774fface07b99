use std::fmt;

use tar::EntryType;

/// The kind of file an index entry describes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    #[default]
    RegularFile,
    HardLink,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Directory,
    Fifo,
    Socket,
    Irregular,
}

impl FileType {
    /// Decodes the type bits of a raw `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        use rustix::fs::FileType as Raw;

        match Raw::from_raw_mode(mode) {
            Raw::RegularFile => FileType::RegularFile,
            Raw::Directory => FileType::Directory,
            Raw::Symlink => FileType::SymbolicLink,
            Raw::Fifo => FileType::Fifo,
            Raw::Socket => FileType::Socket,
            Raw::CharacterDevice => FileType::CharacterDevice,
            Raw::BlockDevice => FileType::BlockDevice,
            Raw::Unknown => FileType::Irregular,
        }
    }

    pub fn from_entry_type(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => FileType::RegularFile,
            EntryType::Link => FileType::HardLink,
            EntryType::Symlink => FileType::SymbolicLink,
            EntryType::Char => FileType::CharacterDevice,
            EntryType::Block => FileType::BlockDevice,
            EntryType::Directory => FileType::Directory,
            EntryType::Fifo => FileType::Fifo,
            _ => FileType::Irregular,
        }
    }

    /// Whether a resolver indexes files of this type.  Directories are indexed as tree nodes but
    /// never returned as file results.
    pub fn is_indexable(self) -> bool {
        matches!(
            self,
            FileType::RegularFile
                | FileType::HardLink
                | FileType::SymbolicLink
                | FileType::Directory
        )
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::RegularFile => "RegularFile",
            FileType::HardLink => "HardLink",
            FileType::SymbolicLink => "SymbolicLink",
            FileType::CharacterDevice => "CharacterDevice",
            FileType::BlockDevice => "BlockDevice",
            FileType::Directory => "Directory",
            FileType::Fifo => "FIFONode",
            FileType::Socket => "Socket",
            FileType::Irregular => "IrregularFile",
        })
    }
}

/// What a resolver knows about a file without reading it (apart from the MIME type, which is
/// sniffed once at index time).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Permission bits (including setuid/setgid/sticky), without the type bits.
    pub mode: u32,
    pub file_type: FileType,
    pub user_id: u32,
    pub group_id: u32,
    /// The link target, verbatim, for symlinks and hard links.  Empty otherwise.
    pub link_destination: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileMetadata {
    pub fn from_tar_header(header: &tar::Header) -> std::io::Result<Self> {
        let link_destination = match header.link_name()? {
            Some(target) => target.to_string_lossy().into_owned(),
            None => String::new(),
        };

        Ok(FileMetadata {
            mode: header.mode()? & 0o7777,
            file_type: FileType::from_entry_type(header.entry_type()),
            user_id: header.uid()? as u32,
            group_id: header.gid()? as u32,
            link_destination,
            size: header.entry_size()?,
            mime_type: String::new(),
        })
    }
}
