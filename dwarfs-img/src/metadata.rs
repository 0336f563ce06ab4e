//! The metadata structures of a DwarFS image and their frozen codec.
//!
//! [`Metadata`] is parsed as-is from the frozen blob: no unpacking of packed
//! tables is performed and no cross-table validation happens here, only the
//! binary structure is decoded. For validated, high-level access to the image
//! hierarchy use [`Archive`][crate::Archive] instead.
//!
//! The on-wire encoding is schema-driven: a [`Schema`] blob describes the bit
//! layout of every field (see [`schema`]), and the data blob is a bit-packed
//! frozen value (see [`frozen`]). [`Metadata::to_schema_and_bytes`] and
//! [`Metadata::parse`] are exact inverses for any valid metadata value.
use std::fmt;

use bstr::BString;

use self::frozen::{impl_frozen_struct, Freeze, Thaw};

pub mod schema;

pub(crate) mod frozen;

#[cfg(test)]
mod tests;

pub use schema::Schema;

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from encoding or decoding schema or metadata blobs.
#[derive(Debug)]
pub struct Error(pub(crate) Box<str>);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {}

impl From<schema::Error> for Error {
    #[cold]
    fn from(err: schema::Error) -> Self {
        Self(format!("invalid schema: {err}").into())
    }
}

impl Metadata {
    /// Parse metadata from its frozen on-disk form
    /// ([`SectionType::METADATA_V2`](crate::section::SectionType::METADATA_V2)),
    /// using the layout described by `schema`.
    pub fn parse(schema: &Schema, bytes: &[u8]) -> Result<Self> {
        frozen::thaw(schema, bytes)
    }

    /// Freeze this metadata into a schema blob and a data blob, the reverse
    /// of [`Metadata::parse`].
    ///
    /// The encoding is deterministic: equal values freeze to equal bytes.
    pub fn to_schema_and_bytes(&self) -> Result<(Schema, Vec<u8>)> {
        frozen::freeze(self)
    }
}

/// The root metadata value: every table describing the directory tree.
///
/// Inodes are numbered in one contiguous range partitioned by kind:
/// directories, symlinks, regular files (unique then shared), block/char
/// devices, then pipes/sockets. Inode 0 is the root directory.
#[derive(Default, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Metadata {
    /// All chunks, grouped by file and indexed through `chunk_table`.
    pub chunks: Vec<Chunk>,
    /// One entry per directory inode plus a sentinel whose `first_entry` is
    /// `dir_entries.len()`.
    pub directories: Vec<Directory>,
    /// One entry per inode.
    pub inodes: Vec<InodeData>,
    /// Maps a file-local inode index to its first chunk; one sentinel at the
    /// end. May be delta-packed, see [`FsOptions::packed_chunk_table`].
    pub chunk_table: Vec<u32>,
    /// Maps a symlink-local inode index to an index into `symlinks` /
    /// `compact_symlinks`.
    pub symlink_table: Vec<u32>,
    /// Deduplicated owner ids, referenced by `InodeData::owner_index`.
    pub uids: Vec<u32>,
    /// Deduplicated group ids, referenced by `InodeData::group_index`.
    pub gids: Vec<u32>,
    /// Deduplicated file modes, referenced by `InodeData::mode_index`.
    pub modes: Vec<u32>,
    /// Entry names as a plain table. Empty when `compact_names` is used.
    pub names: Vec<BString>,
    /// Symlink targets as a plain table. Empty when `compact_symlinks` is
    /// used.
    pub symlinks: Vec<BString>,
    /// The minimum timestamp over all inodes, scaled by the time resolution.
    pub timestamp_base: u64,
    /// The block size in bytes. Always a power of two.
    pub block_size: u32,
    /// Total size of all regular files, before deduplication by hardlinks.
    pub total_fs_size: u64,
    /// Device ids, parallel to the device inode range.
    pub devices: Option<Vec<u64>>,
    /// Packing flags and time options.
    pub options: Option<FsOptions>,
    /// All directory entries, grouped by parent directory, sorted by name
    /// within a parent. Entry 0 is the root's self entry.
    pub dir_entries: Vec<DirEntry>,
    /// Maps a shared-file inode (relative to the start of the shared range)
    /// to a unique-file index (relative to the number of unique files). May
    /// be run-length packed, see [`FsOptions::packed_shared_files_table`].
    pub shared_files_table: Option<Vec<u32>>,
    /// Bytes saved by hardlinks, i.e. the sizes of all hardlinked entries
    /// beyond the first of each group.
    pub total_hardlink_size: Option<u64>,
    /// Name and version of the creating program.
    pub dwarfs_version: Option<BString>,
    /// Image creation time, in seconds since the UNIX epoch.
    pub create_timestamp: Option<u64>,
    /// Entry names in compact form. `names` is empty when this is set.
    pub compact_names: Option<StringTable>,
    /// Symlink targets in compact form. `symlinks` is empty when this is set.
    pub compact_symlinks: Option<StringTable>,
}

impl_frozen_struct! {
    Metadata {
        1 => chunks,
        2 => directories,
        3 => inodes,
        4 => chunk_table,
        5 => symlink_table,
        6 => uids,
        7 => gids,
        8 => modes,
        9 => names,
        10 => symlinks,
        11 => timestamp_base,
        12 => block_size,
        13 => total_fs_size,
        14 => devices,
        15 => options,
        16 => dir_entries,
        17 => shared_files_table,
        18 => total_hardlink_size,
        19 => dwarfs_version,
        20 => create_timestamp,
        21 => compact_names,
        22 => compact_symlinks,
    }
}

/// A contiguous byte slice of one block.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Index of the block section holding the bytes.
    pub block: u32,
    /// Byte offset within the uncompressed block.
    pub offset: u32,
    /// Length in bytes. `offset + size` never exceeds the block size.
    pub size: u32,
}

impl_frozen_struct! {
    Chunk {
        1 => block,
        2 => offset,
        3 => size,
    }
}

/// Per-directory entry range and parent link.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    /// Index into `dir_entries` of this directory's entry in its parent.
    /// Zeroed when `packed_directories` is set; recovered at load time.
    pub parent_entry: u32,
    /// Index into `dir_entries` of this directory's first child entry.
    /// Delta-encoded when `packed_directories` is set.
    pub first_entry: u32,
}

impl_frozen_struct! {
    Directory {
        1 => parent_entry,
        2 => first_entry,
    }
}

/// Per-inode metadata row.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeData {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
    /// Access time minus `timestamp_base`, in resolution units. Zero when
    /// `mtime_only` is set.
    pub atime_offset: u32,
    /// Modification time minus `timestamp_base`, in resolution units.
    pub mtime_offset: u32,
    /// Change time minus `timestamp_base`, in resolution units. Zero when
    /// `mtime_only` is set.
    pub ctime_offset: u32,
}

impl_frozen_struct! {
    InodeData {
        1 => mode_index,
        2 => owner_index,
        3 => group_index,
        4 => atime_offset,
        5 => mtime_offset,
        6 => ctime_offset,
    }
}

/// A (name, inode) pair inside some directory.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Index into the names table.
    pub name_index: u32,
    /// The referenced inode number.
    pub inode_num: u32,
}

impl_frozen_struct! {
    DirEntry {
        1 => name_index,
        2 => inode_num,
    }
}

/// Image-wide options recorded by the builder.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Only mtime is stored; atime/ctime fall back to mtime at read time.
    pub mtime_only: bool,
    /// Timestamp resolution in seconds. `None` means 1.
    pub time_resolution_sec: Option<u32>,
    /// `chunk_table` stores successive differences.
    pub packed_chunk_table: bool,
    /// `directories` stores `first_entry` deltas and zeroed `parent_entry`.
    pub packed_directories: bool,
    /// `shared_files_table` stores run lengths minus 2.
    pub packed_shared_files_table: bool,
}

impl_frozen_struct! {
    FsOptions {
        1 => mtime_only,
        2 => time_resolution_sec,
        3 => packed_chunk_table,
        4 => packed_directories,
        5 => packed_shared_files_table,
    }
}

/// A compact string table.
///
/// `buffer` is the concatenation of all items, optionally FSST-compressed
/// (then `symtab` holds the symbol table). The index is either `N + 1`
/// cumulative offsets starting at 0, or, when `packed_index` is set, `N`
/// per-item lengths.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub buffer: BString,
    pub symtab: Option<BString>,
    pub index: Vec<u32>,
    pub packed_index: bool,
}

impl_frozen_struct! {
    StringTable {
        1 => buffer,
        2 => symtab,
        3 => index,
        4 => packed_index,
    }
}
