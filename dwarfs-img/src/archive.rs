//! High-level, validated access to a DwarFS image.
//!
//! [`ArchiveIndex`] owns the parsed and unpacked metadata and answers all
//! hierarchy queries; [`Archive`] owns the block cache and serves file
//! content. The split lets multiple readers share one immutable index.
//!
//! On open, the index locates the schema and metadata sections, parses them,
//! reverses any packing transforms and validates the metadata. Bounds
//! validation always runs, so the typed views below index without
//! re-checking; [`Config::check_consistency`] additionally enables the full
//! invariant suite (inode partitioning, entry ordering, packed-table sums,
//! string table limits), failing with the specific violated invariant.

use std::{fmt, io::{BufRead, Read}, iter::FusedIterator, num::NonZero};

use bstr::{BStr, BString, ByteSlice};
use lru::LruCache;
use positioned_io::{ReadAt, Size};

use crate::{
    bisect_range_by,
    fsst::Decoder as FsstDecoder,
    metadata::{self, Error as MetadataError, Metadata, Schema, StringTable},
    section::{self, CompressAlgo, SectionReader, SectionType, HEADER_SIZE},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while opening or reading an archive.
pub struct Error(Box<ErrorInner>);

mod sealed {
    pub trait Sealed {}
}

#[derive(Debug)]
enum ErrorInner {
    Section(String, Option<section::Error>),
    MissingSection(SectionType),
    DuplicatedSection(SectionType),
    ParseMetadata(MetadataError),
    Corrupt(&'static str),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Section(msg, Some(err)) => write!(f, "{msg}: {err}"),
            ErrorInner::Section(msg, None) => write!(f, "{msg}"),
            ErrorInner::MissingSection(ty) => write!(f, "missing section {ty:?}"),
            ErrorInner::DuplicatedSection(ty) => write!(f, "duplicated sections {ty:?}"),
            ErrorInner::ParseMetadata(err) => write!(f, "failed to parse metadata: {err}"),
            ErrorInner::Corrupt(why) => write!(f, "corrupt metadata: {why}"),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Section(_, Some(err)) => Some(err),
            ErrorInner::Io(err) => Some(err),
            ErrorInner::ParseMetadata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

// Needed for the `Read` impl of `ChunksReader`.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, section::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        self.map_err(|err| ErrorInner::Section(msg.to_string(), Some(err)).into())
    }
}

trait OptionExt<T> {
    fn context(self, msg: &'static str) -> Result<T>;
}
impl<T> OptionExt<T> for Option<T> {
    #[inline]
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(ErrorInner::Corrupt(msg).into()),
        }
    }
}

trait BoolExt {
    fn or_context(self, msg: &'static str) -> Result<()>;
}
impl BoolExt for bool {
    #[inline]
    fn or_context(self, msg: &'static str) -> Result<()> {
        if self {
            Ok(())
        } else {
            Err(ErrorInner::Corrupt(msg).into())
        }
    }
}

// File type bits of `st_mode`, stored platform-agnostically on disk.
const S_IFMT: u32 = 0o170_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

/// The partition rank of a file mode: directories, symlinks, regular files,
/// devices, then everything else.
pub(crate) fn mode_rank(mode: u32) -> usize {
    match mode & S_IFMT {
        S_IFDIR => 0,
        S_IFLNK => 1,
        S_IFREG => 2,
        S_IFBLK | S_IFCHR => 3,
        _ => 4,
    }
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct Config {
    metadata_schema_size_limit: usize,
    metadata_size_limit: usize,
    block_cache_size_limit: usize,
    check_consistency: bool,
    enable_nlink: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_schema_size_limit: 1 << 20,
            metadata_size_limit: 64 << 20,
            // 32 x 16MiB blocks.
            block_cache_size_limit: 512 << 20,
            check_consistency: true,
            enable_nlink: false,
        }
    }
}

impl Config {
    pub fn metadata_schema_size_limit(mut self, limit: usize) -> Self {
        self.metadata_schema_size_limit = limit;
        self
    }

    pub fn metadata_size_limit(mut self, limit: usize) -> Self {
        self.metadata_size_limit = limit;
        self
    }

    pub fn block_cache_size_limit(mut self, limit: usize) -> Self {
        self.block_cache_size_limit = limit;
        self
    }

    /// Run the full invariant suite on open. Defaults to `true`.
    pub fn check_consistency(mut self, yes: bool) -> Self {
        self.check_consistency = yes;
        self
    }

    /// Derive hardlink counts from the entry table, and report deduplicated
    /// sizes in [`ArchiveIndex::statvfs`]. Defaults to `false`.
    pub fn enable_nlink(mut self, yes: bool) -> Self {
        self.enable_nlink = yes;
        self
    }
}

/// `statvfs(2)`-shaped totals of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Statvfs {
    /// The block size in bytes.
    pub block_size: u32,
    /// The fragment size; always 1, sizes below are in bytes.
    pub frag_size: u32,
    /// Total data size in bytes. With [`Config::enable_nlink`] this is the
    /// hardlink-deduplicated total, otherwise hardlinked bytes count once per
    /// link.
    pub blocks: u64,
    /// Number of inodes.
    pub files: u64,
    /// Maximum file name length.
    pub name_max: u32,
    /// Always true; images cannot be written to.
    pub read_only: bool,
}

/// Pre-computed inode partition boundaries.
#[derive(Debug, Default)]
struct InodeTally {
    /// The number of unique regular files.
    unique_cnt: u32,

    // ..directories..
    symlink_start: u32,
    // ..symlinks..
    unique_start: u32,
    // ..unique regular files..
    shared_start: u32,
    // ..shared regular files..
    device_start: u32,
    // ..devices..
    ipc_start: u32,
    // ..pipes and sockets..
    inode_cnt: u32,
}

/// The parsed, unpacked and validated index of an archive.
pub struct ArchiveIndex {
    /// Offsets of all `BLOCK` sections, in block index order.
    block_offsets: Box<[u64]>,
    metadata: Metadata,

    mtime_only: bool,
    time_resolution: NonZero<u32>,
    timestamp_base_scaled: u64,
    tally: InodeTally,
    /// Per-inode link counts, present with [`Config::enable_nlink`].
    nlink: Option<Box<[u32]>>,
    total_hardlink_size: u64,
}

impl fmt::Debug for ArchiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveIndex")
            .field("blocks", &self.block_offsets.len())
            .field("inodes", &self.metadata.inodes.len())
            .field("tally", &self.tally)
            .finish_non_exhaustive()
    }
}

impl ArchiveIndex {
    /// Load and validate the index from a section reader.
    pub fn new<R: ReadAt + Size>(rdr: &mut SectionReader<R>) -> Result<Self> {
        Self::new_with_config(rdr, &Config::default())
    }

    /// Same as [`ArchiveIndex::new`] with a non-default [`Config`].
    pub fn new_with_config<R: ReadAt + Size>(
        rdr: &mut SectionReader<R>,
        config: &Config,
    ) -> Result<Self> {
        let stream_len = rdr
            .get_ref()
            .size()?
            .ok_or_else(|| ErrorInner::Section("cannot size the archive reader".into(), None))?;

        let sections = rdr
            .scan_sections(stream_len)
            .context("failed to scan sections")?;

        let block_offsets = sections
            .iter()
            .filter(|s| s.section_type == SectionType::BLOCK)
            .map(|s| s.offset)
            .collect::<Box<[u64]>>();
        u32::try_from(block_offsets.len())
            .ok()
            .context("too many block sections")?;

        let find_unique = |ty: SectionType| -> Result<u64> {
            let mut iter = sections
                .iter()
                .filter_map(|s| (s.section_type == ty).then_some(s.offset));
            let off = iter.next().ok_or(ErrorInner::MissingSection(ty))?;
            if iter.next().is_some() {
                bail!(ErrorInner::DuplicatedSection(ty));
            }
            Ok(off)
        };
        let schema_offset = find_unique(SectionType::METADATA_V2_SCHEMA)?;
        let metadata_offset = find_unique(SectionType::METADATA_V2)?;

        let metadata = {
            let (_, raw_schema) = rdr
                .read_section_at(schema_offset, config.metadata_schema_size_limit)
                .context("failed to read metadata schema section")?;
            let schema = Schema::parse(&raw_schema)
                .map_err(|err| ErrorInner::ParseMetadata(metadata::Error::from(err)))?;

            let (_, raw_metadata) = rdr
                .read_section_at(metadata_offset, config.metadata_size_limit)
                .context("failed to read metadata section")?;
            Metadata::parse(&schema, &raw_metadata).map_err(ErrorInner::ParseMetadata)?
        };

        let mut this = Self {
            block_offsets,
            metadata,
            mtime_only: false,
            time_resolution: NonZero::new(1).expect("1 is non-zero"),
            timestamp_base_scaled: 0,
            tally: InodeTally::default(),
            nlink: None,
            total_hardlink_size: 0,
        };
        this.unpack()?;
        this.validate()?;
        if config.check_consistency {
            this.check_consistency()?;
        }
        if config.enable_nlink {
            this.build_nlink();
        }
        Ok(this)
    }

    /// Reverse the packing transforms recorded in the options.
    fn unpack(&mut self) -> Result<()> {
        let m = &mut self.metadata;
        let opts = m.options.unwrap_or_default();

        self.mtime_only = opts.mtime_only;
        self.time_resolution = NonZero::new(opts.time_resolution_sec.unwrap_or(1))
            .context("invalid options.time_resolution_sec")?;
        self.timestamp_base_scaled = m
            .timestamp_base
            .checked_mul(self.time_resolution.get().into())
            .context("timestamp_base overflows")?;
        self.total_hardlink_size = m.total_hardlink_size.unwrap_or(0);

        if opts.packed_chunk_table {
            let mut sum = 0u32;
            for c in &mut m.chunk_table {
                sum = sum
                    .checked_add(*c)
                    .context("value overflow in packed chunk_table")?;
                *c = sum;
            }
            (m.chunk_table.last().copied().unwrap_or(0) == m.chunks.len() as u32)
                .or_context("packed chunk_table does not sum to the chunk count")?;
        }

        if opts.packed_directories {
            m.directories
                .iter()
                .all(|d| d.parent_entry == 0)
                .or_context("parent_entry set in packed directories")?;
            let mut sum = 0u32;
            for d in &mut m.directories {
                sum = sum
                    .checked_add(d.first_entry)
                    .context("value overflow in packed directories.first_entry")?;
                d.first_entry = sum;
            }
            (m.directories.last().map(|d| d.first_entry) == Some(m.dir_entries.len() as u32))
                .or_context("packed directories.first_entry does not sum to the entry count")?;

            // Recover parent links by walking the tree from the root's self
            // entry. Entry ranges are disjoint, so every entry is visited at
            // most once.
            let num_dirs = m.directories.len() - 1;
            let mut queue = std::collections::VecDeque::from([0u32]);
            while let Some(parent_ent) = queue.pop_front() {
                let p_ino = m
                    .dir_entries
                    .get(parent_ent as usize)
                    .context("entry index out of range in packed directories")?
                    .inode_num as usize;
                (p_ino < num_dirs)
                    .or_context("directory inode out of range in packed directories")?;
                let beg = m.directories[p_ino].first_entry;
                let end = m.directories[p_ino + 1].first_entry;
                for e in beg..end {
                    let e_ino = m.dir_entries[e as usize].inode_num;
                    if (e_ino as usize) < num_dirs && e != 0 {
                        m.directories[e_ino as usize].parent_entry = parent_ent;
                        queue.push_back(e);
                    }
                }
            }
        }

        if opts.packed_shared_files_table {
            if let Some(shared) = m.shared_files_table.take() {
                // Each packed value is a run length minus 2; the value of the
                // k-th run is k.
                let unpacked_len = shared
                    .iter()
                    .try_fold(0u64, |sum, &cnt| Some(sum + u64::from(cnt).checked_add(2)?))
                    .filter(|&n| n <= m.inodes.len() as u64)
                    .context("packed shared_files_table length explodes")?;
                let mut unpacked = Vec::with_capacity(unpacked_len as usize);
                for (run, &cnt) in shared.iter().enumerate() {
                    unpacked.extend(std::iter::repeat_n(run as u32, cnt as usize + 2));
                }
                m.shared_files_table = Some(unpacked);
            }
        }

        Self::unpack_string_table(&mut m.compact_names, "compact_names")?;
        Self::unpack_string_table(&mut m.compact_symlinks, "compact_symlinks")?;

        Ok(())
    }

    /// Normalize a compact string table: turn a packed (per-item length)
    /// index into cumulative offsets and decode the FSST buffer if present.
    fn unpack_string_table(tbl: &mut Option<StringTable>, what: &'static str) -> Result<()> {
        let Some(tbl) = tbl else { return Ok(()) };
        let buf_len = u32::try_from(tbl.buffer.len())
            .ok()
            .context("string table buffer too large")?;
        if tbl.packed_index {
            let mut offsets = Vec::with_capacity(tbl.index.len() + 1);
            let mut sum = 0u32;
            offsets.push(0);
            for &len in &tbl.index {
                sum = sum
                    .checked_add(len)
                    .filter(|&n| n <= buf_len)
                    .context("string table length overflow")?;
                offsets.push(sum);
            }
            tbl.index = offsets;
            tbl.packed_index = false;
        } else {
            (!tbl.index.is_empty() && tbl.index[0] == 0)
                .or_context("string table index must start at 0")?;
            tbl.index
                .is_sorted()
                .or_context("string table index is not sorted")?;
        }
        (tbl.index.last().copied() == Some(buf_len))
            .or_context("string table buffer size mismatch")?;

        if let Some(symtab) = tbl.symtab.take() {
            log::trace!("decoding FSST symtab for {what}");
            let decoder = FsstDecoder::parse(&symtab)
                .ok()
                .context("malformed string table symtab")?;
            let encoded = &tbl.buffer[..];
            let mut out_buf = Vec::with_capacity(encoded.len() * 2);
            let mut out_index = Vec::with_capacity(tbl.index.len());
            out_index.push(0u32);
            for w in tbl.index.windows(2) {
                let sym = &encoded[w[0] as usize..w[1] as usize];
                let start = out_buf.len();
                out_buf.resize(start + FsstDecoder::max_decode_len(sym.len()), 0);
                let len = decoder
                    .decode_into(sym, &mut out_buf[start..])
                    .ok()
                    .context("undecodable string table item")?;
                out_buf.truncate(start + len);
                let pos = u32::try_from(out_buf.len())
                    .ok()
                    .context("decoded string table too large")?;
                out_index.push(pos);
            }
            tbl.buffer = out_buf.into();
            tbl.index = out_index;
        }
        Ok(())
    }

    /// Bounds validation. Always runs; the typed views rely on it.
    fn validate(&mut self) -> Result<()> {
        let m = &self.metadata;

        (!m.inodes.is_empty()).or_context("empty inodes table")?;
        (!m.modes.is_empty()).or_context("empty modes table")?;
        (!m.dir_entries.is_empty()).or_context("empty dir_entries table")?;
        (m.directories.len() >= 2).or_context("missing root directory")?;
        (!m.chunk_table.is_empty()).or_context("empty chunk_table table")?;

        let block_size = m.block_size;
        (block_size >= 1 && block_size.is_power_of_two()).or_context("invalid block_size")?;

        //// Partition tally, derived from table sizes. ////

        let dir_cnt = m.directories.len() - 1;
        let file_store_cnt = (m.chunk_table.len() - 1) as u32;
        let symlink_cnt = m.symlink_table.len();
        let device_cnt = m.devices.as_ref().map_or(0, |t| t.len());
        let inode_cnt = m.inodes.len();
        let shared_cnt = m.shared_files_table.as_ref().map_or(0, |v| v.len());
        let shared_store_cnt = match m.shared_files_table.as_ref() {
            Some(v) => {
                v.is_sorted()
                    .or_context("shared_files_table is not sorted")?;
                match v.last() {
                    Some(&max) => max
                        .checked_add(1)
                        .context("index overflow in shared_files_table")?,
                    None => 0,
                }
            }
            None => 0,
        };
        let unique_cnt = file_store_cnt
            .checked_sub(shared_store_cnt)
            .context("more shared file classes than chunk table rows")?;

        let unique_start = dir_cnt + symlink_cnt;
        let shared_start = unique_start + unique_cnt as usize;
        let device_start = shared_start + shared_cnt;
        let ipc_start = device_start + device_cnt;
        (ipc_start <= inode_cnt).or_context("inodes table too short for the partition")?;

        self.tally = InodeTally {
            unique_cnt,
            symlink_start: dir_cnt as u32,
            unique_start: unique_start as u32,
            shared_start: shared_start as u32,
            device_start: device_start as u32,
            ipc_start: ipc_start as u32,
            inode_cnt: inode_cnt as u32,
        };

        //// Index ranges. ////

        macro_rules! check {
            ($cond:expr, $msg:literal) => {
                $cond.or_context(concat!("index out of range in ", $msg))?
            };
        }

        let blocks = self.block_offsets.len() as u32;
        for c in &m.chunks {
            check!(c.block < blocks, "chunks.block");
            c.offset
                .checked_add(c.size)
                .filter(|&end| end <= block_size && c.offset < block_size)
                .context("chunk range outside of its block")?;
        }

        let entries = m.dir_entries.len() as u32;
        for d in &m.directories {
            check!(d.first_entry <= entries, "directories.first_entry");
            check!(d.parent_entry < entries, "directories.parent_entry");
        }
        m.directories
            .windows(2)
            .all(|w| w[0].first_entry <= w[1].first_entry)
            .or_context("directories.first_entry is not sorted")?;
        (m.directories.last().map(|d| d.first_entry) == Some(entries))
            .or_context("directories is missing the sentinel")?;

        let uids = m.uids.len() as u32;
        let gids = m.gids.len() as u32;
        let modes = m.modes.len() as u32;
        let check_time = |off: u32, msg: &'static str| {
            u64::from(off)
                .checked_mul(self.time_resolution.get().into())
                .and_then(|x| x.checked_add(self.timestamp_base_scaled))
                .context(msg)
                .map(drop)
        };
        for ino in &m.inodes {
            check!(ino.mode_index < modes, "inodes.mode_index");
            check!(ino.owner_index < uids, "inodes.owner_index");
            check!(ino.group_index < gids, "inodes.group_index");
            check_time(ino.mtime_offset, "inodes.mtime_offset overflows")?;
            if self.mtime_only {
                (ino.atime_offset == 0 && ino.ctime_offset == 0)
                    .or_context("inodes.{a,c}time_offset set with options.mtime_only")?;
            } else {
                check_time(ino.atime_offset, "inodes.atime_offset overflows")?;
                check_time(ino.ctime_offset, "inodes.ctime_offset overflows")?;
            }
        }

        let chunks = m.chunks.len() as u32;
        m.chunk_table
            .is_sorted()
            .or_context("chunk_table is not sorted")?;
        for &c in &m.chunk_table {
            check!(c <= chunks, "chunk_table");
        }
        (m.chunk_table.last().copied() == Some(chunks))
            .or_context("chunk_table is missing the sentinel")?;

        let num_names = Self::string_table_len(&m.names, &m.compact_names);
        (m.compact_names.is_none() || m.names.is_empty())
            .or_context("names must be empty when compact_names is used")?;
        (m.compact_symlinks.is_none() || m.symlinks.is_empty())
            .or_context("symlinks must be empty when compact_symlinks is used")?;

        let symlink_targets = Self::string_table_len(&m.symlinks, &m.compact_symlinks);
        for &i in &m.symlink_table {
            check!((i as usize) < symlink_targets, "symlink_table");
        }

        for ent in &m.dir_entries {
            check!(ent.inode_num < inode_cnt as u32, "dir_entries.inode_num");
            check!((ent.name_index as usize) < num_names || ent.name_index == 0,
                "dir_entries.name_index");
        }
        (m.dir_entries[0].inode_num == 0).or_context("entry 0 is not the root self entry")?;

        if let Some(v) = &m.shared_files_table {
            for &class in v {
                check!(class < shared_store_cnt, "shared_files_table");
            }
        }

        Ok(())
    }

    fn string_table_len(loose: &[BString], compact: &Option<StringTable>) -> usize {
        match compact {
            Some(tbl) => tbl.index.len().saturating_sub(1),
            None => loose.len(),
        }
    }

    /// The full invariant suite beyond plain bounds checking.
    fn check_consistency(&self) -> Result<()> {
        let m = &self.metadata;
        let t = &self.tally;

        // Inode partitioning: every inode's mode rank matches the partition
        // range it falls into.
        let bounds = [
            0,
            t.symlink_start,
            t.unique_start,
            t.device_start,
            t.ipc_start,
            t.inode_cnt,
        ];
        for (ino_num, ino) in m.inodes.iter().enumerate() {
            let rank = mode_rank(m.modes[ino.mode_index as usize]);
            let lo = bounds[rank];
            let hi = bounds[rank + 1];
            ((lo..hi).contains(&(ino_num as u32)))
                .or_context("inode kind does not match its partition range")?;
        }

        // Directory entry names are strictly ascending within a parent.
        for w in m.directories.windows(2) {
            let range = w[0].first_entry as usize..w[1].first_entry as usize;
            let entries = &m.dir_entries[range];
            entries
                .windows(2)
                .all(|e| self.name(e[0].name_index) < self.name(e[1].name_index))
                .or_context("directory entries are not sorted by name")?;
        }

        // Parent links: a child directory's parent_entry refers to the entry
        // of the directory that contains it.
        let num_dirs = t.symlink_start;
        for (d, w) in m.directories.windows(2).enumerate() {
            for e in w[0].first_entry..w[1].first_entry {
                let child = m.dir_entries[e as usize].inode_num;
                if child < num_dirs && e != 0 {
                    let pe = m.directories[child as usize].parent_entry;
                    (m.dir_entries[pe as usize].inode_num == d as u32)
                        .or_context("directory parent_entry is inconsistent")?;
                }
            }
        }

        // String table item length limits: names may expand 2x from a
        // 255-byte source under FSST, symlink targets are PATH_MAX bound.
        self.check_string_item_len(&m.names, &m.compact_names, 512, "over-long name")?;
        self.check_string_item_len(&m.symlinks, &m.compact_symlinks, 4096, "over-long symlink")?;

        Ok(())
    }

    fn check_string_item_len(
        &self,
        loose: &[BString],
        compact: &Option<StringTable>,
        max_len: u32,
        msg: &'static str,
    ) -> Result<()> {
        match compact {
            Some(tbl) => tbl
                .index
                .windows(2)
                .all(|w| w[1] - w[0] <= max_len)
                .or_context(msg),
            None => loose
                .iter()
                .all(|s| s.len() as u32 <= max_len)
                .or_context(msg),
        }
    }

    /// Count hard links per inode from the entry table.
    fn build_nlink(&mut self) {
        let mut nlink = vec![0u32; self.metadata.inodes.len()].into_boxed_slice();
        // Skip the root self entry.
        for ent in &self.metadata.dir_entries[1..] {
            nlink[ent.inode_num as usize] += 1;
        }
        nlink[0] = 1;
        self.nlink = Some(nlink);
    }

    fn name(&self, name_index: u32) -> &BStr {
        Self::get_from_string_table(&self.metadata.names, &self.metadata.compact_names, name_index)
    }

    fn get_from_string_table<'a>(
        loose: &'a [BString],
        compact: &'a Option<StringTable>,
        idx: u32,
    ) -> &'a BStr {
        match compact {
            Some(tbl) => {
                let start = tbl.index[idx as usize] as usize;
                let end = tbl.index[idx as usize + 1] as usize;
                BStr::new(&tbl.buffer[start..end])
            }
            None => BStr::new(&loose[idx as usize][..]),
        }
    }

    /// The root directory.
    pub fn root(&self) -> Dir<'_> {
        Dir {
            index: self,
            inode_num: 0,
        }
    }

    /// Resolve a `/`-free path component sequence from the root.
    pub fn get_path<I>(&self, path: I) -> Option<Inode<'_>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        path.into_iter()
            .try_fold(Inode::from(self.root()), |inode, name| {
                Some(inode.as_dir()?.get(name)?.inode())
            })
    }

    /// Iterate all inodes in inode number order.
    pub fn inodes(&self) -> impl ExactSizeIterator<Item = Inode<'_>> + '_ {
        (0..self.tally.inode_cnt).map(|inode_num| Inode {
            index: self,
            inode_num,
        })
    }

    /// Iterate all directories in inode number order.
    pub fn directories(&self) -> impl ExactSizeIterator<Item = Dir<'_>> + '_ {
        (0..self.tally.symlink_start).map(|inode_num| Dir {
            index: self,
            inode_num,
        })
    }

    /// Look up an inode by number.
    pub fn get_inode(&self, inode_num: u32) -> Option<Inode<'_>> {
        (inode_num < self.tally.inode_cnt).then_some(Inode {
            index: self,
            inode_num,
        })
    }

    /// Visit every directory entry in preorder, the root first with an empty
    /// path.
    pub fn walk<F: FnMut(&BStr, Inode<'_>)>(&self, mut f: F) {
        f(BStr::new(""), self.root().into());
        let mut path = BString::from("");
        let mut stack = vec![self.root().entries()];
        while let Some(iter) = stack.last_mut() {
            let Some(ent) = iter.next() else {
                if let Some(cut) = path.rfind_byte(b'/') {
                    path.truncate(cut);
                } else {
                    path.clear();
                }
                stack.pop();
                continue;
            };
            let prev_len = path.len();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(ent.name());
            f(BStr::new(&path), ent.inode());
            if let Some(dir) = ent.inode().as_dir() {
                stack.push(dir.entries());
            } else {
                path.truncate(prev_len);
            }
        }
    }

    /// Filesystem-wide totals.
    pub fn statvfs(&self) -> Statvfs {
        let m = &self.metadata;
        let blocks = if self.nlink.is_some() {
            m.total_fs_size
        } else {
            m.total_fs_size + self.total_hardlink_size
        };
        Statvfs {
            block_size: m.block_size,
            frag_size: 1,
            blocks,
            files: m.inodes.len() as u64,
            name_max: 255,
            read_only: true,
        }
    }

    /// The raw, unpacked metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Content access to an archive: a block cache over a random access source.
pub struct Archive<R: ?Sized> {
    /// Block index -> decompressed block content.
    cache: LruCache<u32, Vec<u8>>,
    block_size: u32,
    rdr: SectionReader<R>,
}

impl<R: ?Sized> fmt::Debug for Archive<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("block_size", &self.block_size)
            .field("cached_blocks", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + Size> Archive<R> {
    /// Open an archive, returning its index and the content reader.
    pub fn new(rdr: R) -> Result<(ArchiveIndex, Self)> {
        Self::new_with_config(rdr, &Config::default())
    }

    /// Same as [`Archive::new`] with a non-default [`Config`].
    pub fn new_with_config(rdr: R, config: &Config) -> Result<(ArchiveIndex, Self)> {
        let mut rdr = SectionReader::new(rdr);
        let index = ArchiveIndex::new_with_config(&mut rdr, config)?;
        let this = Self::new_with_index_and_config(rdr, &index, config)?;
        Ok((index, this))
    }

    /// Build the content reader for an already-loaded index.
    pub fn new_with_index_and_config(
        rdr: SectionReader<R>,
        index: &ArchiveIndex,
        config: &Config,
    ) -> Result<Self> {
        let block_size = index.metadata().block_size;
        let cache_len = NonZero::new(config.block_cache_size_limit / block_size as usize)
            .ok_or_else(|| {
                let msg = format!(
                    "block size {}B exceeds cache size limit {}B",
                    block_size, config.block_cache_size_limit,
                );
                ErrorInner::Section(msg, None)
            })?;
        Ok(Self {
            cache: LruCache::new(cache_len),
            block_size,
            rdr,
        })
    }
}

impl<R> Archive<R> {
    pub fn into_inner(self) -> R {
        self.rdr.into_inner()
    }
}

impl<R: ReadAt + ?Sized> Archive<R> {
    /// Decompress and cache a block if it is not cached yet.
    fn cache_block(&mut self, index: &ArchiveIndex, block_idx: u32) -> Result<()> {
        // `get` instead of `contains` to promote the block to MRU.
        if self.cache.get(&block_idx).is_some() {
            log::trace!("block {block_idx}: cache hit");
            return Ok(());
        }

        let section_offset = index.block_offsets[block_idx as usize];
        (|| {
            let header = self.rdr.read_header_at(section_offset)?;
            header.check_type(SectionType::BLOCK)?;

            // Reuse the evicted buffer when the cache is full.
            let mut buf = if self.cache.len() == self.cache.cap().get() {
                let (_, mut buf) = self.cache.pop_lru().expect("cache is full");
                buf.resize(self.block_size as usize, 0);
                buf
            } else {
                vec![0u8; self.block_size as usize]
            };
            let len =
                self.rdr
                    .read_payload_at_into(&header, section_offset + HEADER_SIZE, &mut buf)?;
            buf.truncate(len);
            self.cache.push(block_idx, buf);
            Ok(())
        })()
        .context(format_args!("failed to read block {block_idx}"))
    }

    /// Slice the most recently cached block.
    fn chunk_in_cache(&self, start: u32, end: u32) -> Result<&[u8]> {
        let (&block_idx, cached) = self.cache.iter().next().expect("cache is non-empty");
        cached.get(start as usize..end as usize).ok_or_else(
            #[cold]
            || {
                let msg = format!(
                    "block {block_idx} has only {} bytes but is referenced at {start}..{end}",
                    cached.len(),
                );
                ErrorInner::Section(msg, None).into()
            },
        )
    }

    /// The compression algorithm of a block section, straight from its
    /// header.
    pub fn block_compression(&mut self, index: &ArchiveIndex, block_idx: u32) -> Result<CompressAlgo> {
        let offset = *index
            .block_offsets
            .get(block_idx as usize)
            .context("block index out of range")?;
        let header = self
            .rdr
            .read_header_at(offset)
            .context("failed to read block header")?;
        Ok(header.compress_algo)
    }
}

/// An inode.
#[derive(Debug, Clone, Copy)]
pub struct Inode<'a> {
    index: &'a ArchiveIndex,
    inode_num: u32,
}

impl<'a> Inode<'a> {
    pub fn inode_num(&self) -> u32 {
        self.inode_num
    }

    /// Classify this inode by its partition range.
    pub fn classify(&self) -> InodeKind<'a> {
        let Self { index, inode_num } = *self;
        let t = &index.tally;
        if inode_num < t.symlink_start {
            InodeKind::Directory(Dir { index, inode_num })
        } else if inode_num < t.unique_start {
            let symlink_idx = inode_num - t.symlink_start;
            InodeKind::Symlink(Symlink { index, symlink_idx })
        } else if inode_num < t.shared_start {
            let file_idx = inode_num - t.unique_start;
            InodeKind::File(File::Unique(UniqueFile { index, file_idx }))
        } else if inode_num < t.device_start {
            let shared_idx = inode_num - t.shared_start;
            InodeKind::File(File::Shared(SharedFile { index, shared_idx }))
        } else if inode_num < t.ipc_start {
            let device_idx = inode_num - t.device_start;
            InodeKind::Device(Device { index, device_idx })
        } else {
            InodeKind::Ipc(Ipc { index, inode_num })
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.classify(), InodeKind::Directory(_))
    }

    pub fn as_dir(&self) -> Option<Dir<'a>> {
        match self.classify() {
            InodeKind::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<File<'a>> {
        match self.classify() {
            InodeKind::File(f) => Some(f),
            _ => None,
        }
    }

    /// The apparent size in bytes: chunk sum for files, target length for
    /// symlinks, zero otherwise.
    pub fn size(&self) -> u64 {
        match self.classify() {
            InodeKind::File(f) => f.as_chunks().total_size(),
            InodeKind::Symlink(l) => l.target().len() as u64,
            _ => 0,
        }
    }

    /// Project the `stat`-like metadata of this inode.
    pub fn metadata(&self) -> InodeMetadata<'a> {
        InodeMetadata {
            index: self.index,
            inode_num: self.inode_num,
            data: self.index.metadata().inodes[self.inode_num as usize],
        }
    }
}

/// An inode classified by kind.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum InodeKind<'a> {
    Directory(Dir<'a>),
    Symlink(Symlink<'a>),
    File(File<'a>),
    Device(Device<'a>),
    Ipc(Ipc<'a>),
}

impl<'a> From<InodeKind<'a>> for Inode<'a> {
    fn from(i: InodeKind<'a>) -> Self {
        match i {
            InodeKind::Directory(i) => i.into(),
            InodeKind::Symlink(i) => i.into(),
            InodeKind::File(i) => i.into(),
            InodeKind::Device(i) => i.into(),
            InodeKind::Ipc(i) => i.into(),
        }
    }
}

/// The `stat`-like projection of one inode row.
#[derive(Debug)]
pub struct InodeMetadata<'a> {
    index: &'a ArchiveIndex,
    inode_num: u32,
    data: metadata::InodeData,
}

impl InodeMetadata<'_> {
    /// The full mode including the file type bits.
    pub fn mode(&self) -> u32 {
        self.index.metadata().modes[self.data.mode_index as usize]
    }

    /// The file type bits of the mode.
    pub fn file_type_bits(&self) -> u32 {
        self.mode() & S_IFMT
    }

    /// The permission bits of the mode.
    pub fn permission_bits(&self) -> u32 {
        self.mode() & !S_IFMT
    }

    pub fn uid(&self) -> u32 {
        self.index.metadata().uids[self.data.owner_index as usize]
    }

    pub fn gid(&self) -> u32 {
        self.index.metadata().gids[self.data.group_index as usize]
    }

    fn cvt_time(&self, off: u32) -> u64 {
        self.index.timestamp_base_scaled
            + u64::from(off) * u64::from(self.index.time_resolution.get())
    }

    /// Modification time in seconds since the UNIX epoch.
    pub fn mtime(&self) -> u64 {
        self.cvt_time(self.data.mtime_offset)
    }

    /// Access time. Falls back to [`InodeMetadata::mtime`] when the image
    /// stores mtime only.
    pub fn atime(&self) -> u64 {
        if self.index.mtime_only {
            self.mtime()
        } else {
            self.cvt_time(self.data.atime_offset)
        }
    }

    /// Change time. Falls back to [`InodeMetadata::mtime`] when the image
    /// stores mtime only.
    pub fn ctime(&self) -> u64 {
        if self.index.mtime_only {
            self.mtime()
        } else {
            self.cvt_time(self.data.ctime_offset)
        }
    }

    /// The number of hard links. Requires [`Config::enable_nlink`],
    /// otherwise 1.
    pub fn nlink(&self) -> u32 {
        match &self.index.nlink {
            Some(tbl) => tbl[self.inode_num as usize].max(1),
            None => 1,
        }
    }
}

/// A directory inode.
#[derive(Debug, Clone, Copy)]
pub struct Dir<'a> {
    index: &'a ArchiveIndex,
    inode_num: u32,
}

impl<'a> From<Dir<'a>> for Inode<'a> {
    fn from(Dir { index, inode_num }: Dir<'a>) -> Self {
        Self { index, inode_num }
    }
}

impl<'a> Dir<'a> {
    pub fn inode_num(&self) -> u32 {
        self.inode_num
    }

    fn entry_range(&self) -> (u32, u32) {
        let dirs = &self.index.metadata().directories;
        let ino = self.inode_num as usize;
        (dirs[ino].first_entry, dirs[ino + 1].first_entry)
    }

    /// Iterate the real entries of this directory in ascending name order,
    /// without the synthesized `.` and `..`.
    pub fn entries(&self) -> DirEntryIter<'a> {
        let (ent_start, ent_end) = self.entry_range();
        DirEntryIter {
            index: self.index,
            ent_start,
            ent_end,
        }
    }

    /// The number of entries including `.` and `..`.
    pub fn dir_size(&self) -> u32 {
        let (start, end) = self.entry_range();
        end - start + 2
    }

    /// The parent directory; the root is its own parent.
    pub fn parent(&self) -> Dir<'a> {
        let m = self.index.metadata();
        let pe = m.directories[self.inode_num as usize].parent_entry;
        Dir {
            index: self.index,
            inode_num: m.dir_entries[pe as usize].inode_num,
        }
    }

    /// List this directory like `readdir`, `.` and `..` first.
    pub fn read_dir(&self) -> ReadDirIter<'a> {
        ReadDirIter {
            dir: *self,
            pos: 0,
            entries: self.entries(),
        }
    }

    /// Binary-search an entry by name.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<DirEntry<'a>> {
        self.get_inner(name.as_ref())
    }

    fn get_inner(&self, name: &[u8]) -> Option<DirEntry<'a>> {
        let (ent_start, ent_end) = self.entry_range();
        let idx = bisect_range_by(ent_start as usize..ent_end as usize, |idx| {
            Ord::cmp(
                DirEntry::new(self.index, idx as u32).name().as_ref(),
                name,
            )
        })?;
        Some(DirEntry::new(self.index, idx as u32))
    }
}

/// Iterator of the real entries of one directory.
#[derive(Debug, Clone)]
pub struct DirEntryIter<'a> {
    index: &'a ArchiveIndex,
    ent_start: u32,
    ent_end: u32,
}

impl<'a> Iterator for DirEntryIter<'a> {
    type Item = DirEntry<'a>;

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.ent_end - self.ent_start) as usize;
        (len, Some(len))
    }

    fn next(&mut self) -> Option<Self::Item> {
        if self.ent_start < self.ent_end {
            let ent = DirEntry::new(self.index, self.ent_start);
            self.ent_start += 1;
            Some(ent)
        } else {
            None
        }
    }
}

impl DoubleEndedIterator for DirEntryIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.ent_start < self.ent_end {
            self.ent_end -= 1;
            Some(DirEntry::new(self.index, self.ent_end))
        } else {
            None
        }
    }
}

impl ExactSizeIterator for DirEntryIter<'_> {}
impl FusedIterator for DirEntryIter<'_> {}

/// Iterator over a full `readdir` listing including `.` and `..`.
#[derive(Debug, Clone)]
pub struct ReadDirIter<'a> {
    dir: Dir<'a>,
    pos: u32,
    entries: DirEntryIter<'a>,
}

impl<'a> Iterator for ReadDirIter<'a> {
    type Item = (&'a BStr, Inode<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.pos {
            0 => (BStr::new("."), self.dir.into()),
            1 => (BStr::new(".."), self.dir.parent().into()),
            _ => {
                let ent = self.entries.next()?;
                (ent.name(), ent.inode())
            }
        };
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = 2u32.saturating_sub(self.pos) as usize + self.entries.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for ReadDirIter<'_> {}
impl FusedIterator for ReadDirIter<'_> {}

/// An entry in a directory.
#[derive(Debug)]
pub struct DirEntry<'a> {
    index: &'a ArchiveIndex,
    data: metadata::DirEntry,
}

impl<'a> DirEntry<'a> {
    fn new(index: &'a ArchiveIndex, ent_idx: u32) -> Self {
        Self {
            index,
            data: index.metadata().dir_entries[ent_idx as usize],
        }
    }

    pub fn name(&self) -> &'a BStr {
        let m = self.index.metadata();
        ArchiveIndex::get_from_string_table(&m.names, &m.compact_names, self.data.name_index)
    }

    pub fn inode(&self) -> Inode<'a> {
        Inode {
            index: self.index,
            inode_num: self.data.inode_num,
        }
    }
}

/// A symlink inode.
#[derive(Debug, Clone, Copy)]
pub struct Symlink<'a> {
    index: &'a ArchiveIndex,
    symlink_idx: u32,
}

impl<'a> From<Symlink<'a>> for Inode<'a> {
    fn from(i: Symlink<'a>) -> Self {
        Self {
            index: i.index,
            inode_num: i.index.tally.symlink_start + i.symlink_idx,
        }
    }
}

impl<'a> Symlink<'a> {
    /// The link target.
    pub fn target(&self) -> &'a BStr {
        let m = self.index.metadata();
        let tgt_idx = m.symlink_table[self.symlink_idx as usize];
        ArchiveIndex::get_from_string_table(&m.symlinks, &m.compact_symlinks, tgt_idx)
    }
}

/// A character or block device inode.
#[derive(Debug, Clone, Copy)]
pub struct Device<'a> {
    index: &'a ArchiveIndex,
    device_idx: u32,
}

impl<'a> From<Device<'a>> for Inode<'a> {
    fn from(i: Device<'a>) -> Self {
        Self {
            index: i.index,
            inode_num: i.index.tally.device_start + i.device_idx,
        }
    }
}

impl Device<'_> {
    /// The device id (`st_rdev`).
    pub fn device_id(&self) -> u64 {
        self.index.metadata().devices.as_ref().expect("validated")[self.device_idx as usize]
    }
}

/// A pipe or socket inode.
#[derive(Debug, Clone, Copy)]
pub struct Ipc<'a> {
    index: &'a ArchiveIndex,
    inode_num: u32,
}

impl<'a> From<Ipc<'a>> for Inode<'a> {
    fn from(Ipc { index, inode_num }: Ipc<'a>) -> Self {
        Self { index, inode_num }
    }
}

/// A regular file inode.
#[derive(Debug, Clone, Copy)]
pub enum File<'a> {
    /// The sole inode of its content class.
    Unique(UniqueFile<'a>),
    /// One of several inodes sharing a content class.
    Shared(SharedFile<'a>),
}

impl<'a> From<File<'a>> for Inode<'a> {
    fn from(f: File<'a>) -> Self {
        match f {
            File::Unique(f) => f.into(),
            File::Shared(f) => f.into(),
        }
    }
}

impl sealed::Sealed for File<'_> {}
impl<'a> AsChunks<'a> for File<'a> {
    fn as_chunks(&self) -> ChunkIter<'a> {
        match self {
            File::Unique(f) => f.as_chunks(),
            File::Shared(f) => f.as_chunks(),
        }
    }
}

fn chunk_iter_for_store_idx(index: &ArchiveIndex, store_idx: u32) -> ChunkIter<'_> {
    let tbl = &index.metadata().chunk_table;
    ChunkIter {
        index,
        chunk_start: tbl[store_idx as usize],
        chunk_end: tbl[store_idx as usize + 1],
    }
}

/// A regular file inode with unique content.
#[derive(Debug, Clone, Copy)]
pub struct UniqueFile<'a> {
    index: &'a ArchiveIndex,
    file_idx: u32,
}

impl<'a> From<UniqueFile<'a>> for Inode<'a> {
    fn from(i: UniqueFile<'a>) -> Self {
        Self {
            index: i.index,
            inode_num: i.index.tally.unique_start + i.file_idx,
        }
    }
}

impl sealed::Sealed for UniqueFile<'_> {}
impl<'a> AsChunks<'a> for UniqueFile<'a> {
    fn as_chunks(&self) -> ChunkIter<'a> {
        chunk_iter_for_store_idx(self.index, self.file_idx)
    }
}

/// A regular file inode sharing content with other inodes.
#[derive(Debug, Clone, Copy)]
pub struct SharedFile<'a> {
    index: &'a ArchiveIndex,
    shared_idx: u32,
}

impl<'a> From<SharedFile<'a>> for Inode<'a> {
    fn from(i: SharedFile<'a>) -> Self {
        Self {
            index: i.index,
            inode_num: i.index.tally.shared_start + i.shared_idx,
        }
    }
}

impl sealed::Sealed for SharedFile<'_> {}
impl<'a> AsChunks<'a> for SharedFile<'a> {
    fn as_chunks(&self) -> ChunkIter<'a> {
        let m = self.index.metadata();
        let class = m.shared_files_table.as_ref().expect("validated")[self.shared_idx as usize];
        chunk_iter_for_store_idx(self.index, self.index.tally.unique_cnt + class)
    }
}

/// Iterator over the chunks of a file.
#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    index: &'a ArchiveIndex,
    chunk_start: u32,
    chunk_end: u32,
}

impl ChunkIter<'_> {
    /// The byte sum of all remaining chunks.
    pub fn total_size(&self) -> u64 {
        self.clone().map(|c| u64::from(c.size())).sum()
    }
}

impl sealed::Sealed for ChunkIter<'_> {}
impl<'a> AsChunks<'a> for ChunkIter<'a> {
    fn as_chunks(&self) -> ChunkIter<'a> {
        self.clone()
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Chunk<'a>;

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.chunk_end - self.chunk_start) as usize;
        (len, Some(len))
    }

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk_start < self.chunk_end {
            let c = Chunk::new(self.index, self.chunk_start);
            self.chunk_start += 1;
            Some(c)
        } else {
            None
        }
    }
}

impl DoubleEndedIterator for ChunkIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.chunk_start < self.chunk_end {
            self.chunk_end -= 1;
            Some(Chunk::new(self.index, self.chunk_end))
        } else {
            None
        }
    }
}

impl ExactSizeIterator for ChunkIter<'_> {}
impl FusedIterator for ChunkIter<'_> {}

/// One chunk of a file: a byte slice of one block.
#[derive(Debug, Clone)]
pub struct Chunk<'a> {
    index: &'a ArchiveIndex,
    data: metadata::Chunk,
    chunk_idx: u32,
}

impl<'a> Chunk<'a> {
    fn new(index: &'a ArchiveIndex, chunk_idx: u32) -> Self {
        Self {
            data: index.metadata().chunks[chunk_idx as usize],
            index,
            chunk_idx,
        }
    }

    pub fn block_idx(&self) -> u32 {
        self.data.block
    }

    pub fn offset(&self) -> u32 {
        self.data.offset
    }

    pub fn size(&self) -> u32 {
        self.data.size
    }

    /// Read this chunk through the archive's block cache.
    pub fn read_cached<'b, R: ReadAt + ?Sized>(
        &self,
        archive: &'b mut Archive<R>,
    ) -> Result<&'b [u8]> {
        archive.cache_block(self.index, self.block_idx())?;
        // Chunk ranges are validated on open.
        archive.chunk_in_cache(self.offset(), self.offset() + self.size())
    }
}

impl sealed::Sealed for Chunk<'_> {}
impl<'a> AsChunks<'a> for Chunk<'a> {
    fn as_chunks(&self) -> ChunkIter<'a> {
        ChunkIter {
            index: self.index,
            chunk_start: self.chunk_idx,
            chunk_end: self.chunk_idx + 1,
        }
    }
}

/// Data-bearing objects: [`File`]s and [`Chunk`]s.
///
/// Regular files are concatenations of chunks. This trait gives sequential
/// access via [`AsChunks::as_reader`] and positional access via
/// [`AsChunks::read_at`].
pub trait AsChunks<'a>: Sized + sealed::Sealed {
    /// Iterate over all chunks this object consists of.
    fn as_chunks(&self) -> ChunkIter<'a>;

    /// A [`Read`]/[`BufRead`] over the concatenation of all chunks.
    ///
    /// `self` and `archive` must come from the same image, or the result is
    /// unspecified (garbage data or an error, never UB).
    fn as_reader<'b, R: ?Sized>(&self, archive: &'b mut Archive<R>) -> ChunksReader<'a, 'b, R> {
        ChunksReader {
            archive,
            chunks: self.as_chunks(),
            in_block_offset: 0,
            chunk_rest: 0,
        }
    }

    /// Read all content into a `Vec`.
    fn read_to_vec<R: ReadAt + ?Sized>(&self, archive: &mut Archive<R>) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.as_reader(archive).read_to_end(&mut out)?;
        Ok(out)
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`, honoring
    /// chunk boundaries exactly. Returns the number of bytes read, which is
    /// short only at end of file.
    fn read_at<R: ReadAt + ?Sized>(
        &self,
        archive: &mut Archive<R>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut chunks = self.as_chunks();
        let mut skip = offset;
        let mut out_pos = 0usize;
        for chunk in &mut chunks {
            if out_pos == buf.len() {
                break;
            }
            let chunk_size = u64::from(chunk.size());
            if skip >= chunk_size {
                skip -= chunk_size;
                continue;
            }
            let bytes = chunk.read_cached(archive)?;
            let avail = &bytes[skip as usize..];
            skip = 0;
            let n = avail.len().min(buf.len() - out_pos);
            buf[out_pos..out_pos + n].copy_from_slice(&avail[..n]);
            out_pos += n;
        }
        Ok(out_pos)
    }
}

/// Reader returned by [`AsChunks::as_reader`].
#[derive(Debug)]
pub struct ChunksReader<'a, 'b, R: ?Sized> {
    chunks: ChunkIter<'a>,
    in_block_offset: u32,
    chunk_rest: u32,
    archive: &'b mut Archive<R>,
}

impl<R: ?Sized> ChunksReader<'_, '_, R> {
    /// The total number of bytes left to read.
    pub fn total_size(&self) -> u64 {
        self.chunks.total_size() + u64::from(self.chunk_rest)
    }
}

impl<R: ReadAt + ?Sized> Read for ChunksReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let cached = self.fill_buf()?;
        let len = cached.len().min(buf.len());
        buf[..len].copy_from_slice(&cached[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl<R: ReadAt + ?Sized> BufRead for ChunksReader<'_, '_, R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        if self.chunk_rest == 0 {
            let Some(chunk) = self.chunks.next() else {
                return Ok(&[]);
            };
            self.in_block_offset = chunk.offset();
            self.chunk_rest = chunk.size();
            self.archive.cache_block(chunk.index, chunk.block_idx())?;
        }
        let bytes = self
            .archive
            .chunk_in_cache(self.in_block_offset, self.in_block_offset + self.chunk_rest)?;
        Ok(bytes)
    }

    fn consume(&mut self, amt: usize) {
        assert!(amt <= self.chunk_rest as usize);
        self.in_block_offset += amt as u32;
        self.chunk_rest -= amt as u32;
    }
}
