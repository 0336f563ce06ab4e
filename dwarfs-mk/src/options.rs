//! Builder configuration.

use crate::os::EntryStat;

/// Block manager configuration.
#[derive(Debug, Clone)]
pub struct BlockManagerConfig {
    /// log2 of the block size. Must be at least 10.
    pub block_size_bits: u32,
    /// Rolling-hash window of the segmenter in bytes; 0 disables segment
    /// matching entirely.
    pub blockhash_window_size: u32,
}

impl Default for BlockManagerConfig {
    fn default() -> Self {
        Self {
            // 16 MiB blocks.
            block_size_bits: 24,
            blockhash_window_size: 4096,
        }
    }
}

impl BlockManagerConfig {
    pub fn block_size(&self) -> u32 {
        1 << self.block_size_bits
    }
}

/// The order in which file content is fed to the block manager.
///
/// Whatever the mode, the result is deterministic for a fixed input tree and
/// fixed options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOrderMode {
    /// Discovery order.
    #[default]
    None,
    /// Lexicographic by full path.
    Path,
    /// Ascending coarse content-similarity score, so that alike files end up
    /// adjacent.
    Similarity,
    /// Greedy nearest-neighbor chain over nilsimsa digests.
    Nilsimsa,
    /// A user-supplied total order, see [`BuildScript::order_files`].
    Script,
}

/// Content digest used for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Xxh3_128,
    Sha512_256,
}

impl HashAlgorithm {
    /// Parse a digest name as accepted by the `file_hash_algorithm` option.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xxh3-128" => Some(Self::Xxh3_128),
            "sha512" | "sha512-256" => Some(Self::Sha512_256),
            _ => None,
        }
    }
}

/// Scanner options. All fields are plain data; see the builder docs for the
/// exact effect of each packing flag.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub file_order: FileOrderMode,
    /// Content digest for duplicate-file folding. `None` disables
    /// duplicate detection entirely (hardlink folding still happens).
    pub file_hash_algorithm: Option<HashAlgorithm>,

    /// Include block and character devices.
    pub with_devices: bool,
    /// Include pipes and sockets.
    pub with_specials: bool,

    /// Override the owner of every entry.
    pub uid: Option<u32>,
    /// Override the group of every entry.
    pub gid: Option<u32>,
    /// Override all three timestamps of every entry.
    pub timestamp: Option<u64>,
    /// Store atime and ctime too; otherwise only mtime survives.
    pub keep_all_times: bool,
    /// Truncate timestamps to multiples of this many seconds.
    pub time_resolution_sec: u32,

    pub pack_chunk_table: bool,
    pub pack_directories: bool,
    pub pack_shared_files_table: bool,
    /// FSST-compress the name buffer.
    pub pack_names: bool,
    /// Store per-item lengths instead of cumulative offsets for names.
    pub pack_names_index: bool,
    /// FSST-compress the symlink target buffer.
    pub pack_symlinks: bool,
    /// Store per-item lengths instead of cumulative offsets for symlink
    /// targets.
    pub pack_symlinks_index: bool,
    /// Store names as a plain vector, bypassing the compact form.
    pub plain_names_table: bool,
    /// Store symlink targets as a plain vector, bypassing the compact form.
    pub plain_symlinks_table: bool,
    /// Apply FSST even when the heuristic predicts it will not pay off.
    /// Small tables usually lose to packing.
    pub force_pack_string_tables: bool,

    /// Drop directories that are (or become) empty after filtering.
    pub remove_empty_dirs: bool,

    /// Do not record a creation timestamp.
    pub no_create_timestamp: bool,
    /// Creation timestamp override; defaults to the current time.
    pub create_timestamp: Option<u64>,

    /// Number of file scan worker threads.
    pub workers: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            file_order: FileOrderMode::None,
            file_hash_algorithm: Some(HashAlgorithm::Xxh3_128),
            with_devices: false,
            with_specials: false,
            uid: None,
            gid: None,
            timestamp: None,
            keep_all_times: false,
            time_resolution_sec: 1,
            pack_chunk_table: false,
            pack_directories: false,
            pack_shared_files_table: false,
            pack_names: false,
            pack_names_index: false,
            pack_symlinks: false,
            pack_symlinks_index: false,
            plain_names_table: false,
            plain_symlinks_table: false,
            force_pack_string_tables: false,
            remove_empty_dirs: false,
            no_create_timestamp: false,
            create_timestamp: None,
            workers: 4,
        }
    }
}

/// A filter/transform/order hook, the builder-side "script".
///
/// The default implementations keep everything, change nothing and leave the
/// order alone.
pub trait BuildScript: Send + Sync {
    /// Whether [`BuildScript::filter`] should be consulted at all. Filters
    /// cannot be combined with a path list.
    fn has_filter(&self) -> bool {
        false
    }

    /// Return `false` to exclude the entry (and, for directories, its whole
    /// subtree).
    fn filter(&self, _entry: &FilterEntry<'_>) -> bool {
        true
    }

    /// Rewrite entry metadata in place, e.g. to normalize ownership.
    fn transform(&self, _stat: &mut EntryStat) {}

    /// Put the files into the desired block-packing order, for
    /// [`FileOrderMode::Script`].
    fn order_files(&self, _files: &mut [ScriptFile]) {}
}

/// The entry attributes a filter predicate can see.
#[derive(Debug, Clone, Copy)]
pub struct FilterEntry<'a> {
    /// The entry name.
    pub name: &'a str,
    /// The path relative to the scan root.
    pub path: &'a str,
    pub is_dir: bool,
    pub size: u64,
}

/// One file as seen by [`BuildScript::order_files`].
#[derive(Debug)]
pub struct ScriptFile {
    /// Path of the representative entry, relative to the scan root.
    pub path: String,
    pub size: u64,
    pub(crate) class_idx: u32,
}
