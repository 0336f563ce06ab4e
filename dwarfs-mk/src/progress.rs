//! Atomic build counters.
//!
//! A [`Progress`] is shared between the scanner, the file scan workers, the
//! block manager and the image writer. All fields are monotonic counters
//! except the two `*_queue` gauges, which track the current pipeline
//! backlog.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        /// Build progress counters, updated with relaxed atomics.
        #[derive(Debug, Default)]
        pub struct Progress {
            $($(#[$meta])* pub $name: AtomicU64,)*
        }

        impl Progress {
            /// Snapshot all counters for logging.
            pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name.load(Relaxed)),)*]
            }
        }
    };
}

counters! {
    /// Regular file entries seen, hardlinks included.
    files_found,
    /// Regular file entries whose content was digested.
    files_scanned,
    dirs_found,
    dirs_scanned,
    symlinks_found,
    symlinks_scanned,
    /// Devices, pipes and sockets that were included.
    specials_found,
    /// File entries whose content equals an earlier file's.
    duplicate_files,
    /// File entries folded into an earlier inode by `(dev, ino)` identity.
    hardlinks,
    /// Bytes of all hardlinked entries beyond the first of each group.
    hardlink_size,
    /// Non-fatal errors: unreadable files and directories.
    errors,
    /// Total regular file bytes, one count per inode.
    original_size,
    /// Total symlink target bytes.
    symlink_size,
    /// Bytes not stored thanks to duplicate-content folding.
    saved_by_deduplication,
    /// Bytes not stored thanks to segment matching.
    saved_by_segmentation,
    /// Content inodes handed to the block manager.
    inodes_written,
    blocks_written,
    chunk_count,
    /// Compressed bytes written to the image, headers included.
    compressed_size,
    /// Gauge: inodes queued for blockifying.
    blockify_queue,
    /// Gauge: blocks queued for compression.
    compress_queue,
}

/// Shorthands so call sites do not repeat the memory ordering.
pub trait Counter {
    fn bump(&self);
    fn add(&self, n: u64);
    fn get(&self) -> u64;
    fn put(&self, n: u64);
}

impl Counter for AtomicU64 {
    #[inline]
    fn bump(&self) {
        self.fetch_add(1, Relaxed);
    }

    #[inline]
    fn add(&self, n: u64) {
        self.fetch_add(n, Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.load(Relaxed)
    }

    #[inline]
    fn put(&self, n: u64) {
        self.store(n, Relaxed);
    }
}
