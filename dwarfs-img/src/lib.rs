//! Reading and decoding of [DwarFS][dwarfs] images.
//!
//! A DwarFS image is a read-only compressed filesystem. This crate covers the
//! on-disk container ([`section`]), the frozen metadata encoding
//! ([`metadata`]) and the high-level read path ([`archive`]): path lookup,
//! directory listing, `stat`-like metadata projection and file content reads
//! against an immutable random-access source.
//!
//! For building images, see the `dwarfs-mk` crate.
//!
//! [dwarfs]: https://github.com/mhx/dwarfs
//!
//! ## Cargo features
//!
//! - `zstd`, `lzma`, `lz4`, `brotli` *(only `zstd` is enabled by default)*
//!
//!   Enable decompression support for the corresponding section compression
//!   algorithms. Sections compressed with an unavailable algorithm fail with
//!   an error at read time.
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod archive;
pub mod fsst;
pub mod metadata;
pub mod section;

pub use positioned_io;
pub use zerocopy;

pub use archive::{
    Archive, ArchiveIndex, AsChunks, Device, Dir, DirEntry, Error, File, Inode, InodeKind,
    InodeMetadata, Ipc, Result, Statvfs, Symlink,
};

/// The (major, minor) filesystem format version this library reads and writes.
pub const FORMAT_VERSION: (u8, u8) = (2, 5);

use std::{cmp::Ordering, ops::Range};

/// Binary search over an index range with a custom probe.
///
/// Returns the index of an element comparing `Equal`, if any. The probed
/// range must be sorted with respect to `f` or the result is unspecified.
fn bisect_range_by<F>(range: Range<usize>, mut f: F) -> Option<usize>
where
    F: FnMut(usize) -> Ordering,
{
    let Range { start, end } = range;
    let mut lo = start;
    let mut hi = end;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match f(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}
