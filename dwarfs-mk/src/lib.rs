//! Building [DwarFS][dwarfs] images: scanning an input tree, deduplicating
//! and segmenting file content into compressed blocks, and freezing the
//! metadata, on top of the [`dwarfs-img`][dwarfs_img] crate.
//!
//! [dwarfs]: https://github.com/mhx/dwarfs
//!
//! The entry point is [`scanner::Scanner`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use dwarfs_mk::{
//!     options::{BlockManagerConfig, ScannerOptions},
//!     os::RealOs,
//!     progress::Progress,
//!     scanner::Scanner,
//!     writer::{CompressParam, ImageWriter},
//! };
//!
//! # fn work() -> dwarfs_mk::Result<()> {
//! let out = std::fs::File::create("out.dwarfs")?;
//! let scanner = Scanner::new(BlockManagerConfig::default(), ScannerOptions::default())?;
//! let progress = Arc::new(Progress::default());
//! let writer = ImageWriter::new(out, CompressParam::default(), &progress)?;
//! scanner.scan(
//!     Arc::new(RealOs),
//!     "/usr/share/doc".as_ref(),
//!     writer,
//!     &progress,
//!     None,
//! )?;
//! # Ok(()) }
//! ```
//!
//! ## Cargo features
//!
//! - `zstd`, `lzma`, `lz4`, `brotli` *(only `zstd` is enabled by default)*
//!
//!   Enable the corresponding block compression algorithms.
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;

pub mod block_manager;
pub mod entry;
pub mod file_scanner;
pub mod global_data;
pub mod inode_manager;
pub mod options;
pub mod os;
pub mod progress;
pub mod scanner;
pub mod string_table;
pub mod workers;
pub mod writer;

pub use self::error::{Error, Result};
pub(crate) use self::error::ErrorInner;
