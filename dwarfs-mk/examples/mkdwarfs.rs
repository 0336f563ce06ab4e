//! A minimal `mkdwarfs`: build an image from a directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dwarfs_mk::options::{BlockManagerConfig, FileOrderMode, HashAlgorithm, ScannerOptions};
use dwarfs_mk::os::RealOs;
use dwarfs_mk::progress::{Counter, Progress};
use dwarfs_mk::scanner::Scanner;
use dwarfs_mk::writer::{CompressParam, ImageWriter};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Input directory.
    #[arg(short, long)]
    input: PathBuf,
    /// Output image.
    #[arg(short, long)]
    output: PathBuf,

    /// Overwrite the output if it exists.
    #[arg(short, long)]
    force: bool,

    /// Zstd compression level; 0 stores blocks uncompressed.
    #[arg(long, short = 'l', default_value_t = 10)]
    compress_level: i32,

    /// log2 of the block size.
    #[arg(long, default_value_t = 24)]
    block_size_bits: u32,

    /// Segmenter window in bytes; 0 disables segment matching.
    #[arg(long, default_value_t = 4096)]
    window_size: u32,

    /// Order file content by path instead of discovery order.
    #[arg(long)]
    path_order: bool,

    /// Include block/char devices.
    #[arg(long)]
    with_devices: bool,

    /// Include pipes and sockets.
    #[arg(long)]
    with_specials: bool,

    /// Keep atime and ctime in addition to mtime.
    #[arg(long)]
    keep_all_times: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli: Cli = clap::Parser::parse();
    let inst = Instant::now();

    let fout = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .create_new(!cli.force)
        .open(&cli.output)?;

    let config = BlockManagerConfig {
        block_size_bits: cli.block_size_bits,
        blockhash_window_size: cli.window_size,
    };
    let options = ScannerOptions {
        file_order: if cli.path_order {
            FileOrderMode::Path
        } else {
            FileOrderMode::None
        },
        file_hash_algorithm: Some(HashAlgorithm::Xxh3_128),
        with_devices: cli.with_devices,
        with_specials: cli.with_specials,
        keep_all_times: cli.keep_all_times,
        pack_chunk_table: true,
        pack_directories: true,
        pack_shared_files_table: true,
        pack_names: true,
        pack_symlinks: true,
        ..ScannerOptions::default()
    };
    #[cfg(feature = "zstd")]
    let compress = if cli.compress_level == 0 {
        CompressParam::None
    } else {
        CompressParam::Zstd(cli.compress_level)
    };
    #[cfg(not(feature = "zstd"))]
    let compress = CompressParam::None;

    let scanner = Scanner::new(config, options)?;
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(&fout, compress, &progress)?;
    scanner.scan(Arc::new(RealOs), &cli.input, writer, &progress, None)?;

    let original = progress.original_size.get();
    let compressed = progress.compressed_size.get();
    eprintln!(
        "{} files ({} dirs, {} symlinks), {} duplicates, {} errors",
        progress.files_found.get(),
        progress.dirs_found.get(),
        progress.symlinks_found.get(),
        progress.duplicate_files.get(),
        progress.errors.get(),
    );
    eprintln!(
        "completed in {:?}: {original} -> {compressed} bytes (ratio {:.2}%)",
        inst.elapsed(),
        compressed as f64 / original.max(1) as f64 * 100.0,
    );
    Ok(())
}
