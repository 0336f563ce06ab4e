//! The image writer: section framing and block compression.
//!
//! Blocks are compressed on an order-preserving pool and hit the output
//! stream in submission order with sequential section numbers. A payload
//! that a codec fails to shrink is stored uncompressed with compression
//! type `NONE`, so incompressible blocks never grow the image.

use std::io::Write;
use std::num::NonZero;
use std::sync::Arc;

use dwarfs_img::section::{CompressAlgo, Header, SectionType, HEADER_SIZE};
use dwarfs_img::zerocopy::IntoBytes;

use crate::progress::{Counter, Progress};
use crate::workers::OrderedPool;
use crate::Result;

/// Block compression parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressParam {
    None,
    #[cfg(feature = "zstd")]
    Zstd(i32),
    #[cfg(feature = "lzma")]
    Lzma(u32),
    #[cfg(feature = "lz4")]
    Lz4,
    #[cfg(feature = "lz4")]
    Lz4Hc(i32),
    #[cfg(feature = "brotli")]
    Brotli(u32),
}

impl Default for CompressParam {
    fn default() -> Self {
        #[cfg(feature = "zstd")]
        {
            Self::Zstd(10)
        }
        #[cfg(not(feature = "zstd"))]
        {
            Self::None
        }
    }
}

/// Writes sections of one image to a sink.
pub struct ImageWriter<W> {
    w: W,
    compress: CompressParam,
    pool: OrderedPool<(CompressAlgo, Vec<u8>)>,
    sections_written: u32,
    blocks_submitted: u32,
    blocks_flushed: bool,
    progress: Arc<Progress>,
}

impl<W> std::fmt::Debug for ImageWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWriter")
            .field("sections_written", &self.sections_written)
            .field("blocks_submitted", &self.blocks_submitted)
            .finish_non_exhaustive()
    }
}

impl<W: Write> ImageWriter<W> {
    /// Create a writer over `w`, compressing blocks with `compress` on a
    /// small thread pool.
    pub fn new(w: W, compress: CompressParam, progress: &Arc<Progress>) -> Result<Self> {
        let threads = std::thread::available_parallelism()
            .map_or(2, NonZero::get)
            .min(8);
        let pool = OrderedPool::new(
            "compress",
            NonZero::new(threads).expect("at least one thread"),
            NonZero::new(threads * 2).expect("non-zero"),
        )?;
        Ok(Self {
            w,
            compress,
            pool,
            sections_written: 0,
            blocks_submitted: 0,
            blocks_flushed: false,
            progress: Arc::clone(progress),
        })
    }

    /// The index the next submitted block will get.
    pub fn block_count(&self) -> u32 {
        self.blocks_submitted
    }

    /// Blocks queued for compression but not yet written.
    pub fn queue_fill(&self) -> u64 {
        self.pool.in_flight() as u64
    }

    /// Queue one block for compression and write out whatever is ready.
    pub fn write_block(&mut self, data: Vec<u8>) -> Result<()> {
        assert!(!self.blocks_flushed, "blocks after metadata");
        self.blocks_submitted += 1;
        let param = self.compress;
        let ready = self.pool.submit(move || compress_payload(param, data));
        for payload in ready {
            self.emit(SectionType::BLOCK, payload)?;
        }
        self.progress.compress_queue.put(self.pool.in_flight() as u64);
        Ok(())
    }

    /// Wait for all queued blocks and write them out.
    pub fn flush_blocks(&mut self) -> Result<()> {
        if !self.blocks_flushed {
            self.blocks_flushed = true;
            for payload in self.pool.finish() {
                self.emit(SectionType::BLOCK, payload)?;
            }
            self.progress.compress_queue.put(0);
        }
        Ok(())
    }

    /// Write the metadata schema and data sections. Must be (and is) called
    /// after the last block.
    pub fn write_metadata_sections(&mut self, schema: &[u8], metadata: &[u8]) -> Result<()> {
        self.flush_blocks()?;
        let param = self.compress;
        let schema_payload = compress_payload(param, schema.to_vec());
        self.emit(SectionType::METADATA_V2_SCHEMA, schema_payload)?;
        let metadata_payload = compress_payload(param, metadata.to_vec());
        self.emit(SectionType::METADATA_V2, metadata_payload)?;
        Ok(())
    }

    /// Flush everything and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_blocks()?;
        self.w.flush()?;
        Ok(self.w)
    }

    fn emit(&mut self, ty: SectionType, (algo, payload): (CompressAlgo, Vec<u8>)) -> Result<()> {
        let header = Header::new(self.sections_written, ty, algo, &payload);
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(&payload)?;
        self.sections_written += 1;
        self.progress
            .compressed_size
            .add(HEADER_SIZE + payload.len() as u64);
        if ty == SectionType::BLOCK {
            self.progress.blocks_written.bump();
        }
        Ok(())
    }
}

/// Compress one payload, falling back to `NONE` storage when the codec does
/// not shrink it (or fails).
fn compress_payload(param: CompressParam, data: Vec<u8>) -> (CompressAlgo, Vec<u8>) {
    let compressed = match param {
        CompressParam::None => None,
        #[cfg(feature = "zstd")]
        CompressParam::Zstd(level) => zstd::bulk::compress(&data, level)
            .ok()
            .map(|out| (CompressAlgo::ZSTD, out)),
        #[cfg(feature = "lzma")]
        CompressParam::Lzma(preset) => lzma_compress(&data, preset).map(|out| (CompressAlgo::LZMA, out)),
        #[cfg(feature = "lz4")]
        CompressParam::Lz4 => {
            lz4::block::compress(&data, Some(lz4::block::CompressionMode::DEFAULT), false)
                .ok()
                .map(|out| (CompressAlgo::LZ4, out))
        }
        #[cfg(feature = "lz4")]
        CompressParam::Lz4Hc(level) => lz4::block::compress(
            &data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
            false,
        )
        .ok()
        .map(|out| (CompressAlgo::LZ4HC, out)),
        #[cfg(feature = "brotli")]
        CompressParam::Brotli(quality) => brotli_compress(&data, quality)
            .map(|out| (CompressAlgo::BROTLI, out)),
    };
    match compressed {
        Some((algo, out)) if out.len() < data.len() => (algo, out),
        _ => (CompressAlgo::NONE, data),
    }
}

#[cfg(feature = "lzma")]
fn lzma_compress(data: &[u8], preset: u32) -> Option<Vec<u8>> {
    use xz2::stream::{Action, Check, Status, Stream};

    let mut stream = Stream::new_easy_encoder(preset, Check::None).ok()?;
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    loop {
        let consumed = stream.total_in() as usize;
        if out.capacity() == out.len() {
            out.reserve(8 << 10);
        }
        match stream.process_vec(&data[consumed..], &mut out, Action::Finish).ok()? {
            Status::StreamEnd => return Some(out),
            _ => continue,
        }
    }
}

#[cfg(feature = "brotli")]
fn brotli_compress(data: &[u8], quality: u32) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let params = brotli::enc::BrotliEncoderParams {
        quality: quality as i32,
        ..Default::default()
    };
    brotli::BrotliCompress(&mut &data[..], &mut out, &params).ok()?;
    Some(out)
}
