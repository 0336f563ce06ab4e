//! Block assembly and segment matching.
//!
//! File content is appended to a fixed-size block buffer; full blocks go to
//! the image writer for compression. With a non-zero
//! `blockhash_window_size`, a rolling hash over the bytes appended so far is
//! kept, and input windows hitting the table are verified bytewise, extended
//! greedily and emitted as back-reference chunks into the current block
//! instead of being stored again.
//!
//! Chunks referencing a block are only ever produced while that block is the
//! one being filled, so every emitted chunk stays within the block size and
//! the output depends only on the input sequence.

use std::collections::HashMap;
use std::io::Write;

use dwarfs_img::metadata::Chunk;

use crate::options::BlockManagerConfig;
use crate::progress::{Counter, Progress};
use crate::writer::ImageWriter;
use crate::Result;

/// Polynomial rolling hash base.
const HASH_BASE: u64 = 0x0000_0100_0000_01B3;

/// The block manager: consumes ordered inode contents, emits chunk lists.
pub struct BlockManager<'a, W: Write> {
    block_size: u32,
    window: usize,
    /// `HASH_BASE ^ window`, for removing the outgoing byte.
    base_pow_w: u64,

    /// Content of the block currently being filled.
    buf: Vec<u8>,
    /// Rolling hash of the last `window` bytes of `buf`.
    buf_hash: u64,
    /// Window hash -> window start offset in `buf`. First writer wins, so
    /// matches always reference the earliest occurrence.
    table: HashMap<u64, u32>,

    writer: &'a mut ImageWriter<W>,
    progress: &'a Progress,
}

impl<W: Write> std::fmt::Debug for BlockManager<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("block_size", &self.block_size)
            .field("window", &self.window)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl<'a, W: Write> BlockManager<'a, W> {
    pub fn new(
        config: &BlockManagerConfig,
        writer: &'a mut ImageWriter<W>,
        progress: &'a Progress,
    ) -> Self {
        let window = config.blockhash_window_size as usize;
        let mut base_pow_w = 1u64;
        for _ in 0..window {
            base_pow_w = base_pow_w.wrapping_mul(HASH_BASE);
        }
        Self {
            block_size: config.block_size(),
            window,
            base_pow_w,
            buf: Vec::with_capacity(config.block_size() as usize),
            buf_hash: 0,
            table: HashMap::new(),
            writer,
            progress,
        }
    }

    /// Append one file's content, returning its chunk list.
    pub fn add_inode(&mut self, content: &[u8]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        let w = self.window;
        if w == 0 || content.len() < w {
            for &b in content {
                self.append_byte(b, &mut chunks)?;
            }
            return Ok(chunks);
        }

        // Hash of the input window starting at `pos`.
        let mut pos = 0usize;
        let mut in_hash = hash_window(&content[..w]);
        loop {
            if let Some((cand, len)) = self.try_match(&content[pos..], in_hash) {
                push_chunk(&mut chunks, self.writer.block_count(), cand, len as u32);
                self.progress.saved_by_segmentation.add(len as u64);
                pos += len;
                if pos + w > content.len() {
                    break;
                }
                in_hash = hash_window(&content[pos..pos + w]);
                continue;
            }

            self.append_byte(content[pos], &mut chunks)?;
            pos += 1;
            if pos + w > content.len() {
                break;
            }
            in_hash = in_hash
                .wrapping_mul(HASH_BASE)
                .wrapping_sub(u64::from(content[pos - 1]).wrapping_mul(self.base_pow_w))
                .wrapping_add(u64::from(content[pos + w - 1]));
        }

        // The tail shorter than one window is always literal.
        for &b in &content[pos..] {
            self.append_byte(b, &mut chunks)?;
        }
        Ok(chunks)
    }

    /// Probe the table for `rest[..window]` and return the full verified
    /// match length, if any.
    fn try_match(&self, rest: &[u8], in_hash: u64) -> Option<(u32, usize)> {
        let w = self.window;
        let cand = *self.table.get(&in_hash)? as usize;
        let have = self.buf.get(cand..cand + w)?;
        if have != &rest[..w] {
            return None;
        }
        let mut len = w;
        while cand + len < self.buf.len()
            && len < rest.len()
            && self.buf[cand + len] == rest[len]
        {
            len += 1;
        }
        Some((cand as u32, len))
    }

    /// Append one literal byte, flushing the block when it fills up.
    fn append_byte(&mut self, b: u8, chunks: &mut Vec<Chunk>) -> Result<()> {
        if self.buf.len() == self.block_size as usize {
            self.flush_block()?;
        }
        let offset = self.buf.len() as u32;
        self.buf.push(b);
        push_chunk(chunks, self.writer.block_count(), offset, 1);

        if self.window != 0 {
            self.buf_hash = self
                .buf_hash
                .wrapping_mul(HASH_BASE)
                .wrapping_add(u64::from(b));
            if self.buf.len() >= self.window {
                let start = self.buf.len() - self.window;
                if self.buf.len() > self.window {
                    let out = self.buf[start - 1];
                    self.buf_hash = self
                        .buf_hash
                        .wrapping_sub(u64::from(out).wrapping_mul(self.base_pow_w));
                }
                self.table.entry(self.buf_hash).or_insert(start as u32);
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let data = std::mem::take(&mut self.buf);
        self.buf.reserve(self.block_size as usize);
        self.table.clear();
        self.buf_hash = 0;
        self.writer.write_block(data)
    }

    /// Flush the trailing partial block.
    pub fn finish_blocks(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.flush_block()?;
        }
        Ok(())
    }
}

fn hash_window(window: &[u8]) -> u64 {
    window
        .iter()
        .fold(0u64, |h, &b| h.wrapping_mul(HASH_BASE).wrapping_add(u64::from(b)))
}

/// Append a chunk, merging with the previous one when contiguous in the
/// same block.
fn push_chunk(chunks: &mut Vec<Chunk>, block: u32, offset: u32, size: u32) {
    if let Some(last) = chunks
        .last_mut()
        .filter(|last| last.block == block && last.offset + last.size == offset)
    {
        last.size += size;
    } else {
        chunks.push(Chunk {
            block,
            offset,
            size,
        });
    }
}
