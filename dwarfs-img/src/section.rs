//! The section container of a DwarFS image.
//!
//! An image is a plain concatenation of sections. Each section is a 64-byte
//! [`Header`] followed by a maybe-compressed payload. File content lives in
//! `BLOCK` sections whose uncompressed size is bounded by the image's block
//! size; the metadata schema and the metadata itself are stored in two
//! trailing sections, in that order.
//!
//! There is no trailer or index: [`SectionReader::scan_sections`] discovers
//! all sections by walking headers from the start of the image, which is
//! cheap because every header carries the payload length.
//!
//! Functions returning payloads always verify the fast XXH3-64 checksum
//! against the header before returning.
use std::{fmt, mem::offset_of};

use positioned_io::ReadAt;
use xxhash_rust::xxh3::Xxh3Default;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, little_endian as le};

type Result<T> = std::result::Result<T, Error>;

/// An error raised while reading, validating or decompressing sections.
pub struct Error(Box<ErrorInner>);

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
#[non_exhaustive]
enum ErrorInner {
    // Header.
    BadMagic([u8; 6]),
    UnsupportedVersion(u8, u8),
    WrongSectionNumber { expect: u32, got: u32 },
    LengthMismatch,
    ChecksumMismatch,
    OffsetOverflow,
    TruncatedImage,

    // Payload.
    UnsupportedCompression(CompressAlgo),
    TypeMismatch { expect: SectionType, got: SectionType },
    PayloadTooLong { limit: usize, got: u64 },
    Decompress(std::io::Error),

    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::BadMagic(magic) => {
                write!(f, "invalid section magic: b\"{}\"", magic.escape_ascii())
            }
            ErrorInner::UnsupportedVersion(maj, min) => {
                write!(f, "unsupported image version: DWARFS{maj}.{min}")
            }
            ErrorInner::WrongSectionNumber { expect, got } => {
                write!(f, "section number mismatch, expect {expect} but got {got}")
            }
            ErrorInner::LengthMismatch => f.pad("section payload length mismatch"),
            ErrorInner::ChecksumMismatch => f.pad("section checksum mismatch"),
            ErrorInner::OffsetOverflow => f.pad("section offset overflow"),
            ErrorInner::TruncatedImage => f.pad("image ends inside a section"),

            ErrorInner::UnsupportedCompression(algo) => {
                write!(f, "unsupported section compression {algo:?}")
            }
            ErrorInner::TypeMismatch { expect, got } => {
                write!(f, "section type mismatch, expect {expect:?} but got {got:?}")
            }
            ErrorInner::PayloadTooLong { limit, got } => {
                write!(
                    f,
                    "section payload has {got} bytes, exceeding the limit of {limit} bytes"
                )
            }
            ErrorInner::Decompress(err) => write!(f, "failed to decompress section payload: {err}"),

            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Decompress(err) | ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

/// The size in bytes of a section header.
pub const HEADER_SIZE: u64 = size_of::<Header>() as u64;

const _: () = assert!(HEADER_SIZE == 64);

/// The section header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(8))]
pub struct Header {
    /// Header magic and format version.
    pub magic_version: MagicVersion,
    /// The "slow" SHA-512/256 digest of the section.
    pub slow_hash: [u8; 32],
    /// The "fast" XXH3-64 digest of the section.
    pub fast_hash: [u8; 8],
    /// The 0-based index of this section in the image.
    pub section_number: le::U32,
    /// The type of this section.
    pub section_type: SectionType,
    /// The compression algorithm of the section payload.
    pub compress_algo: CompressAlgo,
    /// The length in bytes of the (compressed) payload following.
    pub payload_size: le::U64,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("magic_version", &self.magic_version)
            .field("slow_hash", &format_args!("{:02x?}", self.slow_hash))
            .field("fast_hash", &format_args!("{:02x?}", self.fast_hash))
            .field("section_number", &self.section_number.get())
            .field("section_type", &self.section_type)
            .field("compress_algo", &self.compress_algo)
            .field("payload_size", &self.payload_size.get())
            .finish()
    }
}

impl Header {
    /// Construct a header for `payload` with both checksums filled in.
    pub fn new(
        section_number: u32,
        section_type: SectionType,
        compress_algo: CompressAlgo,
        payload: &[u8],
    ) -> Self {
        let mut this = Self {
            magic_version: MagicVersion::LATEST,
            slow_hash: [0u8; 32],
            fast_hash: [0u8; 8],
            section_number: section_number.into(),
            section_type,
            compress_algo,
            payload_size: (payload.len() as u64).into(),
        };
        this.fill_checksums(payload);
        this
    }

    /// Compute and store both checksums over this header and `payload`.
    ///
    /// The fast hash covers everything from `section_number` to the end of
    /// the payload; the slow hash additionally covers the fast hash.
    pub fn fill_checksums(&mut self, payload: &[u8]) {
        use sha2::Digest;

        debug_assert_eq!(self.payload_size.get(), payload.len() as u64);

        let mut fast = Xxh3Default::new();
        fast.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
        fast.update(payload);
        self.fast_hash = fast.digest().to_le_bytes();

        let mut slow = sha2::Sha512_256::new();
        slow.update(&self.as_bytes()[offset_of!(Self, fast_hash)..]);
        slow.update(payload);
        self.slow_hash = slow.finalize().into();
    }

    /// Verify the fast XXH3-64 checksum of this header against `payload`.
    pub fn verify_fast_checksum(&self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 != self.payload_size.get() {
            bail!(ErrorInner::LengthMismatch);
        }
        let mut h = Xxh3Default::new();
        h.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
        h.update(payload);
        if h.digest() != u64::from_le_bytes(self.fast_hash) {
            bail!(ErrorInner::ChecksumMismatch);
        }
        Ok(())
    }

    /// Verify the slow SHA-512/256 checksum of this header against `payload`.
    pub fn verify_slow_checksum(&self, payload: &[u8]) -> Result<()> {
        use sha2::Digest;

        if payload.len() as u64 != self.payload_size.get() {
            bail!(ErrorInner::LengthMismatch);
        }
        let mut h = sha2::Sha512_256::new();
        h.update(&self.as_bytes()[offset_of!(Self, fast_hash)..]);
        h.update(payload);
        if h.finalize()[..] != self.slow_hash {
            bail!(ErrorInner::ChecksumMismatch);
        }
        Ok(())
    }

    pub(crate) fn check_type(&self, expect: SectionType) -> Result<()> {
        if self.section_type != expect {
            bail!(ErrorInner::TypeMismatch {
                expect,
                got: self.section_type,
            });
        }
        Ok(())
    }

    fn payload_size_limited(&self, limit: usize) -> Result<usize> {
        let size = self.payload_size.get();
        match usize::try_from(size).ok().filter(|&n| n <= limit) {
            Some(size) => Ok(size),
            None => bail!(ErrorInner::PayloadTooLong { limit, got: size }),
        }
    }
}

/// Section magic and format version.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MagicVersion {
    /// The section magic, always [`MagicVersion::MAGIC`].
    pub magic: [u8; 6],
    /// The format major version.
    pub major: u8,
    /// The format minor version.
    pub minor: u8,
}

impl fmt::Debug for MagicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagicVersion")
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("major", &self.major)
            .field("minor", &self.minor)
            .finish()
    }
}

impl MagicVersion {
    /// The expected magic.
    pub const MAGIC: [u8; 6] = *b"DWARFS";

    /// The version written by this library.
    pub const LATEST: Self = Self {
        magic: Self::MAGIC,
        major: crate::FORMAT_VERSION.0,
        minor: crate::FORMAT_VERSION.1,
    };

    /// Validate the magic and that the version is supported.
    pub fn validate(self) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!(ErrorInner::BadMagic(self.magic));
        }
        if (self.major, self.minor) != crate::FORMAT_VERSION {
            bail!(ErrorInner::UnsupportedVersion(self.major, self.minor));
        }
        Ok(())
    }
}

macro_rules! impl_open_enum {
    ($name:ident; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f
                        .debug_tuple(stringify!($name))
                        .field(&self.0.get())
                        .finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self(le::U16::new($value));
            )*
        }
    };
}

/// The type of a section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct SectionType(pub le::U16);

impl_open_enum! {
    SectionType;

    /// A block of file content.
    BLOCK = 0,
    /// The schema describing the layout of `METADATA_V2`,
    /// see [`crate::metadata::Schema`].
    METADATA_V2_SCHEMA = 7,
    /// The frozen metadata, see [`crate::metadata::Metadata`].
    METADATA_V2 = 8,
}

/// Compression algorithm used for section payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct CompressAlgo(pub le::U16);

impl_open_enum! {
    CompressAlgo;

    /// Not compressed.
    NONE = 0,
    /// LZMA, aka `.xz`. Supported via feature `lzma`.
    LZMA = 1,
    /// Zstandard. Supported via feature `zstd`.
    ZSTD = 2,
    /// LZ4. Supported via feature `lz4`.
    LZ4 = 3,
    /// LZ4 in high-compression mode, decompressible as plain LZ4.
    /// Supported via feature `lz4`.
    LZ4HC = 4,
    /// Brotli. Supported via feature `brotli`.
    BROTLI = 5,
}

/// The location and identity of one section, as discovered by
/// [`SectionReader::scan_sections`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    /// Offset of the section header from the start of the image.
    pub offset: u64,
    /// The type of the section.
    pub section_type: SectionType,
    /// The compression algorithm of the payload.
    pub compress_algo: CompressAlgo,
    /// The length in bytes of the (compressed) payload.
    pub payload_size: u64,
}

/// A wrapper for reading sections from a random access source.
///
/// The inner type should implement [`positioned_io::ReadAt`], typically
/// [`std::fs::File`]. No additional buffering is needed: sections are large
/// and [`Archive`][crate::Archive] caches decompressed blocks.
pub struct SectionReader<R: ?Sized> {
    /// Scratch buffer for raw compressed payloads, kept only for allocation
    /// reuse. The reader itself is stateless.
    raw_buf: Vec<u8>,
    rdr: R,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for SectionReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionReader")
            .field("rdr", &&self.rdr)
            .finish_non_exhaustive()
    }
}

impl<R> SectionReader<R> {
    /// Create a section reader over a random access source.
    pub fn new(rdr: R) -> Self {
        Self {
            raw_buf: Vec::new(),
            rdr,
        }
    }

    /// Retrieve the ownership of the underlying reader.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.rdr
    }
}

impl<R: ?Sized> SectionReader<R> {
    /// Get a reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// Get a mutable reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rdr
    }
}

impl<R: ReadAt + ?Sized> SectionReader<R> {
    /// Discover all sections by walking headers from offset 0 to
    /// `stream_len`.
    ///
    /// Validates the magic, version, and sequential section numbering of
    /// every header. Fails if the last section does not end exactly at
    /// `stream_len`.
    pub fn scan_sections(&mut self, stream_len: u64) -> Result<Vec<SectionInfo>> {
        let mut sections = Vec::new();
        let mut offset = 0u64;
        while offset < stream_len {
            if stream_len - offset < HEADER_SIZE {
                bail!(ErrorInner::TruncatedImage);
            }
            let header = self.read_header_at(offset)?;
            let number = header.section_number.get();
            if number as usize != sections.len() {
                bail!(ErrorInner::WrongSectionNumber {
                    expect: sections.len() as u32,
                    got: number,
                });
            }
            let payload_size = header.payload_size.get();
            if stream_len - offset - HEADER_SIZE < payload_size {
                bail!(ErrorInner::TruncatedImage);
            }
            sections.push(SectionInfo {
                offset,
                section_type: header.section_type,
                compress_algo: header.compress_algo,
                payload_size,
            });
            offset += HEADER_SIZE + payload_size;
        }
        log::trace!("scanned {} sections in {stream_len} bytes", sections.len());
        Ok(sections)
    }

    /// Read a section header at `section_offset`.
    pub fn read_header_at(&mut self, section_offset: u64) -> Result<Header> {
        let mut header = Header::new_zeroed();
        self.rdr
            .read_exact_at(section_offset, header.as_mut_bytes())?;
        header.magic_version.validate()?;
        Ok(header)
    }

    /// Read and decompress a full section at `section_offset` into memory.
    pub fn read_section_at(
        &mut self,
        section_offset: u64,
        payload_size_limit: usize,
    ) -> Result<(Header, Vec<u8>)> {
        let header = self.read_header_at(section_offset)?;
        let payload =
            self.read_payload_at(&header, section_offset + HEADER_SIZE, payload_size_limit)?;
        Ok((header, payload))
    }

    /// Read and decompress a section payload into an owned `Vec<u8>`.
    pub fn read_payload_at(
        &mut self,
        header: &Header,
        payload_offset: u64,
        payload_size_limit: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; payload_size_limit];
        let len = self.read_payload_at_into(header, payload_offset, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Read and decompress a section payload into a caller buffer.
    ///
    /// `payload_offset` is the offset of the bytes following the header.
    /// Both the compressed and the decompressed size must fit in `out`, or an
    /// error is returned. Returns the decompressed length.
    pub fn read_payload_at_into(
        &mut self,
        header: &Header,
        payload_offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        if payload_offset.checked_add(header.payload_size.get()).is_none() {
            bail!(ErrorInner::OffsetOverflow);
        }
        let compressed_size = header.payload_size_limited(out.len())?;
        let raw_buf = &mut self.raw_buf;
        raw_buf.resize(compressed_size, 0);
        self.rdr.read_exact_at(payload_offset, raw_buf)?;
        header.verify_fast_checksum(raw_buf)?;
        decompress_into(header.compress_algo, raw_buf, out)
    }
}

pub(crate) fn decompress_into(algo: CompressAlgo, raw: &[u8], out: &mut [u8]) -> Result<usize> {
    match algo {
        CompressAlgo::NONE => {
            out[..raw.len()].copy_from_slice(raw);
            Ok(raw.len())
        }
        #[cfg(feature = "zstd")]
        CompressAlgo::ZSTD => {
            let len = zstd::bulk::decompress_to_buffer(raw, out).map_err(ErrorInner::Decompress)?;
            Ok(len)
        }
        #[cfg(feature = "lzma")]
        CompressAlgo::LZMA => (|| {
            let mut stream = xz2::stream::Stream::new_stream_decoder(u64::MAX, 0)?;
            let st = stream.process(raw, out, xz2::stream::Action::Run)?;
            if stream.total_in() as usize != raw.len() || st != xz2::stream::Status::StreamEnd {
                bail!(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "LZMA stream did not end cleanly",
                ));
            }
            Ok(stream.total_out() as usize)
        })()
        .map_err(|err| ErrorInner::Decompress(err).into()),
        #[cfg(feature = "lz4")]
        CompressAlgo::LZ4 | CompressAlgo::LZ4HC => {
            let len = lz4::block::decompress_to_buffer(raw, None, out)
                .map_err(ErrorInner::Decompress)?;
            Ok(len)
        }
        #[cfg(feature = "brotli")]
        CompressAlgo::BROTLI => {
            use std::io::Read;

            let mut dec = brotli::Decompressor::new(raw, 8 << 10);
            let mut total = 0usize;
            loop {
                if total == out.len() {
                    // Either exactly done, or the payload is larger than the
                    // declared uncompressed limit.
                    let mut probe = [0u8; 1];
                    match dec.read(&mut probe) {
                        Ok(0) => break,
                        Ok(_) => bail!(ErrorInner::Decompress(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "brotli stream exceeds size limit",
                        ))),
                        Err(err) => bail!(ErrorInner::Decompress(err)),
                    }
                }
                match dec.read(&mut out[total..]) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => bail!(ErrorInner::Decompress(err)),
                }
            }
            Ok(total)
        }
        algo => bail!(ErrorInner::UnsupportedCompression(algo)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_section(number: u32, ty: SectionType, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(number, ty, CompressAlgo::NONE, payload);
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn scan_and_read_back() {
        let mut image = raw_section(0, SectionType::BLOCK, b"block zero");
        image.extend(raw_section(1, SectionType::BLOCK, b"block one"));
        image.extend(raw_section(2, SectionType::METADATA_V2_SCHEMA, b"schema"));
        image.extend(raw_section(3, SectionType::METADATA_V2, b"metadata"));

        let len = image.len() as u64;
        let mut rdr = SectionReader::new(image);
        let sections = rdr.scan_sections(len).unwrap();
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].section_type, SectionType::BLOCK);
        assert_eq!(sections[3].section_type, SectionType::METADATA_V2);

        let (header, payload) = rdr.read_section_at(sections[1].offset, 1024).unwrap();
        assert_eq!(header.section_number.get(), 1);
        assert_eq!(payload, b"block one");
        header.verify_slow_checksum(&payload).unwrap();
    }

    #[test]
    fn corruption_is_detected() {
        let mut image = raw_section(0, SectionType::BLOCK, b"some payload");
        let len = image.len() as u64;
        image[HEADER_SIZE as usize] ^= 1;
        let mut rdr = SectionReader::new(image);
        let sections = rdr.scan_sections(len).unwrap();
        let err = rdr.read_section_at(sections[0].offset, 1024).unwrap_err();
        assert_eq!(err.to_string(), "section checksum mismatch");
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = raw_section(0, SectionType::BLOCK, b"some payload");
        let mut rdr = SectionReader::new(image);
        assert!(rdr.scan_sections(HEADER_SIZE + 3).is_err());
        assert!(rdr.scan_sections(20).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut image = raw_section(0, SectionType::BLOCK, b"x");
        image[0] = b'X';
        let len = image.len() as u64;
        let mut rdr = SectionReader::new(image);
        let err = rdr.scan_sections(len).unwrap_err();
        assert!(err.to_string().contains("invalid section magic"), "{err}");
    }
}
