//! [Fast Static Symbol Table (FSST)][fsst] compression for the compact
//! string tables ([`StringTable::symtab`][crate::metadata::StringTable]).
//!
//! FSST replaces frequent byte sequences of up to 8 bytes with 1-byte codes.
//! Code `0xFF` escapes the following literal byte, so the worst case doubles
//! the input; this is where the 2x allowance in the string-table length
//! limits comes from.
//!
//! The symbol table serialization follows libfsst (version header, the
//! `zero_terminated` flag, a length histogram, then the symbols ordered by
//! length 2,3,4,5,6,7,8,1).
//!
//! [fsst]: https://github.com/cwida/fsst

use std::collections::HashMap;
use std::fmt;

use bstr::BString;

const VERSION: u32 = 2019_0218;

/// The max length of one symbol.
pub const MAX_SYMBOL_LEN: usize = 8;

/// The escape code: the next input byte is a literal.
const ESCAPE: u8 = 0xFF;

type Result<T, E = Error> = std::result::Result<T, E>;

/// A symbol table encoding or decoding error.
pub struct Error(ErrorInner);

#[derive(Debug)]
enum ErrorInner {
    InputEof,
    InvalidMagic,
    NulMode,
    CodeOverflow,

    BufTooSmall,
    InvalidEscape,
    InvalidSymbol,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self.0 {
            ErrorInner::InputEof => "unexpected end of input",
            ErrorInner::InvalidMagic => "missing header magic",
            ErrorInner::NulMode => "unsupported null-terminated mode",
            ErrorInner::CodeOverflow => "too many symbols",
            ErrorInner::BufTooSmall => "output buffer is too small",
            ErrorInner::InvalidEscape => "invalid escape byte at the end of input",
            ErrorInner::InvalidSymbol => "invalid symbol",
        })
    }
}

impl std::error::Error for Error {}

impl From<ErrorInner> for Error {
    #[cold]
    #[inline]
    fn from(err: ErrorInner) -> Self {
        Self(err)
    }
}

/// Iterate `(symbol_length, histogram_slot)` in serialization order
/// 2,3,4,5,6,7,8,1.
fn len_order() -> impl Iterator<Item = usize> {
    (2..=8).chain([1])
}

/// The FSST decoder: a plain code -> symbol array.
pub struct Decoder {
    /// Symbols for codes `0..count`, each 1 to 8 bytes.
    symbols: Vec<Box<[u8]>>,
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl Decoder {
    /// Parse a serialized symbol table.
    ///
    /// Notable deviations from libfsst's `fsst_import`:
    /// - Short inputs fail cleanly instead of over-reading.
    /// - The null-terminated mode is rejected.
    /// - Trailing bytes are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (&version_bytes, rest) = bytes.split_first_chunk::<8>().ok_or(ErrorInner::InputEof)?;
        let (&zero_terminated, rest) = rest.split_first().ok_or(ErrorInner::InputEof)?;
        let (&len_histo, rest) = rest.split_first_chunk::<8>().ok_or(ErrorInner::InputEof)?;

        let version = u64::from_le_bytes(version_bytes);
        if version >> 32 != u64::from(VERSION) {
            bail!(ErrorInner::InvalidMagic);
        }
        if zero_terminated & 1 != 0 {
            bail!(ErrorInner::NulMode);
        }

        let mut symbols = Vec::new();
        let mut pos = 0usize;
        for len in len_order() {
            for _ in 0..len_histo[len - 1] {
                let sym = rest
                    .get(pos..pos + len)
                    .ok_or(ErrorInner::InputEof)?;
                if symbols.len() >= usize::from(ESCAPE) {
                    bail!(ErrorInner::CodeOverflow);
                }
                symbols.push(sym.into());
                pos += len;
            }
        }

        Ok(Self { symbols })
    }

    /// The max possible decoded length for an `input_len` byte input.
    #[inline]
    #[must_use]
    pub fn max_decode_len(input_len: usize) -> usize {
        // `usize::MAX` on overflow guarantees an OOM instead of a short buffer.
        input_len.checked_mul(MAX_SYMBOL_LEN).unwrap_or(usize::MAX)
    }

    /// Decode `input` into `output`, returning the decoded length.
    ///
    /// # Errors
    ///
    /// Fails if `output.len() < Self::max_decode_len(input.len())`, if a code
    /// has no symbol, or if the input ends in a dangling escape.
    pub fn decode_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        if output.len() < Self::max_decode_len(input.len()) {
            bail!(ErrorInner::BufTooSmall);
        }
        if input.last() == Some(&ESCAPE) {
            bail!(ErrorInner::InvalidEscape);
        }

        let mut out_pos = 0usize;
        let mut i = 0usize;
        while i < input.len() {
            let b = input[i];
            if b == ESCAPE {
                i += 1;
                output[out_pos] = input[i];
                out_pos += 1;
            } else {
                let sym = self
                    .symbols
                    .get(usize::from(b))
                    .ok_or(ErrorInner::InvalidSymbol)?;
                output[out_pos..out_pos + sym.len()].copy_from_slice(sym);
                out_pos += sym.len();
            }
            i += 1;
        }
        Ok(out_pos)
    }

    /// Decode `input` into an owned byte string.
    pub fn decode(&self, input: &[u8]) -> Result<BString> {
        let mut buf = vec![0u8; Self::max_decode_len(input.len())];
        let len = self.decode_into(input, &mut buf)?;
        buf.truncate(len);
        Ok(buf.into())
    }
}

/// Serialize a symbol table.
///
/// `symbols` must be ordered by length 2,3,4,5,6,7,8,1, have at most 255
/// elements, and contain no NUL bytes.
pub fn symtab_to_bytes<I>(symbols: I) -> Result<Vec<u8>>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut len_histo = [0u8; 8];
    let mut body = Vec::new();
    let mut code = 0usize;
    let mut prev_order = 0usize;
    for sym in symbols {
        let sym = sym.as_ref();
        if code >= usize::from(ESCAPE) {
            bail!(ErrorInner::CodeOverflow);
        }
        if !(1..=MAX_SYMBOL_LEN).contains(&sym.len()) || sym.contains(&0) {
            bail!(ErrorInner::InvalidSymbol);
        }
        // Lengths 2,3,..,8 then 1.
        let order = sym.len().wrapping_sub(2).min(7);
        if order < prev_order {
            bail!(ErrorInner::InvalidSymbol);
        }
        prev_order = order;

        len_histo[sym.len() - 1] += 1;
        body.extend_from_slice(sym);
        code += 1;
    }

    let mut out = Vec::with_capacity(8 + 1 + 8 + body.len());
    out.extend_from_slice(&((u64::from(VERSION) << 32) | 0xFF).to_le_bytes());
    out.push(0x00); // zero_terminated disabled
    out.extend_from_slice(&len_histo);
    out.extend_from_slice(&body);
    Ok(out)
}

/// An FSST compressor: a trained symbol table plus a longest-match encoder.
pub struct Compressor {
    /// Symbols in serialization order; the index is the code.
    symbols: Vec<Box<[u8]>>,
    /// symbol bytes -> code.
    lookup: HashMap<Box<[u8]>, u8>,
}

impl fmt::Debug for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compressor")
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl Compressor {
    /// Train a symbol table over a corpus of byte strings.
    ///
    /// A simplified version of the libfsst construction loop: a few rounds of
    /// greedily encoding the corpus with the current table while counting
    /// single matches and concatenations of adjacent matches, then keeping
    /// the highest-gain candidates. Deterministic for a fixed corpus.
    pub fn train<'a, I>(corpus: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]> + Clone,
    {
        const ROUNDS: usize = 4;
        const MAX_SYMBOLS: usize = 255;

        let mut this = Self {
            symbols: Vec::new(),
            lookup: HashMap::new(),
        };

        for _ in 0..ROUNDS {
            let mut counts: HashMap<Vec<u8>, u64> = HashMap::new();
            for line in corpus.clone() {
                let mut prev: Option<&[u8]> = None;
                let mut pos = 0usize;
                while pos < line.len() {
                    let m = match this.longest_match(&line[pos..]) {
                        Some((_, len)) => &line[pos..pos + len],
                        None => &line[pos..pos + 1],
                    };
                    if !m.contains(&0) {
                        *counts.entry(m.to_vec()).or_default() += 1;
                    }
                    if let Some(prev) = prev {
                        if prev.len() + m.len() <= MAX_SYMBOL_LEN {
                            let mut cat = prev.to_vec();
                            cat.extend_from_slice(m);
                            if !cat.contains(&0) {
                                *counts.entry(cat).or_default() += 1;
                            }
                        }
                    }
                    pos += m.len();
                    prev = Some(m);
                }
            }

            let mut candidates: Vec<(u64, Vec<u8>)> = counts
                .into_iter()
                .map(|(sym, freq)| (freq * sym.len() as u64, sym))
                .collect();
            // Highest gain first; ties broken by the symbol bytes so the
            // result does not depend on hash iteration order.
            candidates.sort_by(|(ga, sa), (gb, sb)| gb.cmp(ga).then_with(|| sa.cmp(sb)));
            candidates.truncate(MAX_SYMBOLS);

            let mut symbols: Vec<Box<[u8]>> =
                candidates.into_iter().map(|(_, sym)| sym.into()).collect();
            symbols.sort_by(|a, b| {
                let order = |s: &[u8]| s.len().wrapping_sub(2).min(7);
                order(a).cmp(&order(b)).then_with(|| a.cmp(b))
            });
            this.lookup = symbols
                .iter()
                .enumerate()
                .map(|(code, sym)| (sym.clone(), code as u8))
                .collect();
            this.symbols = symbols;
        }
        this
    }

    fn longest_match(&self, rest: &[u8]) -> Option<(u8, usize)> {
        let max = rest.len().min(MAX_SYMBOL_LEN);
        (1..=max).rev().find_map(|len| {
            let code = *self.lookup.get(&rest[..len])?;
            Some((code, len))
        })
    }

    /// The serialized symbol table, parseable by [`Decoder::parse`].
    pub fn symtab_bytes(&self) -> Vec<u8> {
        symtab_to_bytes(&self.symbols).expect("trained table is valid")
    }

    /// Encode `input`, escaping bytes not covered by any symbol.
    pub fn encode(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut pos = 0usize;
        while pos < input.len() {
            match self.longest_match(&input[pos..]) {
                Some((code, len)) => {
                    out.push(code);
                    pos += len;
                }
                None => {
                    out.push(ESCAPE);
                    out.push(input[pos]);
                    pos += 1;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_smoke() {
        let bytes = symtab_to_bytes([&b"hello"[..], b"world", b"!"]).unwrap();
        let tbl = Decoder::parse(&bytes).unwrap();
        assert_eq!(tbl.decode(b"\x00\xFF,\x01\x02").unwrap(), "hello,world!");

        assert_eq!(tbl.decode(b"").unwrap(), "");
        assert_eq!(
            tbl.decode(b"\xFF").unwrap_err().to_string(),
            "invalid escape byte at the end of input",
        );
        assert_eq!(
            tbl.decode_into(b"\x00", &mut [0u8; 4])
                .unwrap_err()
                .to_string(),
            "output buffer is too small",
        );
    }

    #[test]
    fn symtab_rejects_bad_tables() {
        assert_eq!(
            symtab_to_bytes([&b"!"[..], b"hello"]).unwrap_err().to_string(),
            "invalid symbol",
        );
        assert_eq!(
            symtab_to_bytes([b"123456789"]).unwrap_err().to_string(),
            "invalid symbol",
        );
        assert_eq!(
            symtab_to_bytes(&[b"ab"].repeat(256)).unwrap_err().to_string(),
            "too many symbols",
        );
    }

    #[test]
    fn train_encode_decode_roundtrip() {
        let names: Vec<String> = (0..64)
            .map(|i| format!("a_very_common_prefix.{i:02}.txt"))
            .collect();
        let corpus: Vec<&[u8]> = names.iter().map(|s| s.as_bytes()).collect();

        let comp = Compressor::train(corpus.iter().copied());
        let dec = Decoder::parse(&comp.symtab_bytes()).unwrap();

        let mut total_enc = 0usize;
        let mut total_plain = 0usize;
        for name in &corpus {
            let enc = comp.encode(name);
            assert_eq!(dec.decode(&enc).unwrap(), *name);
            total_enc += enc.len();
            total_plain += name.len();
        }
        assert!(total_enc < total_plain, "{total_enc} >= {total_plain}");
    }

    #[test]
    fn encode_escapes_uncovered_bytes() {
        let comp = Compressor::train(std::iter::empty::<&[u8]>());
        let input = b"\xFF\x00ab";
        let enc = comp.encode(input);
        assert_eq!(enc.len(), input.len() * 2);
        let dec = Decoder::parse(&comp.symtab_bytes()).unwrap();
        assert_eq!(dec.decode(&enc).unwrap(), &input[..]);
    }
}
