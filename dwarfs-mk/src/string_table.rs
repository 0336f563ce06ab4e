//! Compact string table construction.
//!
//! The compact form stores all items concatenated into one buffer plus an
//! index: either `N + 1` cumulative offsets, or `N` per-item lengths when
//! the index is packed. With `pack_data` the buffer is FSST-compressed and
//! the symbol table is stored alongside; small tables usually lose to that,
//! so the compressor is skipped unless it pays off or `force` is set.

use bstr::BString;
use dwarfs_img::fsst;
use dwarfs_img::metadata::StringTable;

#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    /// FSST-compress the buffer.
    pub pack_data: bool,
    /// Store per-item lengths instead of cumulative offsets.
    pub pack_index: bool,
    /// Apply FSST even when the heuristic predicts a loss.
    pub force: bool,
}

/// Minimum total payload for FSST to be considered at all.
const PACK_DATA_THRESHOLD: usize = 1 << 10;

pub fn build(items: &[String], opts: PackOptions) -> StringTable {
    let plain_total: usize = items.iter().map(String::len).sum();

    let mut symtab = None;
    let mut encoded: Option<Vec<Vec<u8>>> = None;
    if opts.pack_data && (opts.force || plain_total >= PACK_DATA_THRESHOLD) {
        let compressor = fsst::Compressor::train(items.iter().map(String::as_bytes));
        let enc: Vec<Vec<u8>> = items.iter().map(|s| compressor.encode(s.as_bytes())).collect();
        let symtab_bytes = compressor.symtab_bytes();
        let enc_total: usize = enc.iter().map(Vec::len).sum();
        if opts.force || enc_total + symtab_bytes.len() < plain_total {
            symtab = Some(BString::from(symtab_bytes));
            encoded = Some(enc);
        }
    }

    let mut out = StringTable {
        buffer: BString::default(),
        symtab,
        index: Vec::new(),
        packed_index: opts.pack_index,
    };

    let mut push_item = |out: &mut StringTable, item: &[u8]| {
        out.buffer.extend_from_slice(item);
        if opts.pack_index {
            out.index.push(item.len() as u32);
        } else {
            out.index.push(out.buffer.len() as u32);
        }
    };

    if !opts.pack_index {
        out.index.push(0);
    }
    match &encoded {
        Some(enc) => {
            for item in enc {
                push_item(&mut out, item);
            }
        }
        None => {
            for item in items {
                push_item(&mut out, item.as_bytes());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("shared_prefix_{i:03}.txt")).collect()
    }

    #[test]
    fn plain_offsets_index() {
        let tbl = build(
            &["ab".into(), "".into(), "cde".into()],
            PackOptions {
                pack_data: false,
                pack_index: false,
                force: false,
            },
        );
        assert_eq!(tbl.buffer, "abcde");
        assert_eq!(tbl.index, [0, 2, 2, 5]);
        assert!(!tbl.packed_index);
        assert!(tbl.symtab.is_none());
    }

    #[test]
    fn packed_lengths_index() {
        let tbl = build(
            &["ab".into(), "".into(), "cde".into()],
            PackOptions {
                pack_data: false,
                pack_index: true,
                force: false,
            },
        );
        assert_eq!(tbl.index, [2, 0, 3]);
        assert!(tbl.packed_index);
    }

    #[test]
    fn fsst_pays_off_on_repetitive_names() {
        let items = items(200);
        let tbl = build(
            &items,
            PackOptions {
                pack_data: true,
                pack_index: false,
                force: false,
            },
        );
        let plain: usize = items.iter().map(String::len).sum();
        assert!(tbl.symtab.is_some());
        assert!(tbl.buffer.len() < plain);

        // And it decodes back.
        let dec = fsst::Decoder::parse(tbl.symtab.as_ref().unwrap()).unwrap();
        for (i, item) in items.iter().enumerate() {
            let range = tbl.index[i] as usize..tbl.index[i + 1] as usize;
            assert_eq!(dec.decode(&tbl.buffer[range]).unwrap(), item.as_str());
        }
    }

    #[test]
    fn tiny_tables_skip_fsst_unless_forced() {
        let tiny = vec!["a".to_owned(), "b".to_owned()];
        let tbl = build(
            &tiny,
            PackOptions {
                pack_data: true,
                pack_index: false,
                force: false,
            },
        );
        assert!(tbl.symtab.is_none());

        let tbl = build(
            &tiny,
            PackOptions {
                pack_data: true,
                pack_index: false,
                force: true,
            },
        );
        assert!(tbl.symtab.is_some());
    }
}
