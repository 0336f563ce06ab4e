//! File inode bookkeeping: hardlink groups, content classes and the block
//! packing order.
//!
//! Terminology: a *group* is one image inode (hardlinked entries collapse
//! into one group); a *class* is one stored content (groups with equal
//! digests collapse into one class). A class with a single group is a
//! *unique file*; every group of a multi-group class is a *shared file* and
//! is stored only as a back-reference through the shared-files table.

use crate::entry::{EntryArena, EntryId};
use crate::options::{BuildScript, FileOrderMode, ScriptFile};

/// A content digest. Shorter digests are zero-padded; one build always uses
/// a single algorithm, so lengths never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Digest(pub [u8; 32]);

/// Content-derived ordering features, computed by the scan workers.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScanFeatures {
    /// Coarse similarity score; alike files get close values.
    pub similarity: u32,
    /// Trigram locality-sensitive digest for nearest-neighbor chaining.
    pub lsh: [u8; 32],
}

/// One image inode: a set of hardlinked file entries.
#[derive(Debug)]
pub struct FileGroup {
    /// The first entry of the group; supplies metadata and content.
    pub rep_entry: EntryId,
    pub size: u64,
    pub(crate) digest: Option<Digest>,
    pub(crate) features: ScanFeatures,
    /// Content class, assigned by `finalize`.
    pub class: u32,
    /// Image inode number, assigned by `finalize`.
    pub inode: u32,
}

/// One stored content: a chunk-table row.
#[derive(Debug)]
pub struct FileClass {
    /// Groups sharing this content, in discovery order.
    pub groups: Vec<u32>,
    /// The chunk-table row index, assigned by `finalize`: unique classes
    /// first, shared classes after.
    pub store_idx: u32,
}

/// The registry of file groups and classes.
#[derive(Debug, Default)]
pub struct InodeManager {
    pub(crate) groups: Vec<FileGroup>,
    pub(crate) classes: Vec<FileClass>,
}

impl InodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_group(&mut self, rep_entry: EntryId, size: u64) -> u32 {
        let idx = self.groups.len() as u32;
        self.groups.push(FileGroup {
            rep_entry,
            size,
            digest: None,
            features: ScanFeatures::default(),
            class: u32::MAX,
            inode: u32::MAX,
        });
        idx
    }

    /// The number of stored contents, i.e. chunk-table rows.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn groups(&self) -> &[FileGroup] {
        &self.groups
    }

    pub fn classes(&self) -> &[FileClass] {
        &self.classes
    }

    fn class_rep(&self, class_idx: u32) -> &FileGroup {
        &self.groups[self.classes[class_idx as usize].groups[0] as usize]
    }

    /// Decide the order in which class contents are fed to the block
    /// manager. Returns class indices; deterministic for fixed inputs.
    pub(crate) fn order_classes(
        &self,
        mode: FileOrderMode,
        script: Option<&dyn BuildScript>,
        arena: &EntryArena,
    ) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.classes.len() as u32).collect();
        match mode {
            FileOrderMode::None => {}
            FileOrderMode::Path => {
                order.sort_by_cached_key(|&c| arena.rel_path(self.class_rep(c).rep_entry));
            }
            FileOrderMode::Similarity => {
                order.sort_by_key(|&c| (self.class_rep(c).features.similarity, c));
            }
            FileOrderMode::Nilsimsa => order = self.order_by_lsh_chain(),
            FileOrderMode::Script => {
                let script = script.expect("script order requires a script");
                let mut files: Vec<ScriptFile> = order
                    .iter()
                    .map(|&c| {
                        let rep = self.class_rep(c);
                        ScriptFile {
                            path: arena.rel_path(rep.rep_entry),
                            size: rep.size,
                            class_idx: c,
                        }
                    })
                    .collect();
                script.order_files(&mut files);
                order = files.into_iter().map(|f| f.class_idx).collect();
            }
        }
        order
    }

    /// Greedy nearest-neighbor chain over the trigram digests: start from the
    /// first class, always continue with the most similar remaining one,
    /// ties broken by discovery order.
    fn order_by_lsh_chain(&self) -> Vec<u32> {
        let n = self.classes.len();
        let mut out = Vec::with_capacity(n);
        let mut remaining: Vec<u32> = (0..n as u32).collect();
        if remaining.is_empty() {
            return out;
        }
        let mut cur = remaining.remove(0);
        out.push(cur);
        while !remaining.is_empty() {
            let cur_lsh = &self.class_rep(cur).features.lsh;
            let (best_pos, _) = remaining
                .iter()
                .enumerate()
                .map(|(pos, &c)| (pos, lsh_similarity(cur_lsh, &self.class_rep(c).features.lsh)))
                .max_by(|(pa, sa), (pb, sb)| sa.cmp(sb).then_with(|| pb.cmp(pa)))
                .expect("non-empty");
            cur = remaining.remove(best_pos);
            out.push(cur);
        }
        out
    }
}

/// Agreeing bits between two digests.
fn lsh_similarity(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    let distance: u32 = std::iter::zip(a, b).map(|(x, y)| (x ^ y).count_ones()).sum();
    256 - distance
}

/// Streaming calculator for [`ScanFeatures`].
///
/// The trigram digest follows the nilsimsa construction (bucket counts over
/// a sliding window, thresholded at the mean); the bucket mix is a fixed
/// multiplicative hash rather than the original transition table, which
/// preserves the clustering property this is used for.
#[derive(Debug)]
pub(crate) struct FeatureAccumulator {
    histogram: [u64; 256],
    buckets: [u64; 256],
    window: [u8; 2],
    seen: u64,
}

impl FeatureAccumulator {
    pub fn new() -> Self {
        Self {
            histogram: [0; 256],
            buckets: [0; 256],
            window: [0; 2],
            seen: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        for &b in chunk {
            self.histogram[usize::from(b)] += 1;
            if self.seen >= 2 {
                let [x, y] = self.window;
                self.buckets[trigram_bucket(x, y, b)] += 1;
            }
            self.window = [self.window[1], b];
            self.seen += 1;
        }
    }

    pub fn finish(&self) -> ScanFeatures {
        let total = self.seen;
        if total == 0 {
            return ScanFeatures::default();
        }

        // Coarse score: (mean byte, distinct bytes, log2 size, spread).
        let sum: u64 = self
            .histogram
            .iter()
            .enumerate()
            .map(|(b, &n)| b as u64 * n)
            .sum();
        let mean = (sum / total) as u32;
        let distinct = (self.histogram.iter().filter(|&&n| n != 0).count() as u32).min(255);
        let size_log = 64 - total.leading_zeros();
        let spread = self
            .histogram
            .iter()
            .enumerate()
            .map(|(b, &n)| n * (b as u64).abs_diff(u64::from(mean)))
            .sum::<u64>()
            / total;
        let similarity = mean << 24 | distinct << 16 | size_log << 8 | (spread as u32 & 0xFF);

        let mut lsh = [0u8; 32];
        let trigrams: u64 = self.buckets.iter().sum();
        let threshold = trigrams / 256;
        for (i, &n) in self.buckets.iter().enumerate() {
            if n > threshold {
                lsh[i / 8] |= 1 << (i % 8);
            }
        }
        ScanFeatures { similarity, lsh }
    }
}

fn trigram_bucket(a: u8, b: u8, c: u8) -> usize {
    let h = (u32::from(a).wrapping_mul(0x0100_0193))
        ^ (u32::from(b).wrapping_mul(0x85EB_CA6B))
        ^ (u32::from(c).wrapping_mul(0xC2B2_AE35));
    ((h >> 13) & 0xFF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_cluster_similar_content() {
        let feed = |bytes: &[u8]| {
            let mut acc = FeatureAccumulator::new();
            acc.update(bytes);
            acc.finish()
        };
        let text_a = feed(&b"the quick brown fox jumps over the lazy dog ".repeat(100));
        let text_b = feed(&b"the quick brown fox jumps over the lazy cat ".repeat(100));
        let bin = feed(&(0..=255u8).collect::<Vec<_>>().repeat(20));

        let ab = lsh_similarity(&text_a.lsh, &text_b.lsh);
        let abin = lsh_similarity(&text_a.lsh, &bin.lsh);
        assert!(ab > abin, "{ab} <= {abin}");

        assert!(text_a.similarity.abs_diff(text_b.similarity)
            < text_a.similarity.abs_diff(bin.similarity));
    }

    #[test]
    fn empty_content_has_default_features() {
        let acc = FeatureAccumulator::new();
        let f = acc.finish();
        assert_eq!(f.similarity, 0);
        assert_eq!(f.lsh, [0u8; 32]);
    }
}
