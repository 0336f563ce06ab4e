//! Image-wide deduplicating dictionaries.
//!
//! Names, symlink targets, owners, groups, modes and timestamps accumulate
//! while the tree is scanned; [`GlobalEntryData::index`] then fixes the final
//! table orders and all further access is read-only index lookup.
//!
//! String tables are ordered by (length descending, lexicographic), which
//! groups similar tails together and compresses better; numeric tables are
//! ordered by (frequency descending, value), so hot values get small
//! indices and the per-row index fields need fewer bits.

use std::collections::HashMap;

use indexmap::IndexSet;

/// One numeric dictionary with frequency counting.
#[derive(Debug, Default)]
struct NumTable {
    counts: HashMap<u32, u64>,
    ordered: Vec<u32>,
    index: HashMap<u32, u32>,
}

impl NumTable {
    fn add(&mut self, v: u32) {
        *self.counts.entry(v).or_default() += 1;
    }

    fn index_values(&mut self) {
        let mut pairs: Vec<(u32, u64)> = self.counts.drain().collect();
        pairs.sort_by(|(va, ca), (vb, cb)| cb.cmp(ca).then_with(|| va.cmp(vb)));
        self.ordered = pairs.into_iter().map(|(v, _)| v).collect();
        self.index = self
            .ordered
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as u32))
            .collect();
    }

    fn get(&self, v: u32) -> u32 {
        self.index[&v]
    }
}

/// One string dictionary.
#[derive(Debug, Default)]
struct StrTable {
    seen: IndexSet<String>,
    ordered: Vec<String>,
    index: HashMap<String, u32>,
}

impl StrTable {
    fn add(&mut self, s: &str) {
        if !self.seen.contains(s) {
            self.seen.insert(s.to_owned());
        }
    }

    fn index_values(&mut self) {
        let mut ordered: Vec<String> = self.seen.drain(..).collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self.index = ordered
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        self.ordered = ordered;
    }

    fn get(&self, s: &str) -> u32 {
        self.index[s]
    }
}

/// The dictionaries shared by every entry of one build.
#[derive(Debug)]
pub struct GlobalEntryData {
    time_resolution: u64,
    names: StrTable,
    links: StrTable,
    uids: NumTable,
    gids: NumTable,
    modes: NumTable,
    min_time: u64,
    /// Scaled minimum timestamp, valid after [`GlobalEntryData::index`].
    timestamp_base: u64,
}

impl GlobalEntryData {
    pub fn new(time_resolution_sec: u32) -> Self {
        Self {
            time_resolution: u64::from(time_resolution_sec.max(1)),
            names: StrTable::default(),
            links: StrTable::default(),
            uids: NumTable::default(),
            gids: NumTable::default(),
            modes: NumTable::default(),
            min_time: u64::MAX,
            timestamp_base: 0,
        }
    }

    pub fn add_name(&mut self, name: &str) {
        self.names.add(name);
    }

    pub fn add_link(&mut self, target: &str) {
        self.links.add(target);
    }

    pub fn add_uid(&mut self, uid: u32) {
        self.uids.add(uid);
    }

    pub fn add_gid(&mut self, gid: u32) {
        self.gids.add(gid);
    }

    pub fn add_mode(&mut self, mode: u32) {
        self.modes.add(mode);
    }

    pub fn add_time(&mut self, sec: u64) {
        self.min_time = self.min_time.min(sec);
    }

    /// Fix the table orders. Must be called exactly once, after the last
    /// `add_*`.
    pub fn index(&mut self) {
        self.names.index_values();
        self.links.index_values();
        self.uids.index_values();
        self.gids.index_values();
        self.modes.index_values();
        let min = if self.min_time == u64::MAX {
            0
        } else {
            self.min_time
        };
        self.timestamp_base = min / self.time_resolution;
    }

    pub fn name_index(&self, name: &str) -> u32 {
        self.names.get(name)
    }

    pub fn link_index(&self, target: &str) -> u32 {
        self.links.get(target)
    }

    pub fn uid_index(&self, uid: u32) -> u32 {
        self.uids.get(uid)
    }

    pub fn gid_index(&self, gid: u32) -> u32 {
        self.gids.get(gid)
    }

    pub fn mode_index(&self, mode: u32) -> u32 {
        self.modes.get(mode)
    }

    pub fn names(&self) -> &[String] {
        &self.names.ordered
    }

    pub fn links(&self) -> &[String] {
        &self.links.ordered
    }

    pub fn uids(&self) -> &[u32] {
        &self.uids.ordered
    }

    pub fn gids(&self) -> &[u32] {
        &self.gids.ordered
    }

    pub fn modes(&self) -> &[u32] {
        &self.modes.ordered
    }

    /// The scaled timestamp base stored in the image.
    pub fn timestamp_base(&self) -> u64 {
        self.timestamp_base
    }

    /// Scale a raw timestamp into an offset from the base.
    pub fn time_offset(&self, sec: u64) -> u32 {
        u32::try_from(sec / self.time_resolution - self.timestamp_base).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_tables_order_by_frequency() {
        let mut ge = GlobalEntryData::new(1);
        for uid in [1000, 0, 1000, 1000, 0, 500] {
            ge.add_uid(uid);
        }
        ge.index();
        assert_eq!(ge.uids(), [1000, 0, 500]);
        assert_eq!(ge.uid_index(1000), 0);
        assert_eq!(ge.uid_index(500), 2);
    }

    #[test]
    fn names_order_by_length_then_bytes() {
        let mut ge = GlobalEntryData::new(1);
        for name in ["bb", "a", "ccc", "ba", "a"] {
            ge.add_name(name);
        }
        ge.index();
        assert_eq!(ge.names(), ["ccc", "ba", "bb", "a"]);
        assert_eq!(ge.name_index("bb"), 2);
    }

    #[test]
    fn time_base_and_offsets() {
        let mut ge = GlobalEntryData::new(10);
        ge.add_time(4711);
        ge.add_time(4001);
        ge.index();
        assert_eq!(ge.timestamp_base(), 400);
        assert_eq!(ge.time_offset(4711), 71 - 40);
        assert_eq!(ge.time_offset(4001), 0);
    }
}
