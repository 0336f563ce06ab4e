//! Regular file scanning: hardlink folding, content digests and the
//! unique/shared inode split.
//!
//! `scan` runs during the tree walk and submits digest jobs to the worker
//! group; `finalize` runs after the workers drained and assigns content
//! classes, chunk-table rows and inode numbers.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::entry::EntryId;
use crate::inode_manager::{Digest, FeatureAccumulator, InodeManager, ScanFeatures};
use crate::options::{FileOrderMode, HashAlgorithm};
use crate::os::OsAccess;
use crate::progress::{Counter, Progress};
use crate::workers::WorkerGroup;
use crate::{ErrorInner, Result};

#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    digest: Option<Digest>,
    features: ScanFeatures,
}

/// Per-build file content scanner.
#[derive(Debug)]
pub struct FileScanner {
    hash_algo: Option<HashAlgorithm>,
    need_features: bool,
    /// `(dev, ino)` of a seen file -> its group.
    hardlinks: HashMap<(u64, u64), u32>,
    /// group -> digest/features, filled by scan workers.
    outcomes: Arc<Mutex<HashMap<u32, Outcome>>>,
    /// Unique file count, valid after [`FileScanner::finalize`].
    num_unique: u32,
}

impl FileScanner {
    pub fn new(hash_algo: Option<HashAlgorithm>, file_order: FileOrderMode) -> Self {
        Self {
            hash_algo,
            need_features: matches!(
                file_order,
                FileOrderMode::Similarity | FileOrderMode::Nilsimsa
            ),
            hardlinks: HashMap::new(),
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            num_unique: 0,
        }
    }

    /// Register one regular file entry. Returns the file group it belongs
    /// to, folding hardlinks by source `(dev, ino)`.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &mut self,
        im: &mut InodeManager,
        entry: EntryId,
        size: u64,
        link_id: (u64, u64),
        path: PathBuf,
        readable: bool,
        os: &Arc<dyn OsAccess>,
        wg: &WorkerGroup,
        progress: &Arc<Progress>,
    ) -> u32 {
        progress.files_scanned.bump();

        if link_id != (0, 0) {
            if let Some(&group) = self.hardlinks.get(&link_id) {
                progress.hardlinks.bump();
                progress.hardlink_size.add(size);
                return group;
            }
        }

        let group = im.push_group(entry, size);
        if link_id != (0, 0) {
            self.hardlinks.insert(link_id, group);
        }
        progress.original_size.add(size);

        if readable && size > 0 && (self.hash_algo.is_some() || self.need_features) {
            let hash_algo = self.hash_algo;
            let need_features = self.need_features;
            let outcomes = Arc::clone(&self.outcomes);
            let os = Arc::clone(os);
            let progress = Arc::clone(progress);
            wg.add_job(move || {
                let outcome = match digest_file(&*os, &path, hash_algo, need_features) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        log::error!("cannot read {}: {err}", path.display());
                        progress.errors.bump();
                        empty_outcome(hash_algo)
                    }
                };
                outcomes.lock().expect("not poisoned").insert(group, outcome);
            });
        } else {
            // Empty or unreadable content digests without touching the OS.
            self.outcomes
                .lock()
                .expect("not poisoned")
                .insert(group, empty_outcome(self.hash_algo));
        }
        group
    }

    /// The number of unique files after deduplication.
    pub fn num_unique(&self) -> u32 {
        self.num_unique
    }

    /// Fold duplicate content, assign chunk-table rows and inode numbers.
    ///
    /// Unique files take `[first_file_inode, first_file_inode + unique)`,
    /// all shared files follow grouped by class, so the shared-files vector
    /// is non-decreasing by construction. Returns the first inode after the
    /// file range.
    pub fn finalize(
        &mut self,
        im: &mut InodeManager,
        first_file_inode: u32,
        progress: &Progress,
    ) -> Result<u32> {
        let outcomes = std::mem::take(&mut *self.outcomes.lock().expect("not poisoned"));
        for (group, outcome) in outcomes {
            let g = im
                .groups
                .get_mut(group as usize)
                .ok_or(ErrorInner::Internal("scan outcome for an unknown group"))?;
            g.digest = outcome.digest;
            g.features = outcome.features;
        }

        // Content classes, in group discovery order.
        let mut class_by_digest: HashMap<Digest, u32> = HashMap::new();
        for group_idx in 0..im.groups.len() as u32 {
            let digest = im.groups[group_idx as usize].digest;
            let class_idx = match digest {
                Some(digest) => match class_by_digest.entry(digest) {
                    std::collections::hash_map::Entry::Occupied(ent) => {
                        let class_idx = *ent.get();
                        progress.duplicate_files.bump();
                        progress
                            .saved_by_deduplication
                            .add(im.groups[group_idx as usize].size);
                        im.classes[class_idx as usize].groups.push(group_idx);
                        im.groups[group_idx as usize].class = class_idx;
                        continue;
                    }
                    std::collections::hash_map::Entry::Vacant(ent) => {
                        let class_idx = im.classes.len() as u32;
                        ent.insert(class_idx);
                        class_idx
                    }
                },
                // Without a digest only identity (hardlink) folding applies.
                None => im.classes.len() as u32,
            };
            im.classes.push(crate::inode_manager::FileClass {
                groups: vec![group_idx],
                store_idx: u32::MAX,
            });
            im.groups[group_idx as usize].class = class_idx;
        }

        // Chunk-table rows: unique classes first.
        let num_unique = im.classes.iter().filter(|c| c.groups.len() == 1).count() as u32;
        self.num_unique = num_unique;
        let (mut next_unique, mut next_shared) = (0u32, num_unique);
        for class in &mut im.classes {
            if class.groups.len() == 1 {
                class.store_idx = next_unique;
                next_unique += 1;
            } else {
                class.store_idx = next_shared;
                next_shared += 1;
            }
        }

        // Inode numbers: unique groups, then shared groups by class.
        let mut ino = first_file_inode;
        for class_idx in 0..im.classes.len() {
            if im.classes[class_idx].groups.len() == 1 {
                im.groups[im.classes[class_idx].groups[0] as usize].inode = ino;
                ino += 1;
            }
        }
        for class_idx in 0..im.classes.len() {
            if im.classes[class_idx].groups.len() > 1 {
                for &g in &im.classes[class_idx].groups {
                    im.groups[g as usize].inode = ino;
                    ino += 1;
                }
            }
        }

        if ino - first_file_inode != im.groups.len() as u32 {
            bail_internal("file inode numbering mismatch")?;
        }
        Ok(ino)
    }
}

fn bail_internal(msg: &'static str) -> Result<()> {
    Err(ErrorInner::Internal(msg).into())
}

fn empty_outcome(hash_algo: Option<HashAlgorithm>) -> Outcome {
    Outcome {
        digest: hash_algo.map(|algo| Hasher::new(algo).finish()),
        features: ScanFeatures::default(),
    }
}

/// Streaming content digester for one algorithm.
enum Hasher {
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
    Sha(Box<sha2::Sha512_256>),
}

impl Hasher {
    fn new(algo: HashAlgorithm) -> Self {
        use sha2::Digest as _;
        match algo {
            HashAlgorithm::Xxh3_128 => Self::Xxh3(Box::default()),
            HashAlgorithm::Sha512_256 => Self::Sha(Box::new(sha2::Sha512_256::new())),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        use sha2::Digest as _;
        match self {
            Self::Xxh3(h) => h.update(chunk),
            Self::Sha(h) => h.update(chunk),
        }
    }

    fn finish(self) -> Digest {
        use sha2::Digest as _;
        let mut out = [0u8; 32];
        match self {
            Self::Xxh3(h) => out[..16].copy_from_slice(&h.digest128().to_le_bytes()),
            Self::Sha(h) => out.copy_from_slice(&h.finalize()),
        }
        Digest(out)
    }
}

fn digest_file(
    os: &dyn OsAccess,
    path: &std::path::Path,
    hash_algo: Option<HashAlgorithm>,
    need_features: bool,
) -> std::io::Result<Outcome> {
    let mut rdr = os.open(path)?;
    let mut hasher = hash_algo.map(Hasher::new);
    let mut features = need_features.then(FeatureAccumulator::new);
    let mut buf = vec![0u8; 64 << 10];
    loop {
        match rdr.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(h) = &mut hasher {
                    h.update(&buf[..n]);
                }
                if let Some(f) = &mut features {
                    f.update(&buf[..n]);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Outcome {
        digest: hasher.map(Hasher::finish),
        features: features.map(|f| f.finish()).unwrap_or_default(),
    })
}
