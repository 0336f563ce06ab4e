//! The build orchestrator.
//!
//! `scan` drives the whole pipeline: walk the input (or resolve a path
//! list), assign inode numbers in partition order, drain the file scan
//! workers, feed ordered content through the block manager, and finally
//! assemble, pack and freeze the metadata.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::num::NonZero;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bstr::BString;
use dwarfs_img::metadata::{self, Metadata};

use crate::block_manager::BlockManager;
use crate::entry::{EntryArena, EntryData, EntryId};
use crate::file_scanner::FileScanner;
use crate::global_data::GlobalEntryData;
use crate::inode_manager::InodeManager;
use crate::options::{BlockManagerConfig, BuildScript, FilterEntry, ScannerOptions};
use crate::os::{EntryStat, FileKind, OsAccess};
use crate::progress::{Counter, Progress};
use crate::string_table::{self, PackOptions};
use crate::workers::WorkerGroup;
use crate::writer::ImageWriter;
use crate::{ErrorInner, Result};

/// The image builder.
pub struct Scanner {
    config: BlockManagerConfig,
    options: ScannerOptions,
    script: Option<Box<dyn BuildScript>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("script", &self.script.is_some())
            .finish()
    }
}

impl Scanner {
    pub fn new(config: BlockManagerConfig, options: ScannerOptions) -> Result<Self> {
        Self::new_inner(config, options, None)
    }

    /// Attach a filter/transform/order script.
    pub fn new_with_script(
        config: BlockManagerConfig,
        options: ScannerOptions,
        script: Box<dyn BuildScript>,
    ) -> Result<Self> {
        Self::new_inner(config, options, Some(script))
    }

    fn new_inner(
        config: BlockManagerConfig,
        options: ScannerOptions,
        script: Option<Box<dyn BuildScript>>,
    ) -> Result<Self> {
        if !(10..=30).contains(&config.block_size_bits) {
            bail!(ErrorInner::Config("block_size_bits must be within 10..=30"));
        }
        if options.time_resolution_sec == 0 {
            bail!(ErrorInner::Config("time_resolution_sec must be non-zero"));
        }
        if options.workers == 0 {
            bail!(ErrorInner::Config("at least one worker is required"));
        }
        if options.file_order == crate::options::FileOrderMode::Script && script.is_none() {
            bail!(ErrorInner::Config("script file order requires a script"));
        }
        Ok(Self {
            config,
            options,
            script,
        })
    }

    /// Build an image of the tree under `root_path` into `writer`.
    ///
    /// With `input_list`, only the listed paths (and their ancestor
    /// directories) are materialized instead of walking recursively; filters
    /// are rejected in this mode and unresolvable paths are fatal.
    ///
    /// Returns the writer's sink after the image is complete.
    pub fn scan<W: Write>(
        &self,
        os: Arc<dyn OsAccess>,
        root_path: &Path,
        mut writer: ImageWriter<W>,
        progress: &Arc<Progress>,
        input_list: Option<&[PathBuf]>,
    ) -> Result<W> {
        let has_filter = self.script.as_deref().is_some_and(|s| s.has_filter());
        if input_list.is_some() && has_filter {
            bail!(ErrorInner::InvalidInput(
                "filters cannot be combined with an input list".into()
            ));
        }

        log::info!("scanning {}", root_path.display());
        let wg = WorkerGroup::new(
            "scan",
            NonZero::new(self.options.workers).expect("validated"),
        )?;
        let mut arena = EntryArena::new();
        let mut im = InodeManager::new();
        let mut fscan = FileScanner::new(self.options.file_hash_algorithm, self.options.file_order);

        //// Phase 1: the entry tree. ////

        let mut root_stat = os.symlink_metadata(root_path)?;
        if root_stat.kind != FileKind::Directory {
            bail!(ErrorInner::InvalidInput(format!(
                "'{}' must be a directory",
                root_path.display()
            )));
        }
        if let Some(script) = &self.script {
            script.transform(&mut root_stat);
        }
        self.apply_overrides(&mut root_stat);
        let root = arena.push(
            String::new(),
            root_stat,
            None,
            EntryData::Directory {
                children: Vec::new(),
            },
        );
        progress.dirs_found.bump();

        {
            let mut ctx = ScanCtx {
                scanner: self,
                os: &os,
                root_path,
                arena: &mut arena,
                im: &mut im,
                fscan: &mut fscan,
                wg: &wg,
                progress,
            };
            match input_list {
                None => ctx.scan_tree(root)?,
                Some(list) => ctx.scan_list(root, list)?,
            }
        }

        if self.options.remove_empty_dirs {
            log::info!("removing empty directories");
            arena.remove_empty_dirs();
        }

        //// Phase 2: inode numbers in partition order. ////

        log::info!("assigning directory and link inodes");
        arena.sort_children();
        let order = arena.preorder(root);

        let mut next_inode = 0u32;
        for &id in &order {
            if matches!(arena[id].data, EntryData::Directory { .. }) {
                arena[id].inode = next_inode;
                next_inode += 1;
            }
        }
        let first_link_inode = next_inode;
        for &id in &order {
            if matches!(arena[id].data, EntryData::Symlink { .. }) {
                arena[id].inode = next_inode;
                next_inode += 1;
            }
        }
        let first_file_inode = next_inode;

        log::info!("waiting for background scanners");
        wg.wait();

        log::info!("finalizing file inodes");
        let first_device_inode = fscan.finalize(&mut im, first_file_inode, progress)?;
        for &id in &order {
            if let EntryData::File { group } = arena[id].data {
                arena[id].inode = im.groups()[group as usize].inode;
            }
        }

        log::info!("assigning device inodes");
        let mut next_inode = first_device_inode;
        let mut devices = Vec::new();
        for &id in &order {
            if matches!(arena[id].data, EntryData::Device) {
                arena[id].inode = next_inode;
                next_inode += 1;
                devices.push(arena[id].stat.rdev);
            }
        }
        for &id in &order {
            if matches!(arena[id].data, EntryData::Ipc) {
                arena[id].inode = next_inode;
                next_inode += 1;
            }
        }
        let inode_cnt = next_inode;

        //// Phase 3: global dictionaries. ////

        log::info!("saving names and symlinks");
        let mut ge = GlobalEntryData::new(self.options.time_resolution_sec);
        for &id in &order {
            let ent = &arena[id];
            if ent.parent.is_some() {
                ge.add_name(&ent.name);
            }
            if let EntryData::Symlink { target } = &ent.data {
                ge.add_link(target);
            }
            ge.add_uid(ent.stat.uid);
            ge.add_gid(ent.stat.gid);
            ge.add_mode(ent.stat.mode());
            ge.add_time(ent.stat.mtime);
            if self.options.keep_all_times {
                ge.add_time(ent.stat.atime);
                ge.add_time(ent.stat.ctime);
            }
        }
        ge.index();

        //// Phase 4: ordered content through the block manager. ////

        log::info!("building blocks");
        let class_order = im.order_classes(self.options.file_order, self.script.as_deref(), &arena);
        let chunks_by_class = self.blockify(
            &os,
            root_path,
            &arena,
            &im,
            &class_order,
            &mut writer,
            progress,
        )?;

        //// Phase 5: metadata assembly. ////

        log::info!("building metadata");
        let mv = self.build_metadata(BuildInputs {
            arena: &arena,
            im: &im,
            fscan: &fscan,
            ge: &ge,
            order: &order,
            chunks_by_class,
            first_link_inode,
            first_file_inode,
            inode_cnt,
            devices,
            progress,
        })?;

        let (schema, data) = mv.to_schema_and_bytes()?;
        writer.write_metadata_sections(&schema.to_bytes(), &data)?;

        log::info!(
            "compressed {} bytes to {} bytes",
            progress.original_size.get(),
            progress.compressed_size.get(),
        );
        writer.finish()
    }

    fn apply_overrides(&self, stat: &mut EntryStat) {
        if let Some(uid) = self.options.uid {
            stat.uid = uid;
        }
        if let Some(gid) = self.options.gid {
            stat.gid = gid;
        }
        if let Some(ts) = self.options.timestamp {
            stat.atime = ts;
            stat.mtime = ts;
            stat.ctime = ts;
        }
    }

    /// Feed class contents to the block manager in the declared order.
    ///
    /// The ordering runs on its own thread pushing class ids through a
    /// bounded queue and pacing itself on a synthetic load value; the
    /// blockify consumer runs here, so the writer never crosses threads.
    #[allow(clippy::too_many_arguments)]
    fn blockify<W: Write>(
        &self,
        os: &Arc<dyn OsAccess>,
        root_path: &Path,
        arena: &EntryArena,
        im: &InodeManager,
        class_order: &[u32],
        writer: &mut ImageWriter<W>,
        progress: &Arc<Progress>,
    ) -> Result<Vec<Vec<metadata::Chunk>>> {
        let mut chunks_by_class: Vec<Option<Vec<metadata::Chunk>>> = Vec::new();
        chunks_by_class.resize_with(im.class_count(), || None);

        std::thread::scope(|s| -> Result<()> {
            let (tx, rx) = crossbeam_channel::bounded::<u32>(64);
            let ordering = s.spawn({
                let progress = Arc::clone(progress);
                move || {
                    for &class in class_order {
                        if tx.send(class).is_err() {
                            return;
                        }
                        let queued_files = tx.len() as u64;
                        let queued_blocks = progress.compress_queue.get();
                        progress.blockify_queue.put(queued_files);
                        if 500 * queued_blocks + queued_files > 1000 {
                            std::thread::sleep(Duration::from_micros(500));
                        }
                    }
                }
            });

            let mut bm = BlockManager::new(&self.config, writer, progress);
            for class in rx {
                let group = &im.groups()[im.classes()[class as usize].groups[0] as usize];
                let content = if group.size == 0 {
                    Vec::new()
                } else {
                    let path = arena.full_path(root_path, group.rep_entry);
                    match read_file(&**os, &path) {
                        Ok(content) => content,
                        Err(err) => {
                            log::error!("cannot read {}: {err}", path.display());
                            progress.errors.bump();
                            Vec::new()
                        }
                    }
                };
                let chunks = bm.add_inode(&content)?;
                chunks_by_class[class as usize] = Some(chunks);
                progress.inodes_written.bump();
            }
            bm.finish_blocks()?;
            progress.blockify_queue.put(0);
            ordering.join().expect("ordering thread never panics");
            Ok(())
        })?;

        chunks_by_class
            .into_iter()
            .map(|c| c.ok_or_else(|| ErrorInner::Internal("class was never blockified").into()))
            .collect()
    }

    fn build_metadata(&self, inp: BuildInputs<'_>) -> Result<Metadata> {
        let opts = &self.options;
        let mtime_only = !opts.keep_all_times;
        let mut mv = Metadata::default();

        //// Inode rows. ////

        let mut row_entry = vec![EntryId(0); inp.inode_cnt as usize];
        for &id in inp.order {
            row_entry[inp.arena[id].inode as usize] = id;
        }
        mv.inodes = row_entry
            .iter()
            .map(|&id| {
                let st = &inp.arena[id].stat;
                metadata::InodeData {
                    mode_index: inp.ge.mode_index(st.mode()),
                    owner_index: inp.ge.uid_index(st.uid),
                    group_index: inp.ge.gid_index(st.gid),
                    atime_offset: if mtime_only { 0 } else { inp.ge.time_offset(st.atime) },
                    mtime_offset: inp.ge.time_offset(st.mtime),
                    ctime_offset: if mtime_only { 0 } else { inp.ge.time_offset(st.ctime) },
                }
            })
            .collect();

        //// Directories and entries. ////

        log::info!("saving directories");
        let num_dirs = inp.first_link_inode as usize;
        mv.directories = vec![metadata::Directory::default(); num_dirs + 1];
        // Entry 0 is the root's self entry; its name index is unused.
        mv.dir_entries.push(metadata::DirEntry {
            name_index: 0,
            inode_num: 0,
        });
        let mut self_entry = vec![0u32; num_dirs];
        for d in 0..num_dirs {
            let dir_id = row_entry[d];
            mv.directories[d].first_entry = mv.dir_entries.len() as u32;
            let EntryData::Directory { children } = &inp.arena[dir_id].data else {
                bail!(ErrorInner::Internal("directory inode without a directory"));
            };
            for &c in children {
                let ent_idx = mv.dir_entries.len() as u32;
                let child = &inp.arena[c];
                mv.dir_entries.push(metadata::DirEntry {
                    name_index: inp.ge.name_index(&child.name),
                    inode_num: child.inode,
                });
                if matches!(child.data, EntryData::Directory { .. }) {
                    self_entry[child.inode as usize] = ent_idx;
                    mv.directories[child.inode as usize].parent_entry = self_entry[d];
                }
            }
        }
        mv.directories[num_dirs].first_entry = mv.dir_entries.len() as u32;

        //// Symlink table. ////

        mv.symlink_table = vec![0; (inp.first_file_inode - inp.first_link_inode) as usize];
        for &id in inp.order {
            if let EntryData::Symlink { target } = &inp.arena[id].data {
                let slot = inp.arena[id].inode - inp.first_link_inode;
                mv.symlink_table[slot as usize] = inp.ge.link_index(target);
            }
        }

        //// Chunks. ////

        log::info!("saving chunks");
        let class_cnt = inp.im.class_count();
        let mut store_to_class = vec![u32::MAX; class_cnt];
        for (ci, class) in inp.im.classes().iter().enumerate() {
            store_to_class[class.store_idx as usize] = ci as u32;
        }
        let mut chunks_by_class = inp.chunks_by_class;
        mv.chunk_table = Vec::with_capacity(class_cnt + 1);
        for &class in &store_to_class {
            mv.chunk_table.push(mv.chunks.len() as u32);
            mv.chunks
                .append(&mut chunks_by_class[class as usize]);
        }
        mv.chunk_table.push(mv.chunks.len() as u32);
        inp.progress.chunk_count.put(mv.chunks.len() as u64);

        //// Shared files. ////

        let num_unique = inp.fscan.num_unique();
        let begin_shared = inp.first_file_inode + num_unique;
        let shared_cnt = inp.im.groups().len() as u32 - num_unique;
        let mut shared = vec![0u32; shared_cnt as usize];
        for group in inp.im.groups() {
            if group.inode >= begin_shared {
                let store = inp.im.classes()[group.class as usize].store_idx;
                shared[(group.inode - begin_shared) as usize] = store - num_unique;
            }
        }
        if !shared.is_sorted() {
            bail!(ErrorInner::Internal("shared files vector is not sorted"));
        }
        if !shared.is_empty() {
            mv.shared_files_table = Some(if opts.pack_shared_files_table {
                pack_shared_files(&shared)?
            } else {
                shared
            });
        }

        //// String tables. ////

        if opts.plain_names_table {
            mv.names = inp.ge.names().iter().map(|s| BString::from(s.as_str())).collect();
        } else {
            mv.compact_names = Some(string_table::build(
                inp.ge.names(),
                PackOptions {
                    pack_data: opts.pack_names,
                    pack_index: opts.pack_names_index,
                    force: opts.force_pack_string_tables,
                },
            ));
        }
        if opts.plain_symlinks_table {
            mv.symlinks = inp.ge.links().iter().map(|s| BString::from(s.as_str())).collect();
        } else {
            mv.compact_symlinks = Some(string_table::build(
                inp.ge.links(),
                PackOptions {
                    pack_data: opts.pack_symlinks,
                    pack_index: opts.pack_symlinks_index,
                    force: opts.force_pack_string_tables,
                },
            ));
        }

        //// Scalars, options and packing transforms. ////

        mv.uids = inp.ge.uids().to_vec();
        mv.gids = inp.ge.gids().to_vec();
        mv.modes = inp.ge.modes().to_vec();
        mv.timestamp_base = inp.ge.timestamp_base();
        mv.block_size = self.config.block_size();
        mv.total_fs_size = inp.progress.original_size.get();
        mv.total_hardlink_size = Some(inp.progress.hardlink_size.get());
        mv.devices = (!inp.devices.is_empty()).then_some(inp.devices);
        mv.dwarfs_version = Some(concat!("dwarfs-mk ", env!("CARGO_PKG_VERSION")).into());
        mv.create_timestamp = (!opts.no_create_timestamp).then(|| {
            opts.create_timestamp.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs())
            })
        });
        mv.options = Some(metadata::FsOptions {
            mtime_only,
            time_resolution_sec: (opts.time_resolution_sec != 1).then_some(opts.time_resolution_sec),
            packed_chunk_table: opts.pack_chunk_table,
            packed_directories: opts.pack_directories,
            packed_shared_files_table: opts.pack_shared_files_table,
        });

        if opts.pack_directories {
            let mut last = 0u32;
            for d in &mut mv.directories {
                let cur = d.first_entry;
                d.first_entry = cur - last;
                d.parent_entry = 0;
                last = cur;
            }
        }
        if opts.pack_chunk_table {
            let mut last = 0u32;
            for c in &mut mv.chunk_table {
                let cur = *c;
                *c = cur - last;
                last = cur;
            }
        }

        Ok(mv)
    }
}

struct BuildInputs<'a> {
    arena: &'a EntryArena,
    im: &'a InodeManager,
    fscan: &'a FileScanner,
    ge: &'a GlobalEntryData,
    order: &'a [EntryId],
    chunks_by_class: Vec<Vec<metadata::Chunk>>,
    first_link_inode: u32,
    first_file_inode: u32,
    inode_cnt: u32,
    devices: Vec<u64>,
    progress: &'a Arc<Progress>,
}

/// Run-length encode the shared-files vector: one `count - 2` per run. Every
/// run has at least two members, one per inode of a shared class.
fn pack_shared_files(shared: &[u32]) -> Result<Vec<u32>> {
    let mut packed = Vec::new();
    let mut run_value = 0u32;
    let mut run_len = 0u32;
    for &v in shared {
        if v == run_value {
            run_len += 1;
        } else {
            if v != run_value + 1 || run_len < 2 {
                bail!(ErrorInner::Internal("malformed shared files run"));
            }
            packed.push(run_len - 2);
            run_value = v;
            run_len = 1;
        }
    }
    if run_len < 2 {
        bail!(ErrorInner::Internal("malformed shared files run"));
    }
    packed.push(run_len - 2);
    Ok(packed)
}

/// Mutable state threaded through the tree walk.
struct ScanCtx<'a> {
    scanner: &'a Scanner,
    os: &'a Arc<dyn OsAccess>,
    root_path: &'a Path,
    arena: &'a mut EntryArena,
    im: &'a mut InodeManager,
    fscan: &'a mut FileScanner,
    wg: &'a WorkerGroup,
    progress: &'a Arc<Progress>,
}

impl ScanCtx<'_> {
    /// Breadth-first walk over the whole tree.
    fn scan_tree(&mut self, root: EntryId) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back((root, String::new()));
        while let Some((dir_id, dir_rel)) = queue.pop_front() {
            let dir_path = self.root_path.join(&dir_rel);
            let mut names = match self.os.read_dir(&dir_path) {
                Ok(names) => names,
                Err(err) => {
                    log::error!("cannot open directory {}: {err}", dir_path.display());
                    self.progress.errors.bump();
                    continue;
                }
            };
            // Deterministic discovery independent of the OS listing order.
            names.sort_unstable();

            let mut subdirs = Vec::new();
            for name in names {
                if name == "." || name == ".." {
                    continue;
                }
                if let Some(id) = self.add_entry(dir_id, &dir_rel, &name)? {
                    if matches!(self.arena[id].data, EntryData::Directory { .. }) {
                        subdirs.push((id, join_rel(&dir_rel, &name)));
                    }
                }
            }
            for sub in subdirs.into_iter().rev() {
                queue.push_front(sub);
            }
            self.progress.dirs_scanned.bump();
        }
        Ok(())
    }

    /// Materialize exactly the listed paths plus their ancestors.
    fn scan_list(&mut self, root: EntryId, list: &[PathBuf]) -> Result<()> {
        let invalid =
            |p: &Path| ErrorInner::InvalidInput(format!("invalid path '{}'", p.display()));
        for path in list {
            let mut components = Vec::new();
            for comp in path.components() {
                match comp {
                    Component::Normal(c) => {
                        components.push(c.to_str().ok_or_else(|| invalid(path))?)
                    }
                    Component::CurDir => {}
                    _ => bail!(invalid(path)),
                }
            }
            let Some((&last, ancestors)) = components.split_last() else {
                continue;
            };

            let mut cur = root;
            let mut cur_rel = String::new();
            for &comp in ancestors {
                cur = match self.arena.find_child(cur, comp) {
                    Some(child) => {
                        if !matches!(self.arena[child].data, EntryData::Directory { .. }) {
                            bail!(invalid(path));
                        }
                        child
                    }
                    None => {
                        let added = self.add_entry(cur, &cur_rel, comp)?;
                        match added {
                            Some(id)
                                if matches!(
                                    self.arena[id].data,
                                    EntryData::Directory { .. }
                                ) =>
                            {
                                self.progress.dirs_scanned.bump();
                                id
                            }
                            _ => bail!(invalid(path)),
                        }
                    }
                };
                cur_rel = join_rel(&cur_rel, comp);
            }

            if self.arena.find_child(cur, last).is_some() {
                continue;
            }
            match self.add_entry(cur, &cur_rel, last)? {
                Some(id) => {
                    if matches!(self.arena[id].data, EntryData::Directory { .. }) {
                        self.progress.dirs_scanned.bump();
                    }
                }
                None => bail!(invalid(path)),
            }
        }
        Ok(())
    }

    /// Stat, filter, transform and insert one entry. `Ok(None)` means the
    /// entry was excluded or could not be read (already counted).
    fn add_entry(&mut self, parent: EntryId, parent_rel: &str, name: &str) -> Result<Option<EntryId>> {
        let rel = join_rel(parent_rel, name);
        let path = self.root_path.join(&rel);
        let opts = &self.scanner.options;

        let mut stat = match self.os.symlink_metadata(&path) {
            Ok(stat) => stat,
            Err(err) => {
                log::error!("error reading entry {}: {err}", path.display());
                self.progress.errors.bump();
                return Ok(None);
            }
        };

        if let Some(script) = &self.scanner.script {
            if script.has_filter() {
                let keep = script.filter(&FilterEntry {
                    name,
                    path: &rel,
                    is_dir: stat.kind == FileKind::Directory,
                    size: stat.size,
                });
                if !keep {
                    log::debug!("excluding {rel}");
                    return Ok(None);
                }
            }
            script.transform(&mut stat);
        }
        self.scanner.apply_overrides(&mut stat);

        let mut readable = true;
        match stat.kind {
            FileKind::File => {
                readable = self.os.access_ok(&path);
                if !readable {
                    log::error!("cannot access {}, creating empty file", path.display());
                    stat.size = 0;
                    self.progress.errors.bump();
                }
            }
            FileKind::BlockDevice | FileKind::CharDevice if !opts.with_devices => {
                return Ok(None);
            }
            FileKind::Fifo | FileKind::Socket if !opts.with_specials => {
                return Ok(None);
            }
            _ => {}
        }

        let data = match stat.kind {
            FileKind::Directory => EntryData::Directory {
                children: Vec::new(),
            },
            FileKind::File => EntryData::File { group: u32::MAX },
            FileKind::Symlink => {
                let target = match self.os.read_link(&path) {
                    Ok(target) => target,
                    Err(err) => {
                        log::error!("cannot read symlink {}: {err}", path.display());
                        self.progress.errors.bump();
                        return Ok(None);
                    }
                };
                self.progress.symlink_size.add(target.len() as u64);
                EntryData::Symlink { target }
            }
            FileKind::BlockDevice | FileKind::CharDevice => EntryData::Device,
            FileKind::Fifo | FileKind::Socket => EntryData::Ipc,
        };

        let link_id = (stat.dev, stat.ino);
        let size = stat.size;
        let kind = stat.kind;
        let id = self.arena.push(name.to_owned(), stat, Some(parent), data);
        match kind {
            FileKind::Directory => self.progress.dirs_found.bump(),
            FileKind::File => {
                self.progress.files_found.bump();
                let group = self.fscan.scan(
                    self.im,
                    id,
                    size,
                    link_id,
                    path,
                    readable,
                    self.os,
                    self.wg,
                    self.progress,
                );
                self.arena[id].data = EntryData::File { group };
            }
            FileKind::Symlink => {
                self.progress.symlinks_found.bump();
                self.progress.symlinks_scanned.bump();
            }
            _ => self.progress.specials_found.bump(),
        }
        Ok(Some(id))
    }
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

fn read_file(os: &dyn OsAccess, path: &Path) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    os.open(path)?.read_to_end(&mut out)?;
    Ok(out)
}
