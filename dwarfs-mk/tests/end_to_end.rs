//! End-to-end build/read tests over the in-memory OS tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dwarfs_img::section::CompressAlgo;
use dwarfs_img::{Archive, AsChunks, InodeKind};
use dwarfs_mk::options::{
    BlockManagerConfig, BuildScript, FileOrderMode, FilterEntry, HashAlgorithm, ScannerOptions,
};
use dwarfs_mk::os::MemoryOs;
use dwarfs_mk::progress::{Counter, Progress};
use dwarfs_mk::scanner::Scanner;
use dwarfs_mk::writer::{CompressParam, ImageWriter};

const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, \
    sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. ";

fn lorem_ipsum(len: usize) -> Vec<u8> {
    LOREM.bytes().cycle().take(len).collect()
}

/// Deterministic pseudo-random bytes (xorshift*), incompressible enough.
fn random_bytes(mut seed: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let word = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// The fixed tree of the end-to-end scenarios: 8 regular files (one hardlink
/// pair, three content duplicates), 2 directories, 2 symlinks, 2 char
/// devices and a fifo.
fn test_tree() -> MemoryOs {
    let mut os = MemoryOs::new();
    os.add_dir("");
    os.add_file("bar.pl", lorem_ipsum(23456));
    os.add_hard_link("foo.pl", "bar.pl");
    os.add_file("baz.pl", lorem_ipsum(23456));
    os.add_file("test.pl", lorem_ipsum(1024));
    os.add_file("alpha.py", lorem_ipsum(10000));
    os.add_file("beta.py", lorem_ipsum(10000));
    os.add_symlink("somelink", "somedir/ipsum.py");
    os.add_dir("somedir");
    os.add_file("somedir/ipsum.py", lorem_ipsum(10000));
    os.add_symlink("somedir/bad", "../foo");
    os.add_file("somedir/empty", Vec::new());
    os.add_char_device("somedir/null", 259);
    os.add_char_device("somedir/zero", 261);
    os.add_fifo("somedir/pipe");

    os.stat_mut("foo.pl").atime = 4001;
    os.stat_mut("foo.pl").mtime = 4002;
    os.stat_mut("foo.pl").ctime = 4003;
    os
}

fn full_options() -> ScannerOptions {
    ScannerOptions {
        with_devices: true,
        with_specials: true,
        pack_chunk_table: true,
        pack_directories: true,
        pack_shared_files_table: true,
        pack_names: true,
        pack_names_index: true,
        pack_symlinks: true,
        pack_symlinks_index: true,
        force_pack_string_tables: true,
        no_create_timestamp: true,
        ..ScannerOptions::default()
    }
}

fn build_image(
    os: MemoryOs,
    config: BlockManagerConfig,
    options: ScannerOptions,
    compress: CompressParam,
    list: Option<&[PathBuf]>,
) -> (Vec<u8>, Arc<Progress>) {
    let scanner = Scanner::new(config, options).unwrap();
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(Vec::new(), compress, &progress).unwrap();
    let image = scanner
        .scan(Arc::new(os), Path::new(""), writer, &progress, list)
        .unwrap();
    (image, progress)
}

fn reader_config() -> dwarfs_img::archive::Config {
    dwarfs_img::archive::Config::default().check_consistency(true)
}

#[test]
fn end_to_end_basics() {
    let os = test_tree();
    let node_count = os.len();
    let (image, progress) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 16,
        },
        full_options(),
        CompressParam::None,
        None,
    );

    assert_eq!(progress.files_found.get(), 8);
    assert_eq!(progress.files_scanned.get(), 8);
    assert_eq!(progress.dirs_found.get(), 2);
    assert_eq!(progress.dirs_scanned.get(), 2);
    assert_eq!(progress.symlinks_found.get(), 2);
    assert_eq!(progress.symlinks_scanned.get(), 2);
    assert_eq!(progress.specials_found.get(), 3);
    assert_eq!(progress.hardlinks.get(), 1);
    assert_eq!(progress.hardlink_size.get(), 23456);
    assert_eq!(progress.duplicate_files.get(), 3);
    assert_eq!(progress.saved_by_deduplication.get(), 23456 + 10000 + 10000);
    assert_eq!(progress.original_size.get(), 77936);
    assert_eq!(progress.errors.get(), 0);
    assert!(progress.saved_by_segmentation.get() > 10000);
    assert!(progress.blocks_written.get() >= 1);

    let (index, mut archive) = Archive::new_with_config(
        image.clone(),
        &reader_config().enable_nlink(true),
    )
    .unwrap();

    // The hardlink pair shares an inode and reports two links.
    let foo = index.get_path(["foo.pl"]).unwrap();
    let bar = index.get_path(["bar.pl"]).unwrap();
    assert_eq!(foo.inode_num(), bar.inode_num());
    assert_eq!(foo.metadata().nlink(), 2);
    assert_eq!(bar.metadata().nlink(), 2);

    // Duplicate content shares chunks but not the inode.
    let baz = index.get_path(["baz.pl"]).unwrap();
    assert_ne!(baz.inode_num(), foo.inode_num());
    let chunk_list = |inode: dwarfs_img::Inode<'_>| {
        inode
            .as_file()
            .unwrap()
            .as_chunks()
            .map(|c| (c.block_idx(), c.offset(), c.size()))
            .collect::<Vec<_>>()
    };
    assert_eq!(chunk_list(foo), chunk_list(baz));

    // Symlinks round-trip.
    let somelink = index.get_path(["somelink"]).unwrap();
    let InodeKind::Symlink(somelink) = somelink.classify() else {
        panic!("wrong inode kind");
    };
    assert_eq!(somelink.target(), "somedir/ipsum.py");
    let InodeKind::Symlink(bad) = index.get_path(["somedir", "bad"]).unwrap().classify() else {
        panic!("wrong inode kind");
    };
    assert_eq!(bad.target(), "../foo");

    // Devices.
    let InodeKind::Device(null) = index.get_path(["somedir", "null"]).unwrap().classify() else {
        panic!("wrong inode kind");
    };
    assert_eq!(null.device_id(), 259);
    let InodeKind::Device(zero) = index.get_path(["somedir", "zero"]).unwrap().classify() else {
        panic!("wrong inode kind");
    };
    assert_eq!(zero.device_id(), 261);
    assert!(matches!(
        index.get_path(["somedir", "pipe"]).unwrap().classify(),
        InodeKind::Ipc(_)
    ));

    // readdir with synthesized dot entries.
    let root = index.root();
    assert_eq!(root.dir_size(), 10);
    let listing: Vec<String> = root.read_dir().map(|(name, _)| name.to_string()).collect();
    assert_eq!(
        listing,
        [
            ".", "..", "alpha.py", "bar.pl", "baz.pl", "beta.py", "foo.pl", "somedir", "somelink",
            "test.pl",
        ]
    );
    assert!(root.get("nope").is_none());

    // stat projection: mtime-only build falls atime/ctime back to mtime.
    let meta = foo.metadata();
    assert_eq!(meta.mtime(), 4002);
    assert_eq!(meta.atime(), 4002);
    assert_eq!(meta.ctime(), 4002);
    assert_eq!(meta.uid(), 1000);
    assert_eq!(meta.gid(), 100);

    // Content reads, sequential and positional.
    let expect = lorem_ipsum(23456);
    let foo_file = foo.as_file().unwrap();
    assert_eq!(foo_file.read_to_vec(&mut archive).unwrap(), expect);
    assert_eq!(foo.size(), 23456);
    let mut buf = [0u8; 100];
    let n = foo_file.read_at(&mut archive, 23000, &mut buf).unwrap();
    assert_eq!(n, 100);
    assert_eq!(&buf[..], &expect[23000..23100]);
    let n = foo_file.read_at(&mut archive, 23400, &mut buf).unwrap();
    assert_eq!(n, 56);
    assert_eq!(&buf[..n], &expect[23400..]);

    assert_eq!(
        index
            .get_path(["somedir", "empty"])
            .unwrap()
            .as_file()
            .unwrap()
            .read_to_vec(&mut archive)
            .unwrap(),
        Vec::<u8>::new()
    );

    // statvfs totals.
    let vfs = index.statvfs();
    assert_eq!(vfs.block_size, 1 << 15);
    assert_eq!(vfs.frag_size, 1);
    assert_eq!(vfs.files, 14);
    assert_eq!(vfs.blocks, 77936);
    assert!(vfs.read_only);

    // Without nlink accounting, hardlinked bytes count once per link.
    let (index2, _) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    assert_eq!(index2.statvfs().blocks, 77936 + 23456);
    assert_eq!(index2.get_path(["foo.pl"]).unwrap().metadata().nlink(), 1);

    // walk visits every entry exactly once.
    let mut paths = Vec::new();
    index.walk(|path, _| paths.push(path.to_string()));
    assert_eq!(paths.len(), node_count);
    assert!(paths.contains(&String::new()));
    assert!(paths.contains(&"somedir/ipsum.py".to_string()));
}

#[test]
fn end_to_end_access_fail() {
    let mut os = test_tree();
    os.set_access_fail("somedir/ipsum.py");
    let (image, progress) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 16,
        },
        full_options(),
        CompressParam::None,
        None,
    );

    assert_eq!(progress.errors.get(), 1);
    assert_eq!(progress.files_found.get(), 8);
    assert_eq!(progress.original_size.get(), 67936);
    // ipsum.py now duplicates the empty file.
    assert_eq!(progress.duplicate_files.get(), 3);

    let (index, mut archive) = Archive::new_with_config(
        image.clone(),
        &reader_config().enable_nlink(true),
    )
    .unwrap();
    let ipsum = index.get_path(["somedir", "ipsum.py"]).unwrap();
    assert_eq!(ipsum.size(), 0);
    assert_eq!(
        ipsum.as_file().unwrap().read_to_vec(&mut archive).unwrap(),
        Vec::<u8>::new()
    );
    assert_eq!(index.statvfs().blocks, 67936);
}

#[test]
fn empty_fs_under_every_packing_combination() {
    for mask in 0u32..128 {
        let options = ScannerOptions {
            pack_chunk_table: mask & 1 != 0,
            pack_directories: mask & 2 != 0,
            pack_shared_files_table: mask & 4 != 0,
            pack_names: mask & 8 != 0,
            pack_names_index: mask & 16 != 0,
            pack_symlinks: mask & 32 != 0,
            pack_symlinks_index: mask & 64 != 0,
            force_pack_string_tables: true,
            no_create_timestamp: true,
            ..ScannerOptions::default()
        };
        let mut os = MemoryOs::new();
        os.add_dir("");
        let (image, _) = build_image(
            os,
            BlockManagerConfig {
                block_size_bits: 10,
                blockhash_window_size: 8,
            },
            options,
            CompressParam::None,
            None,
        );

        let (index, _archive) =
            Archive::new_with_config(image.clone(), &reader_config())
                .unwrap_or_else(|err| panic!("packing mask {mask}: {err}"));
        let vfs = index.statvfs();
        assert_eq!(vfs.files, 1, "mask {mask}");
        assert_eq!(vfs.blocks, 0, "mask {mask}");
        assert_eq!(index.root().dir_size(), 2);

        let mut walked = 0;
        index.walk(|_, inode| {
            walked += 1;
            assert!(inode.is_dir());
        });
        assert_eq!(walked, 1, "mask {mask}");
    }
}

#[test]
fn image_size_is_monotonic_at_block_boundary() {
    let mut sizes = Vec::new();
    for file_size in [1023usize, 1024, 1025] {
        let mut os = MemoryOs::new();
        os.add_dir("");
        os.add_file("test", lorem_ipsum(file_size));
        let (image, _) = build_image(
            os,
            BlockManagerConfig {
                block_size_bits: 10,
                blockhash_window_size: 0,
            },
            ScannerOptions {
                no_create_timestamp: true,
                ..ScannerOptions::default()
            },
            CompressParam::None,
            None,
        );

        let (index, mut archive) =
            Archive::new_with_config(image.clone(), &reader_config()).unwrap();
        let vfs = index.statvfs();
        assert_eq!(vfs.files, 2);
        assert_eq!(vfs.blocks, file_size as u64);

        let file = index.get_path(["test"]).unwrap();
        assert_eq!(
            file.as_file().unwrap().read_to_vec(&mut archive).unwrap(),
            lorem_ipsum(file_size)
        );
        sizes.push(image.len());
    }
    assert!(sizes.is_sorted(), "{sizes:?}");
}

#[cfg(feature = "zstd")]
#[test]
fn incompressible_blocks_fall_back_to_stored() {
    const FILE_SIZE: usize = 1 << 18;

    let mut os = MemoryOs::new();
    os.add_dir("");
    os.add_file("random", random_bytes(0x1234_5678, FILE_SIZE));
    os.add_file("test", lorem_ipsum(FILE_SIZE));
    let (image, _) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 18,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        CompressParam::Zstd(1),
        None,
    );

    let (index, mut archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();

    let block_of = |index: &dwarfs_img::ArchiveIndex, name: &str| {
        let chunks: Vec<_> = index
            .get_path([name])
            .unwrap()
            .as_file()
            .unwrap()
            .as_chunks()
            .collect();
        assert_eq!(chunks.len(), 1);
        chunks[0].block_idx()
    };
    let random_block = block_of(&index, "random");
    let lorem_block = block_of(&index, "test");
    assert_eq!(
        archive.block_compression(&index, random_block).unwrap(),
        CompressAlgo::NONE
    );
    assert_eq!(
        archive.block_compression(&index, lorem_block).unwrap(),
        CompressAlgo::ZSTD
    );

    let read = |index: &dwarfs_img::ArchiveIndex,
                archive: &mut Archive<Vec<u8>>,
                name: &str| {
        index
            .get_path([name])
            .unwrap()
            .as_file()
            .unwrap()
            .read_to_vec(archive)
            .unwrap()
    };
    assert_eq!(
        read(&index, &mut archive, "random"),
        random_bytes(0x1234_5678, FILE_SIZE)
    );
    assert_eq!(read(&index, &mut archive, "test"), lorem_ipsum(FILE_SIZE));
}

#[test]
fn path_list_materializes_only_listed_paths() {
    let os = test_tree();
    let list = [
        PathBuf::from("somedir/ipsum.py"),
        PathBuf::from("foo.pl"),
    ];
    let (image, _) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        CompressParam::None,
        Some(&list),
    );

    let (index, _archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    let mut got = std::collections::HashSet::new();
    index.walk(|path, _| {
        got.insert(path.to_string());
    });
    let expected: std::collections::HashSet<String> =
        ["", "somedir", "somedir/ipsum.py", "foo.pl"]
            .into_iter()
            .map(String::from)
            .collect();
    assert_eq!(got, expected);
}

#[test]
fn path_list_rejects_unknown_paths() {
    let os = test_tree();
    let scanner = Scanner::new(
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions::default(),
    )
    .unwrap();
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(Vec::new(), CompressParam::None, &progress).unwrap();
    let err = scanner
        .scan(
            Arc::new(os),
            Path::new(""),
            writer,
            &progress,
            Some(&[PathBuf::from("no/such/file")]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("invalid path"), "{err}");
}

fn grid_tree(dim: u32) -> MemoryOs {
    let mut os = MemoryOs::new();
    os.add_dir("");
    for x in 0..dim {
        os.add_dir(&format!("{x}"));
        for y in 0..dim {
            os.add_dir(&format!("{x}/{y}"));
            for z in 0..dim {
                os.add_file(
                    &format!("{x}/{y}/{z}"),
                    lorem_ipsum(((x + 1) * (y + 1) * (z + 1)) as usize),
                );
            }
        }
    }
    os
}

fn assert_deterministic(dim: u32, rounds: usize, order: FileOrderMode, hash: Option<HashAlgorithm>) {
    let build = || {
        let (image, _) = build_image(
            grid_tree(dim),
            BlockManagerConfig {
                block_size_bits: 16,
                blockhash_window_size: 0,
            },
            ScannerOptions {
                file_order: order,
                file_hash_algorithm: hash,
                no_create_timestamp: true,
                ..ScannerOptions::default()
            },
            CompressParam::None,
            None,
        );
        image
    };
    let reference = build();
    Archive::new_with_config(reference.clone(), &reader_config()).unwrap();
    for round in 0..rounds {
        assert_eq!(build(), reference, "order {order:?}, round {round}");
    }
}

#[test]
fn repeated_builds_are_byte_identical_path_order() {
    assert_deterministic(14, 50, FileOrderMode::Path, Some(HashAlgorithm::Xxh3_128));
}

#[test]
fn repeated_builds_are_byte_identical_similarity_order() {
    assert_deterministic(14, 50, FileOrderMode::Similarity, Some(HashAlgorithm::Xxh3_128));
}

#[test]
fn repeated_builds_are_byte_identical_nilsimsa_order() {
    // The greedy digest chain is quadratic, so keep this tree small.
    assert_deterministic(6, 5, FileOrderMode::Nilsimsa, None);
}

#[test]
fn packing_flags_preserve_semantics() {
    let build = |options: ScannerOptions| {
        build_image(
            test_tree(),
            BlockManagerConfig {
                block_size_bits: 15,
                blockhash_window_size: 16,
            },
            options,
            CompressParam::None,
            None,
        )
        .0
    };
    let plain = build(ScannerOptions {
        with_devices: true,
        with_specials: true,
        plain_names_table: true,
        plain_symlinks_table: true,
        no_create_timestamp: true,
        ..ScannerOptions::default()
    });
    let packed = build(full_options());

    let snapshot = |image: &[u8]| {
        let (index, mut archive) =
            Archive::new_with_config(image.to_vec(), &reader_config()).unwrap();
        let mut entries = Vec::new();
        index.walk(|path, inode| {
            let content = inode
                .as_file()
                .map(|f| f.read_to_vec(&mut archive).unwrap());
            entries.push((path.to_string(), inode.inode_num(), content));
        });
        entries
    };
    assert_eq!(snapshot(&plain), snapshot(&packed));
}

#[test]
fn overrides_and_time_resolution() {
    let os = test_tree();
    let (image, _) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            with_devices: true,
            with_specials: true,
            uid: Some(0),
            gid: Some(0),
            timestamp: Some(4711),
            time_resolution_sec: 10,
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        CompressParam::None,
        None,
    );

    let (index, _archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    let meta = index.get_path(["foo.pl"]).unwrap().metadata();
    assert_eq!(meta.uid(), 0);
    assert_eq!(meta.gid(), 0);
    // 4711 truncated to the 10s resolution.
    assert_eq!(meta.mtime(), 4710);
}

#[test]
fn keep_all_times_stores_three_timestamps() {
    let os = test_tree();
    let (image, _) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            with_devices: true,
            with_specials: true,
            keep_all_times: true,
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        CompressParam::None,
        None,
    );
    let (index, _archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    let meta = index.get_path(["foo.pl"]).unwrap().metadata();
    assert_eq!(meta.atime(), 4001);
    assert_eq!(meta.mtime(), 4002);
    assert_eq!(meta.ctime(), 4003);
}

struct ExcludePrefix(&'static str);

impl BuildScript for ExcludePrefix {
    fn has_filter(&self) -> bool {
        true
    }

    fn filter(&self, entry: &FilterEntry<'_>) -> bool {
        !entry.path.starts_with(self.0)
    }
}

#[test]
fn filter_and_remove_empty_dirs() {
    let mut os = MemoryOs::new();
    os.add_dir("");
    os.add_file("keep.txt", lorem_ipsum(100));
    os.add_dir("junk");
    os.add_file("junk/a", lorem_ipsum(10));
    os.add_dir("junk/sub");
    os.add_file("junk/sub/b", lorem_ipsum(10));

    let scanner = Scanner::new_with_script(
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            remove_empty_dirs: true,
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        Box::new(ExcludePrefix("junk/")),
    )
    .unwrap();
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(Vec::new(), CompressParam::None, &progress).unwrap();
    let image = scanner
        .scan(Arc::new(os), Path::new(""), writer, &progress, None)
        .unwrap();

    let (index, _archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    let mut paths = Vec::new();
    index.walk(|path, _| paths.push(path.to_string()));
    paths.sort();
    // `junk` itself survives the prefix filter but loses all children, so
    // remove_empty_dirs drops it.
    assert_eq!(paths, ["", "keep.txt"]);
}

#[test]
fn filters_conflict_with_path_lists() {
    let mut os = MemoryOs::new();
    os.add_dir("");
    let scanner = Scanner::new_with_script(
        BlockManagerConfig::default(),
        ScannerOptions::default(),
        Box::new(ExcludePrefix("x")),
    )
    .unwrap();
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(Vec::new(), CompressParam::None, &progress).unwrap();
    let err = scanner
        .scan(
            Arc::new(os),
            Path::new(""),
            writer,
            &progress,
            Some(&[PathBuf::from("a")]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("input list"), "{err}");
}

struct ReversePathOrder;

impl BuildScript for ReversePathOrder {
    fn order_files(&self, files: &mut [dwarfs_mk::options::ScriptFile]) {
        files.sort_by(|a, b| b.path.cmp(&a.path));
    }
}

#[test]
fn script_order_produces_a_valid_image() {
    let scanner = Scanner::new_with_script(
        BlockManagerConfig {
            block_size_bits: 15,
            blockhash_window_size: 0,
        },
        ScannerOptions {
            file_order: FileOrderMode::Script,
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        Box::new(ReversePathOrder),
    )
    .unwrap();
    let progress = Arc::new(Progress::default());
    let writer = ImageWriter::new(Vec::new(), CompressParam::None, &progress).unwrap();
    let mut os = MemoryOs::new();
    os.add_dir("");
    os.add_file("a", lorem_ipsum(100));
    os.add_file("b", lorem_ipsum(200));
    os.add_file("c", lorem_ipsum(300));
    let image = scanner
        .scan(Arc::new(os), Path::new(""), writer, &progress, None)
        .unwrap();

    let (index, mut archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    for (name, len) in [("a", 100), ("b", 200), ("c", 300)] {
        let file = index.get_path([name]).unwrap().as_file().unwrap();
        assert_eq!(file.read_to_vec(&mut archive).unwrap(), lorem_ipsum(len));
    }
    // Reverse path order: "c" was written first.
    let first_chunk = index
        .get_path(["c"])
        .unwrap()
        .as_file()
        .unwrap()
        .as_chunks()
        .next()
        .unwrap();
    assert_eq!((first_chunk.block_idx(), first_chunk.offset()), (0, 0));
}

#[test]
fn segmentation_shares_repeated_content() {
    let mut os = MemoryOs::new();
    os.add_dir("");
    // One distinct prefix, then a long shared tail.
    let mut a = random_bytes(7, 4096);
    let mut b = random_bytes(9, 4096);
    let tail = lorem_ipsum(32768);
    a.extend_from_slice(&tail);
    b.extend_from_slice(&tail);
    let (a_content, b_content) = (a.clone(), b.clone());
    os.add_file("a.bin", a);
    os.add_file("b.bin", b);

    let (image, progress) = build_image(
        os,
        BlockManagerConfig {
            block_size_bits: 17,
            blockhash_window_size: 64,
        },
        ScannerOptions {
            no_create_timestamp: true,
            ..ScannerOptions::default()
        },
        CompressParam::None,
        None,
    );
    assert!(
        progress.saved_by_segmentation.get() >= 30000,
        "saved {}",
        progress.saved_by_segmentation.get()
    );

    let (index, mut archive) =
        Archive::new_with_config(image.clone(), &reader_config()).unwrap();
    let read = |archive: &mut _, name: &str| {
        index
            .get_path([name])
            .unwrap()
            .as_file()
            .unwrap()
            .read_to_vec(archive)
            .unwrap()
    };
    assert_eq!(read(&mut archive, "a.bin"), a_content);
    assert_eq!(read(&mut archive, "b.bin"), b_content);
}
