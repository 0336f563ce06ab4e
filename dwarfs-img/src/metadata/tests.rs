use super::*;

#[test]
fn freeze_options_only() {
    let mut meta = Metadata::default();
    let opts = meta.options.insert(FsOptions::default());
    opts.mtime_only = true;
    opts.time_resolution_sec = Some(42);

    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    // presence(1) + mtime_only(1) + presence(1) + 42 in 6 bits = 9 bits.
    assert_eq!(out, [0x57, 0x01]);

    let meta2 = Metadata::parse(&schema, &out).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn freeze_collections() {
    let meta = Metadata {
        chunks: vec![
            Chunk {
                // Always zero: elided from the element layout.
                block: 0,
                // Sometimes zero.
                offset: 0,
                // Never zero.
                size: 42,
            },
            Chunk {
                block: 0,
                offset: 100,
                size: 42,
            },
        ],
        // All-zero elements with a non-zero length: only the count is kept.
        symlink_table: vec![0, 0, 0],
        ..Metadata::default()
    };

    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(
        out,
        [
            5, 0, 0, 0, // chunks.distance = 5
            0b1110, // chunks.count = 2, symlink_table.count = 3
            //// Out of line: two 13-bit chunk elements ////
            0x00, 0x95, 0xAC, 0x02,
        ]
    );
    // offset packs to 7 bits, size to 6; block is elided.
    assert!(schema.layouts.iter().any(|l| l.bits == 13));

    let meta2 = Metadata::parse(&schema, &out).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn freeze_bytes() {
    let meta = Metadata {
        dwarfs_version: Some("abc".into()),
        ..Metadata::default()
    };
    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(out, [0x0B, 0, 0, 0, 6, b'a', b'b', b'c']);
    let meta2 = Metadata::parse(&schema, &out).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn freeze_empty() {
    let meta = Metadata::default();
    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    assert!(out.is_empty());
    let meta2 = Metadata::parse(&schema, &out).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn schema_wire_roundtrip() {
    let meta = Metadata {
        inodes: vec![InodeData {
            mode_index: 3,
            owner_index: 1,
            group_index: 0,
            atime_offset: 0,
            mtime_offset: 77,
            ctime_offset: 78,
        }],
        modes: vec![0o040_755, 0o100_644],
        block_size: 1 << 20,
        ..Metadata::default()
    };
    let (schema, _) = meta.to_schema_and_bytes().unwrap();

    let bytes = schema.to_bytes();
    let schema2 = Schema::parse(&bytes).unwrap();
    assert_eq!(schema, schema2);
    // Canonical: re-serialization is byte-identical.
    assert_eq!(schema2.to_bytes(), bytes);

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert!(Schema::parse(&trailing).is_err());
}

#[test]
fn rich_roundtrip() {
    let meta = Metadata {
        chunks: vec![
            Chunk {
                block: 0,
                offset: 0,
                size: 1000,
            },
            Chunk {
                block: 1,
                offset: 4096,
                size: 24,
            },
        ],
        directories: vec![
            Directory {
                parent_entry: 0,
                first_entry: 1,
            },
            Directory {
                parent_entry: 2,
                first_entry: 4,
            },
            Directory {
                parent_entry: 0,
                first_entry: 5,
            },
        ],
        inodes: vec![InodeData::default(); 5],
        chunk_table: vec![0, 1, 2],
        symlink_table: vec![1, 0],
        uids: vec![0, 1000],
        gids: vec![0, 100],
        modes: vec![0o040_755, 0o100_644, 0o120_777],
        names: vec!["foo".into(), "bar".into()],
        symlinks: vec!["target".into(), "../other".into()],
        timestamp_base: 4001,
        block_size: 1 << 16,
        total_fs_size: 123_456,
        devices: Some(vec![259, 261]),
        options: Some(FsOptions {
            mtime_only: true,
            time_resolution_sec: None,
            packed_chunk_table: true,
            packed_directories: false,
            packed_shared_files_table: true,
        }),
        dir_entries: vec![
            DirEntry {
                name_index: 0,
                inode_num: 0,
            },
            DirEntry {
                name_index: 1,
                inode_num: 3,
            },
        ],
        shared_files_table: Some(vec![0, 0, 1]),
        total_hardlink_size: Some(23456),
        dwarfs_version: Some("dwarfs-mk 0.1.0".into()),
        create_timestamp: Some(1_700_000_000),
        compact_names: Some(StringTable {
            buffer: "foobar".into(),
            symtab: None,
            index: vec![3, 3],
            packed_index: true,
        }),
        compact_symlinks: None,
    };

    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    let meta2 = Metadata::parse(&schema, &out).unwrap();
    assert_eq!(meta, meta2);

    // Determinism of the whole freeze path.
    let (schema3, out3) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(schema3, schema);
    assert_eq!(out3, out);
}

#[test]
fn truncated_blob_is_rejected() {
    let meta = Metadata {
        names: vec!["some_name".into()],
        ..Metadata::default()
    };
    let (schema, out) = meta.to_schema_and_bytes().unwrap();
    for cut in 0..out.len() {
        assert!(
            Metadata::parse(&schema, &out[..cut]).is_err(),
            "truncation at {cut} must not parse"
        );
    }
}
