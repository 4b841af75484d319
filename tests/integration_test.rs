use std::fs;
use std::io::Read;

use isptar::sender::{FsPayloadSource, Sender};
use isptar::{Catalog, Walker};
use tempfile::tempdir;

#[test]
fn create_and_list_roundtrip() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("hello.txt"), b"hello, isptar!").unwrap();
    fs::create_dir(src.path().join("sub")).unwrap();
    fs::write(src.path().join("sub/nested.txt"), b"nested contents").unwrap();

    let out = tempdir().unwrap();
    let archive = out.path().join("archive");

    {
        let mut walker = Walker::new();
        let mut records = walker.walk(src.path()).unwrap();
        isptar::walk::sort_records(&mut records);

        let mut sender = Sender::create(&archive, 100 * 1024 * 1024, None, None, true).unwrap();
        let mut source = FsPayloadSource::new(src.path());
        for record in &records {
            sender.send(record.clone(), &mut source).unwrap();
        }
        sender.finish(Vec::new()).unwrap();
    }

    let mut catalog = Catalog::open(&archive, None, None).unwrap();
    let mut names = Vec::new();
    while let Some(entry) = catalog.next_entry().unwrap() {
        names.push(entry.record.filename.clone());
    }
    assert!(names.contains(&"hello.txt".to_string()));
    assert!(names.contains(&"sub/nested.txt".to_string()));
    assert!(names.contains(&"sub".to_string()));
}

#[test]
fn payload_bytes_survive_the_round_trip() {
    let src = tempdir().unwrap();
    let content = b"the quick brown fox jumps over the lazy dog".repeat(100);
    fs::write(src.path().join("data.bin"), &content).unwrap();

    let out = tempdir().unwrap();
    let archive = out.path().join("archive");

    {
        let mut walker = Walker::new();
        let mut records = walker.walk(src.path()).unwrap();
        isptar::walk::sort_records(&mut records);

        let mut sender = Sender::create(&archive, 100 * 1024 * 1024, None, None, true).unwrap();
        let mut source = FsPayloadSource::new(src.path());
        for record in &records {
            sender.send(record.clone(), &mut source).unwrap();
        }
        sender.finish(Vec::new()).unwrap();
    }

    let mut catalog = Catalog::open(&archive, None, None).unwrap();
    let mut found = false;
    while let Some(entry) = catalog.next_entry().unwrap() {
        if entry.record.filename != "data.bin" {
            continue;
        }
        let locator = entry.locator.unwrap();
        let mut reader = catalog.open_payload(&locator).unwrap();
        let mut buf = vec![0u8; entry.record.size as usize];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, content);
        found = true;
    }
    assert!(found, "data.bin entry not found in catalog");
}

/// Small, incompressible content expands under gzip framing (trailer +
/// member overhead), so its compressed size exceeds its uncompressed size.
/// `open_payload` must not bound the read by uncompressed size, or this
/// would truncate with "unexpected end of gzip member".
#[test]
fn small_incompressible_payload_survives_the_round_trip() {
    let src = tempdir().unwrap();
    let content: Vec<u8> = (0u8..14).collect();
    fs::write(src.path().join("tiny.bin"), &content).unwrap();

    let out = tempdir().unwrap();
    let archive = out.path().join("archive");

    {
        let mut walker = Walker::new();
        let mut records = walker.walk(src.path()).unwrap();
        isptar::walk::sort_records(&mut records);

        let mut sender = Sender::create(&archive, 100 * 1024 * 1024, None, None, true).unwrap();
        let mut source = FsPayloadSource::new(src.path());
        for record in &records {
            sender.send(record.clone(), &mut source).unwrap();
        }
        sender.finish(Vec::new()).unwrap();
    }

    let mut catalog = Catalog::open(&archive, None, None).unwrap();
    let mut found = false;
    while let Some(entry) = catalog.next_entry().unwrap() {
        if entry.record.filename != "tiny.bin" {
            continue;
        }
        let locator = entry.locator.unwrap();
        let mut reader = catalog.open_payload(&locator).unwrap();
        let mut buf = vec![0u8; entry.record.size as usize];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, content);
        found = true;
    }
    assert!(found, "tiny.bin entry not found in catalog");
}

/// Exercises the base-reference (copy-mode) read path: a second, non-reference
/// backup must dereference the base archive's small/incompressible payload
/// through `open_payload` itself (`Sender::prev_info`'s `base_payload` path),
/// not just the fresh-store path.
#[test]
fn copy_mode_incremental_backup_copies_small_payload_from_base() {
    let src = tempdir().unwrap();
    let content: Vec<u8> = (0u8..14).collect();
    fs::write(src.path().join("tiny.bin"), &content).unwrap();

    let out = tempdir().unwrap();
    let base_archive = out.path().join("base");
    let incr_archive = out.path().join("incr");

    let build = |archive: &std::path::Path, base: Option<Catalog>| {
        let mut walker = Walker::new();
        let mut records = walker.walk(src.path()).unwrap();
        isptar::walk::sort_records(&mut records);

        // reference=false: copy mode, exercises `prev_info`'s `open_payload` path.
        let mut sender = Sender::create(archive, 100 * 1024 * 1024, None, base, false).unwrap();
        let mut source = FsPayloadSource::new(src.path());
        for record in &records {
            sender.send(record.clone(), &mut source).unwrap();
        }
        sender.finish(Vec::new()).unwrap();
    };

    build(&base_archive, None);
    let base_catalog = Catalog::open(&base_archive, None, None).unwrap();
    build(&incr_archive, Some(base_catalog));

    let mut catalog = Catalog::open(&incr_archive, None, None).unwrap();
    let mut found = false;
    while let Some(entry) = catalog.next_entry().unwrap() {
        if entry.record.filename != "tiny.bin" {
            continue;
        }
        let locator = entry.locator.unwrap();
        let mut reader = catalog.open_payload(&locator).unwrap();
        let mut buf = vec![0u8; entry.record.size as usize];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, content);
        found = true;
    }
    assert!(found, "tiny.bin entry not found in incremental catalog");
}

#[test]
fn incremental_backup_references_unchanged_files() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("stable.txt"), b"unchanged across both backups").unwrap();

    let out = tempdir().unwrap();
    let base_archive = out.path().join("base");
    let incr_archive = out.path().join("incr");

    let build = |archive: &std::path::Path, base: Option<Catalog>| {
        let mut walker = Walker::new();
        let mut records = walker.walk(src.path()).unwrap();
        isptar::walk::sort_records(&mut records);

        let mut sender = Sender::create(archive, 100 * 1024 * 1024, None, base, true).unwrap();
        let mut source = FsPayloadSource::new(src.path());
        for record in &records {
            sender.send(record.clone(), &mut source).unwrap();
        }
        sender.finish(Vec::new()).unwrap();
    };

    build(&base_archive, None);
    let base_catalog = Catalog::open(&base_archive, None, None).unwrap();
    build(&incr_archive, Some(base_catalog));

    let mut catalog = Catalog::open(&incr_archive, None, None).unwrap();
    let mut locator = None;
    while let Some(entry) = catalog.next_entry().unwrap() {
        if entry.record.filename == "stable.txt" {
            locator = entry.locator;
        }
    }
    let locator = locator.expect("stable.txt entry missing from incremental catalog");
    assert_eq!(locator.depth, 1, "unchanged file should reference one level into the base archive");
}
