//! S3 (spec.md §8): a child layer's whiteout tombstones the parent's
//! file without touching the parent image.

use tar::{Builder, EntryType, Header};

use cimfs::cancel::CancelToken;
use cimfs::compose::import_layer;
use cimfs::format::BasicInfo;
use cimfs::{Reader, Writer, WriterOptions};

fn dir_header(path: &str) -> Header {
    let mut header = Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    header
}

fn whiteout_header(path: &str) -> Header {
    let mut header = Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    header
}

#[test]
fn whiteout_hides_parent_entry_without_touching_parent() {
    let dir = tempfile::tempdir().unwrap();

    let mut parent = Writer::create(dir.path(), None, "parent.cim", WriterOptions::default()).unwrap();
    parent
        .add_file("a", BasicInfo { attributes: cimfs::format::Attributes::DIRECTORY, ..Default::default() }, 0, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    parent
        .add_file("a/b", BasicInfo { attributes: cimfs::format::Attributes::DIRECTORY, ..Default::default() }, 0, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    parent
        .add_file("a/b/c.txt", BasicInfo::default(), 7, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    parent.write(b"content").unwrap();
    parent.close().unwrap();

    let mut builder = Builder::new(Vec::new());
    builder.append(&dir_header("a"), std::io::empty()).unwrap();
    builder.append(&dir_header("a\\b"), std::io::empty()).unwrap();
    builder.append(&whiteout_header("a\\b\\.wh.c.txt"), std::io::empty()).unwrap();
    builder.finish().unwrap();
    let tar_bytes = builder.into_inner().unwrap();

    let cancel = CancelToken::new();
    let (child, summary) = import_layer(
        dir.path(),
        "child.cim",
        Some("parent.cim"),
        &tar_bytes[..],
        WriterOptions::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(summary.removed, 1);
    child.close().unwrap();

    let reader_child = Reader::open(dir.path().join("child.cim")).unwrap();
    let root_child = reader_child.root();
    assert!(reader_child.open_at(Some(&root_child), "a/b/c.txt").is_err());

    let reader_parent = Reader::open(dir.path().join("parent.cim")).unwrap();
    let root_parent = reader_parent.root();
    assert!(reader_parent.open_at(Some(&root_parent), "a/b/c.txt").is_ok());
}
