//! S6 (spec.md §8): fork visibility and tombstone shadowing.

use cimfs::format::BasicInfo;
use cimfs::{Reader, Writer, WriterOptions};

#[test]
fn fork_shadows_unlinked_parent_entries() {
    let dir = tempfile::tempdir().unwrap();

    let mut a = Writer::create(dir.path(), None, "a.cim", WriterOptions::default()).unwrap();
    a.add_file("a", BasicInfo::default(), 0, Vec::new(), Vec::new(), Vec::new()).unwrap();
    a.add_file("b", BasicInfo::default(), 0, Vec::new(), Vec::new(), Vec::new()).unwrap();
    a.close().unwrap();

    let mut b = Writer::create(dir.path(), Some("a.cim"), "b.cim", WriterOptions::default()).unwrap();
    b.unlink("a").unwrap();
    b.add_file("c", BasicInfo::default(), 0, Vec::new(), Vec::new(), Vec::new()).unwrap();
    b.close().unwrap();

    let reader_b = Reader::open(dir.path().join("b.cim")).unwrap();
    let root_b = reader_b.root();
    let names_b = reader_b.readdir(&root_b).unwrap();
    assert_eq!(names_b, vec!["b".to_string(), "c".to_string()]);

    let reader_a = Reader::open(dir.path().join("a.cim")).unwrap();
    let root_a = reader_a.root();
    let names_a = reader_a.readdir(&root_a).unwrap();
    assert_eq!(names_a, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn fork_chain_of_three_preserves_untouched_entries() {
    let dir = tempfile::tempdir().unwrap();

    let mut a = Writer::create(dir.path(), None, "a.cim", WriterOptions::default()).unwrap();
    a.add_file("shared.txt", BasicInfo::default(), 4, Vec::new(), Vec::new(), Vec::new()).unwrap();
    a.write(b"data").unwrap();
    a.close().unwrap();

    let mut b = Writer::create(dir.path(), Some("a.cim"), "b.cim", WriterOptions::default()).unwrap();
    b.add_file("b-only.txt", BasicInfo::default(), 0, Vec::new(), Vec::new(), Vec::new()).unwrap();
    b.close().unwrap();

    let mut c = Writer::create(dir.path(), Some("b.cim"), "c.cim", WriterOptions::default()).unwrap();
    c.add_file("c-only.txt", BasicInfo::default(), 0, Vec::new(), Vec::new(), Vec::new()).unwrap();
    c.close().unwrap();

    let reader_c = Reader::open(dir.path().join("c.cim")).unwrap();
    let root_c = reader_c.root();
    let mut shared = reader_c.open_at(Some(&root_c), "shared.txt").unwrap();
    let mut buf = [0u8; 4];
    let n = reader_c.read(&mut shared, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"data");

    assert!(reader_c.open_at(Some(&root_c), "b-only.txt").is_ok());
    assert!(reader_c.open_at(Some(&root_c), "c-only.txt").is_ok());
}
