//! S1 (spec.md §8): three-file image, write then read back.

use cimfs::format::{Attributes, BasicInfo};
use cimfs::{Reader, Writer, WriterOptions};

fn read_all(reader: &Reader, handle: &mut cimfs::CimFile, expected_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; expected_len];
    let mut filled = 0;
    loop {
        let n = reader.read(handle, &mut out[filled..]).unwrap();
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.truncate(filled);
    out
}

#[test]
fn three_file_image_round_trips() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = Writer::create(dir.path(), None, "test.cim", WriterOptions::default()).unwrap();
    writer
        .add_file("foobar.txt", BasicInfo::default(), 16, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    writer.write(b"foobar test data").unwrap();

    writer
        .add_file(
            "foo",
            BasicInfo { attributes: Attributes::DIRECTORY, ..Default::default() },
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

    writer
        .add_file("foo/bar.txt", BasicInfo::default(), 13, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    writer.write(b"bar test data").unwrap();

    writer.close().unwrap();

    let reader = Reader::open(dir.path().join("test.cim")).unwrap();
    let root = reader.root();

    let mut foobar = reader.open_at(Some(&root), "foobar.txt").unwrap();
    assert_eq!(read_all(&reader, &mut foobar, 16), b"foobar test data");

    let foo = reader.open_at(Some(&root), "foo").unwrap();
    assert!(reader.stat(&foo).unwrap().is_dir());

    let mut bar = reader.open_at(Some(&root), "foo/bar.txt").unwrap();
    assert_eq!(read_all(&reader, &mut bar, 13), b"bar test data");

    let names = reader.readdir(&root).unwrap();
    assert_eq!(names, vec!["foo".to_string(), "foobar.txt".to_string()]);
}
