//! S2 and S4 (spec.md §8): importing a Windows-layer backup-format tar
//! stream through the composer, then reading the result back.

use tar::{Builder, EntryType, Header};

use cimfs::cancel::CancelToken;
use cimfs::compose::import_layer;
use cimfs::host_layout::{HIVES_DIR, HIVE_NAMES, LAYOUT_MARKER_CONTENTS};
use cimfs::{Reader, WriterOptions};

fn dir_header(path: &str) -> Header {
    let mut header = Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    header
}

fn file_header(path: &str, len: usize) -> Header {
    let mut header = Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_entry_type(EntryType::Regular);
    header.set_size(len as u64);
    header.set_mode(0o644);
    header.set_cksum();
    header
}

#[test]
fn base_layer_tar_produces_hives_and_layout_marker() {
    let dir = tempfile::tempdir().unwrap();

    let mut builder = Builder::new(Vec::new());
    for d in [
        "Files",
        "Files\\Windows",
        "Files\\Windows\\System32",
        "Files\\Windows\\System32\\config",
    ] {
        builder.append(&dir_header(d), std::io::empty()).unwrap();
    }
    for name in HIVE_NAMES {
        let path = format!("Files\\Windows\\System32\\config\\{name}");
        builder.append(&file_header(&path, 0), std::io::empty()).unwrap();
    }
    builder.finish().unwrap();
    let tar_bytes = builder.into_inner().unwrap();

    let cancel = CancelToken::new();
    let (mut writer, summary) = import_layer(
        dir.path(),
        "test.cim",
        None,
        &tar_bytes[..],
        WriterOptions::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(summary.files_added, HIVE_NAMES.len() as u64);

    cimfs::finalize::finalize_base_layer(&mut writer, &cancel).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(dir.path().join("test.cim")).unwrap();
    let root = reader.root();

    for name in HIVE_NAMES {
        let path = format!("{HIVES_DIR}/{name}_BASE");
        let handle = reader.open_at(Some(&root), &path).unwrap();
        let info = reader.stat(&handle).unwrap();
        assert_eq!(info.size, 0);
    }

    let mut layout = reader.open_at(Some(&root), "layout").unwrap();
    let mut buf = vec![0u8; LAYOUT_MARKER_CONTENTS.len()];
    let n = reader.read(&mut layout, &mut buf).unwrap();
    assert_eq!(&buf[..n], LAYOUT_MARKER_CONTENTS.as_bytes());
}

#[test]
fn alternate_data_stream_entry_is_consumed_as_a_named_stream() {
    let dir = tempfile::tempdir().unwrap();

    let mut builder = Builder::new(Vec::new());
    builder.append(&file_header("file.txt", 4), &b"main"[..]).unwrap();
    builder.append(&file_header("file.txt:meta:$DATA", 3), &b"xyz"[..]).unwrap();
    builder.finish().unwrap();
    let tar_bytes = builder.into_inner().unwrap();

    let cancel = CancelToken::new();
    let (writer, summary) = import_layer(
        dir.path(),
        "test.cim",
        None,
        &tar_bytes[..],
        WriterOptions::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(summary.files_added, 1);
    writer.close().unwrap();

    let reader = Reader::open(dir.path().join("test.cim")).unwrap();
    let root = reader.root();

    let mut main_handle = reader.open_at(Some(&root), "file.txt").unwrap();
    let mut buf = [0u8; 4];
    let n = reader.read(&mut main_handle, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"main");

    let streams = reader.readstreams(&main_handle).unwrap();
    assert_eq!(streams, vec!["meta".to_string()]);

    let mut meta = reader.open_stream(&main_handle, "meta").unwrap();
    let mut meta_buf = [0u8; 3];
    let n = reader.read_stream(&mut meta, &mut meta_buf).unwrap();
    assert_eq!(&meta_buf[..n], b"xyz");
}
