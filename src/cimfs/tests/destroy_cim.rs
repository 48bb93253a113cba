//! `DestroyCim` (spec.md §6 "Driver/mounter interface"): removes the
//! primary file plus every region and object-id file the header
//! references, and nothing else.

use cimfs::format::BasicInfo;
use cimfs::host_layout::destroy_cim;
use cimfs::{Writer, WriterOptions};

#[test]
fn destroy_cim_removes_primary_and_region_files() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = Writer::create(dir.path(), None, "test.cim", WriterOptions::default()).unwrap();
    writer
        .add_file("f.txt", BasicInfo::default(), 5, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    writer.write(b"hello").unwrap();
    writer.close().unwrap();

    let cim_path = dir.path().join("test.cim");
    assert!(cim_path.exists());

    let entries_before: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(entries_before.len() > 1, "expected at least one region file alongside the primary");

    destroy_cim(&cim_path).unwrap();

    assert!(!cim_path.exists());
    let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(remaining.is_empty(), "destroy_cim must remove every region/object-id file it owns");
}
