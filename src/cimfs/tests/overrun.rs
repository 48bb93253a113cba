//! S5 (spec.md §8): writing past a stream's declared size fails, and no
//! partial data survives into the committed image.

use cimfs::error::Error;
use cimfs::format::BasicInfo;
use cimfs::{Writer, WriterOptions};

#[test]
fn write_past_declared_size_overruns() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = Writer::create(dir.path(), None, "test.cim", WriterOptions::default()).unwrap();
    writer
        .add_file("f.bin", BasicInfo::default(), 5, Vec::new(), Vec::new(), Vec::new())
        .unwrap();

    let err = writer.write(b"abcdef").unwrap_err();
    assert!(matches!(err, Error::Overrun { attempted: 6, remaining: 5 }));
}

#[test]
fn closing_short_of_declared_size_is_fatal_under_strict_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = Writer::create(dir.path(), None, "test.cim", WriterOptions::default()).unwrap();
    writer
        .add_file("f.bin", BasicInfo::default(), 5, Vec::new(), Vec::new(), Vec::new())
        .unwrap();
    writer.write(b"ab").unwrap();

    let err = writer.close().unwrap_err();
    assert!(matches!(err, Error::WriteTruncated { remaining: 3 }));
}
