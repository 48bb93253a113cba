//! Reader-level coverage for `PeImage` streams (spec.md §3 / §8 property
//! 6). No `Writer` code path ever produces one — a sparse PE-image
//! stream only ever arrives already built inside an imported layer — so
//! this test hand-builds a minimal image directly against the on-disk
//! format to exercise `Reader::read`'s segment/delta resolution across a
//! mapping-table boundary.

use uuid::Uuid;

use cimfs::format::upcase::utf8_to_utf16le;
use cimfs::format::{
    Attributes, FileId, FileRecord, FileTableDirectoryEntry, FileTime, FilesystemHeader,
    FilesystemRecord, LinkTable, PeMappingEntry, PeMappingTable, RegionOffset, Stream, StreamType,
    UpcaseTable,
};
use cimfs::region::RegionSetWriter;
use cimfs::Reader;

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

fn empty_file_record(default_stream: Stream) -> FileRecord {
    FileRecord {
        attributes: Attributes::empty(),
        creation_time: FileTime::default(),
        last_write_time: FileTime::default(),
        change_time: FileTime::default(),
        last_access_time: FileTime::default(),
        reparse_tag: 0,
        security_descriptor: RegionOffset::NULL,
        security_descriptor_len: 0,
        extended_attributes: RegionOffset::NULL,
        extended_attributes_len: 0,
        reparse_buffer: RegionOffset::NULL,
        reparse_buffer_len: 0,
        stream_table: RegionOffset::NULL,
        default_stream,
    }
}

#[test]
fn pe_image_stream_reads_across_mapping_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut regions = RegionSetWriter::create(dir.path(), Uuid::new_v4(), 1 << 30, 0).unwrap();

    // [0, 16) reads straight through (delta 0); [16, 32) is rebased 100
    // bytes further into the region (delta 100), as a PE section whose
    // on-disk layout differs from its mapped layout would be.
    let mapping = PeMappingTable {
        entries: vec![
            PeMappingEntry { file_offset: 0, delta: 0 },
            PeMappingEntry { file_offset: 16, delta: 100 },
        ],
    };
    let mut mapping_bytes = Vec::new();
    mapping.write(&mut mapping_bytes).unwrap();
    let mapping_offset = regions.append(&mapping_bytes).unwrap();

    let mut segment_data = vec![0u8; 132];
    segment_data[0..16].copy_from_slice(&[b'A'; 16]);
    segment_data[116..132].copy_from_slice(&[b'B'; 16]);
    regions.append(&segment_data).unwrap();

    let image_stream = Stream {
        stream_type: StreamType::PeImage,
        size: 32,
        data_offset: mapping_offset,
    };

    let upcase = UpcaseTable::build_ntfs_upcase_table();
    let mut root_children: LinkTable<FileId> = LinkTable::new();
    root_children.insert_sorted(&upcase, utf8_to_utf16le("image.bin"), FileId(2));
    let mut root_children_bytes = Vec::new();
    root_children.write(&mut root_children_bytes).unwrap();
    let root_children_offset = regions.append(&root_children_bytes).unwrap();

    let root_record = empty_file_record(Stream {
        stream_type: StreamType::LinkTable,
        size: root_children_bytes.len() as u64,
        data_offset: root_children_offset,
    });
    let image_record = empty_file_record(image_stream);

    let mut file_table_bytes = Vec::new();
    root_record.write(&mut file_table_bytes).unwrap();
    image_record.write(&mut file_table_bytes).unwrap();
    let file_table_offset = regions.append(&file_table_bytes).unwrap();

    let directory_entry = FileTableDirectoryEntry {
        offset: file_table_offset,
        entry_size: FileRecord::ENCODED_SIZE as u32,
        entry_count: 2,
    };
    let mut directory_bytes = Vec::new();
    directory_entry.write(&mut directory_bytes).unwrap();
    let file_table_directory_offset = regions.append(&directory_bytes).unwrap();

    let mut upcase_bytes = Vec::new();
    upcase.write(&mut upcase_bytes).unwrap();
    let upcase_table_offset = regions.append(&upcase_bytes).unwrap();

    let fs_record = FilesystemRecord {
        root_file_id: 1,
        file_table_directory_offset,
        file_table_directory_len: directory_bytes.len() as u64,
        upcase_table_offset,
        file_table_count: 1,
    };
    let mut fs_record_bytes = Vec::new();
    fs_record.write(&mut fs_record_bytes).unwrap();
    let filesystem_offset = regions.append(&fs_record_bytes).unwrap();

    regions.flush().unwrap();
    let header = FilesystemHeader::new(regions.region_set(), filesystem_offset, Vec::new());
    let cim_path = dir.path().join("pe.cim");
    let mut primary = std::fs::File::create(&cim_path).unwrap();
    header.write(&mut primary).unwrap();
    drop(primary);

    let reader = Reader::open(&cim_path).unwrap();
    let root = reader.root();
    let mut image = reader.open_at(Some(&root), "image.bin").unwrap();
    assert_eq!(reader.stat(&image).unwrap().size, 32);

    let bytes = read_all(&reader, &mut image, 32);
    assert_eq!(&bytes[0..16], &[b'A'; 16]);
    assert_eq!(&bytes[16..32], &[b'B'; 16]);
}
