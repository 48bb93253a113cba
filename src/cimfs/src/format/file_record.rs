//! `FileRecord` / inode (spec.md §3) and `FileId` table addressing.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::region_offset::RegionOffset;
use super::stream::Stream;

bitflags! {
    /// Windows file attribute bits this crate stores/synthesizes.
    /// `DIRECTORY` and `REPARSE_POINT` are synthesized from the inode
    /// (spec.md §4.3 `File.Stat`), never read back from the stored bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u32 {
        const READONLY      = 0x0000_0001;
        const HIDDEN        = 0x0000_0002;
        const SYSTEM        = 0x0000_0004;
        const DIRECTORY     = 0x0000_0010;
        const ARCHIVE       = 0x0000_0020;
        const REPARSE_POINT = 0x0000_0400;
        const SPARSE_FILE   = 0x0000_0200;
    }
}

/// A Windows `FILETIME`: 100ns intervals since 1601-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTime(pub u64);

impl FileTime {
    pub fn read(r: &mut impl Read) -> io::Result<FileTime> {
        Ok(FileTime(r.read_u64::<LittleEndian>()?))
    }
    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.0)
    }
}

/// Per-file timestamps and attributes a caller supplies to `AddFile`
/// (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicInfo {
    pub attributes: Attributes,
    pub creation_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub last_access_time: FileTime,
}

impl BasicInfo {
    /// Attribute bits as they will actually be stored: `SPARSE_FILE` is
    /// unconditionally cleared (spec.md §9 "Sparse-file attribute
    /// handling" — keep the clearing behavior, do not guess whether
    /// CIMFS rejects sparse files outright), and `DIRECTORY` /
    /// `REPARSE_POINT` are cleared since both are synthesized from the
    /// inode on read (`FileRecord::synthesized_attributes`) and storing
    /// them too would just be a redundant copy.
    pub fn stored_attributes(&self) -> Attributes {
        self.attributes & !(Attributes::SPARSE_FILE | Attributes::DIRECTORY | Attributes::REPARSE_POINT)
    }
}

/// `FileId`s are 1-based indices into a two-level file table (spec.md
/// §3). `table_index`/`slot_index` are the coordinates the on-disk
/// `FileTableDirectory` addresses a record by.
pub fn file_id_coordinates(id: u32, files_per_table: u32) -> (u32, u32) {
    debug_assert!(id >= 1, "FileId is 1-based");
    let zero_based = id - 1;
    (zero_based / files_per_table, zero_based % files_per_table)
}

/// The inode record (spec.md §3 "File ID and inode"). `entry_size` on
/// disk may exceed `ENCODED_SIZE` for forward compatibility; the codec
/// reads/writes exactly `ENCODED_SIZE` and the caller (file table) pads.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub attributes: Attributes,
    pub creation_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub last_access_time: FileTime,
    pub reparse_tag: u32,
    pub security_descriptor: RegionOffset,
    pub security_descriptor_len: u32,
    pub extended_attributes: RegionOffset,
    pub extended_attributes_len: u32,
    pub reparse_buffer: RegionOffset,
    pub reparse_buffer_len: u32,
    pub stream_table: RegionOffset,
    pub default_stream: Stream,
}

impl FileRecord {
    pub const ENCODED_SIZE: usize = 4 + 8 * 4 + 4 + 8 + 4 + 8 + 4 + 8 + 4 + 8 + Stream::ENCODED_SIZE;

    pub fn read(r: &mut impl Read) -> io::Result<FileRecord> {
        let attributes = Attributes::from_bits_truncate(r.read_u32::<LittleEndian>()?);
        let creation_time = FileTime::read(r)?;
        let last_write_time = FileTime::read(r)?;
        let change_time = FileTime::read(r)?;
        let last_access_time = FileTime::read(r)?;
        let reparse_tag = r.read_u32::<LittleEndian>()?;
        let security_descriptor = RegionOffset::read(r)?;
        let security_descriptor_len = r.read_u32::<LittleEndian>()?;
        let extended_attributes = RegionOffset::read(r)?;
        let extended_attributes_len = r.read_u32::<LittleEndian>()?;
        let reparse_buffer = RegionOffset::read(r)?;
        let reparse_buffer_len = r.read_u32::<LittleEndian>()?;
        let stream_table = RegionOffset::read(r)?;
        let default_stream = Stream::read(r)?;
        Ok(FileRecord {
            attributes,
            creation_time,
            last_write_time,
            change_time,
            last_access_time,
            reparse_tag,
            security_descriptor,
            security_descriptor_len,
            extended_attributes,
            extended_attributes_len,
            reparse_buffer,
            reparse_buffer_len,
            stream_table,
            default_stream,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.attributes.bits())?;
        self.creation_time.write(w)?;
        self.last_write_time.write(w)?;
        self.change_time.write(w)?;
        self.last_access_time.write(w)?;
        w.write_u32::<LittleEndian>(self.reparse_tag)?;
        self.security_descriptor.write(w)?;
        w.write_u32::<LittleEndian>(self.security_descriptor_len)?;
        self.extended_attributes.write(w)?;
        w.write_u32::<LittleEndian>(self.extended_attributes_len)?;
        self.reparse_buffer.write(w)?;
        w.write_u32::<LittleEndian>(self.reparse_buffer_len)?;
        self.stream_table.write(w)?;
        self.default_stream.write(w)?;
        Ok(())
    }

    /// Reads a record encoded with a (possibly smaller, never larger)
    /// `entry_size`, zero-padding the remainder before decoding (spec.md
    /// §4.2 "forward compatibility").
    pub fn read_padded(bytes: &[u8]) -> io::Result<FileRecord> {
        let mut padded = vec![0u8; Self::ENCODED_SIZE];
        let n = bytes.len().min(Self::ENCODED_SIZE);
        padded[..n].copy_from_slice(&bytes[..n]);
        let mut cur = io::Cursor::new(padded);
        FileRecord::read(&mut cur)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.default_stream.stream_type, super::stream::StreamType::LinkTable)
    }

    pub fn has_reparse_point(&self) -> bool {
        !self.reparse_buffer.is_null() && self.reparse_buffer_len > 0
    }

    /// Synthesized attribute bitmask: stored bits plus `DIRECTORY` and
    /// `REPARSE_POINT`, which are never themselves persisted (spec.md
    /// §4.3 `File.Stat`).
    pub fn synthesized_attributes(&self) -> Attributes {
        let mut attrs = self.attributes;
        if self.is_directory() {
            attrs |= Attributes::DIRECTORY;
        }
        if self.has_reparse_point() {
            attrs |= Attributes::REPARSE_POINT;
        }
        attrs
    }
}
