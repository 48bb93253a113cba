//! `Filesystem` record (spec.md §3) and the `RegionHeader` every region
//! file starts with (spec.md §6).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::common_header::{CommonHeader, CURRENT_VERSION, REGION_MAGIC};
use super::region_offset::RegionOffset;

/// Pointer to the root directory's FileID, the file-table directory's
/// location, the upcase table's location, and how many file tables exist
/// (spec.md §3 "Filesystem record").
#[derive(Debug, Clone, Copy)]
pub struct FilesystemRecord {
    pub root_file_id: u32,
    pub file_table_directory_offset: RegionOffset,
    pub file_table_directory_len: u64,
    pub upcase_table_offset: RegionOffset,
    pub file_table_count: u32,
}

impl FilesystemRecord {
    pub const ENCODED_SIZE: usize = 4 + 8 + 8 + 8 + 4;

    pub fn read(r: &mut impl Read) -> io::Result<FilesystemRecord> {
        let root_file_id = r.read_u32::<LittleEndian>()?;
        let file_table_directory_offset = RegionOffset::read(r)?;
        let file_table_directory_len = r.read_u64::<LittleEndian>()?;
        let upcase_table_offset = RegionOffset::read(r)?;
        let file_table_count = r.read_u32::<LittleEndian>()?;
        Ok(FilesystemRecord {
            root_file_id,
            file_table_directory_offset,
            file_table_directory_len,
            upcase_table_offset,
            file_table_count,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.root_file_id)?;
        self.file_table_directory_offset.write(w)?;
        w.write_u64::<LittleEndian>(self.file_table_directory_len)?;
        self.upcase_table_offset.write(w)?;
        w.write_u32::<LittleEndian>(self.file_table_count)?;
        Ok(())
    }
}

/// One entry of the file-table directory: where that file table's bytes
/// live and the `entry_size` every record in it is strided at (spec.md
/// §3 "forward-compatible growth").
#[derive(Debug, Clone, Copy)]
pub struct FileTableDirectoryEntry {
    pub offset: RegionOffset,
    pub entry_size: u32,
    pub entry_count: u32,
}

impl FileTableDirectoryEntry {
    pub const ENCODED_SIZE: usize = 8 + 4 + 4;

    pub fn read(r: &mut impl Read) -> io::Result<FileTableDirectoryEntry> {
        let offset = RegionOffset::read(r)?;
        let entry_size = r.read_u32::<LittleEndian>()?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        Ok(FileTableDirectoryEntry {
            offset,
            entry_size,
            entry_count,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        self.offset.write(w)?;
        w.write_u32::<LittleEndian>(self.entry_size)?;
        w.write_u32::<LittleEndian>(self.entry_count)?;
        Ok(())
    }
}

/// Every region file begins with `RegionHeader { CommonHeader, ... }`
/// (spec.md §6). The core's region files carry no further fields beyond
/// the common header; content starts immediately after.
#[derive(Debug, Clone, Copy)]
pub struct RegionHeader {
    pub common: CommonHeader,
}

impl RegionHeader {
    pub const ENCODED_SIZE: usize = CommonHeader::ENCODED_SIZE;

    pub fn fresh() -> RegionHeader {
        RegionHeader {
            common: CommonHeader {
                magic: REGION_MAGIC,
                version: CURRENT_VERSION,
            },
        }
    }

    pub fn read(r: &mut impl Read) -> io::Result<RegionHeader> {
        Ok(RegionHeader {
            common: CommonHeader::read(r)?,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        self.common.write(w)
    }
}
