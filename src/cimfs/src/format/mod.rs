//! C3: the fixed little-endian on-disk layout (spec.md §3, §6). Every
//! decode here reads a fixed layout into a struct of the same size on
//! disk; encode mirrors decode exactly (spec.md §4.2).

pub mod common_header;
pub mod file_record;
pub mod filesystem_header;
pub mod filesystem_record;
pub mod link_table;
pub mod region_offset;
pub mod security;
pub mod stream;
pub mod upcase;

pub use common_header::{CommonHeader, Version, CIM_MAGIC, CURRENT_VERSION, MIN_SUPPORTED_VERSION, REGION_MAGIC};
pub use file_record::{Attributes, BasicInfo, FileRecord, FileTime};
pub use filesystem_header::{FilesystemHeader, RegionSet};
pub use filesystem_record::{FileTableDirectoryEntry, FilesystemRecord, RegionHeader};
pub use link_table::{FileId, LinkTable, LinkTableEntry, LinkTablePayload};
pub use region_offset::RegionOffset;
pub use stream::{PeMappingEntry, PeMappingTable, Stream, StreamType};
pub use upcase::UpcaseTable;

/// Number of file records packed into one file table (spec.md §3 "File
/// ID and inode": `table index = (id-1)/FilesPerTable`).
pub const FILES_PER_TABLE: u32 = 1024;
