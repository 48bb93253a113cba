//! `Stream` descriptor and the `PeImage` sparse mapping table (spec.md §3
//! "Stream").

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::region_offset::RegionOffset;

/// Stream type codes (spec.md §6): `Data = 0`, `LinkTable = 1`,
/// `PeImage = 2`. Every other code is reserved and MUST be rejected on
/// read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Data = 0,
    LinkTable = 1,
    PeImage = 2,
}

impl StreamType {
    pub fn from_code(code: u8) -> Option<StreamType> {
        match code {
            0 => Some(StreamType::Data),
            1 => Some(StreamType::LinkTable),
            2 => Some(StreamType::PeImage),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// `{type, size, data_offset}` (spec.md §3). `size` is the logical byte
/// length of the stream's content; for `PeImage` it is the size of the
/// reconstructed (unmapped) file, not the on-disk mapping table size.
#[derive(Debug, Clone, Copy)]
pub struct Stream {
    pub stream_type: StreamType,
    pub size: u64,
    pub data_offset: RegionOffset,
}

const SIZE_MASK: u64 = (1u64 << 56) - 1;

impl Stream {
    /// 16 bytes on disk: the type code packed into the top byte of a
    /// size/type word, followed by the `RegionOffset`. This is the
    /// `streamSize=16` layout spec.md §4.6/§6 requires for stream-table
    /// link-table entries, and is also what a file record's default
    /// stream descriptor embeds inline.
    pub const ENCODED_SIZE: usize = 16;

    pub fn read(r: &mut impl Read) -> io::Result<Stream> {
        let word = r.read_u64::<LittleEndian>()?;
        let code = (word >> 56) as u8;
        let size = word & SIZE_MASK;
        let data_offset = RegionOffset::read(r)?;
        let stream_type = StreamType::from_code(code).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reserved stream type code {code}"),
            )
        })?;
        Ok(Stream {
            stream_type,
            size,
            data_offset,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        debug_assert!(self.size <= SIZE_MASK, "stream size overflows 56 bits");
        let word = ((self.stream_type.code() as u64) << 56) | (self.size & SIZE_MASK);
        w.write_u64::<LittleEndian>(word)?;
        self.data_offset.write(w)?;
        Ok(())
    }
}

/// One entry of a `PeImage` stream's mapping table: the logical file
/// offset at which this segment starts, and the delta added to it to get
/// the physical offset within the region (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct PeMappingEntry {
    pub file_offset: u64,
    pub delta: i64,
}

impl PeMappingEntry {
    pub const ENCODED_SIZE: usize = 16;

    pub fn read(r: &mut impl Read) -> io::Result<PeMappingEntry> {
        let file_offset = r.read_u64::<LittleEndian>()?;
        let delta = r.read_i64::<LittleEndian>()?;
        Ok(PeMappingEntry { file_offset, delta })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.file_offset)?;
        w.write_i64::<LittleEndian>(self.delta)?;
        Ok(())
    }
}

/// Header + array of mapping entries for a `PeImage` stream.
#[derive(Debug, Clone)]
pub struct PeMappingTable {
    pub entries: Vec<PeMappingEntry>,
}

impl PeMappingTable {
    pub fn read(r: &mut impl Read) -> io::Result<PeMappingTable> {
        let count = r.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(PeMappingEntry::read(r)?);
        }
        Ok(PeMappingTable { entries })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for e in &self.entries {
            e.write(w)?;
        }
        Ok(())
    }

    /// Returns `(delta, segment_end)` for a read starting at logical
    /// offset `o`: the last mapping whose `file_offset <= o`, and the
    /// `file_offset` of the following mapping (or `u64::MAX` if `o` falls
    /// in the last segment). spec.md §3 / §8 property 6.
    pub fn resolve(&self, o: u64) -> Option<(i64, u64)> {
        let idx = self
            .entries
            .iter()
            .rposition(|e| e.file_offset <= o)?;
        let delta = self.entries[idx].delta;
        let end = self
            .entries
            .get(idx + 1)
            .map(|e| e.file_offset)
            .unwrap_or(u64::MAX);
        Some((delta, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_segment_containing_offset() {
        let table = PeMappingTable {
            entries: vec![
                PeMappingEntry { file_offset: 0, delta: 0 },
                PeMappingEntry { file_offset: 0x1000, delta: 16 },
                PeMappingEntry { file_offset: 0x2000, delta: -8 },
            ],
        };
        assert_eq!(table.resolve(0x500), Some((0, 0x1000)));
        assert_eq!(table.resolve(0x1800), Some((16, 0x2000)));
        assert_eq!(table.resolve(0x5000), Some((-8, u64::MAX)));
    }
}
