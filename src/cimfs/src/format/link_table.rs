//! Link table codec (spec.md §3 "Link table"). A link table is the
//! default stream of a directory (entries = child FileIDs) or the
//! stream-table of a file (entries = `Stream` descriptors). Both variants
//! share the same outer layout and are kept sorted in upcased-UTF-16LE
//! order so lookup is a binary search.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{self, Cursor, Read, Write};

use super::stream::Stream;
use super::upcase::{compare_utf16le, compare_utf8_to_utf16le, UpcaseTable};

pub trait LinkTablePayload: Sized + Copy {
    const ENCODED_SIZE: usize;
    fn read(r: &mut impl Read) -> io::Result<Self>;
    fn write(&self, w: &mut impl Write) -> io::Result<()>;
}

/// A directory entry payload: the child's FileID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub u32);

impl LinkTablePayload for FileId {
    const ENCODED_SIZE: usize = 4;

    fn read(r: &mut impl Read) -> io::Result<Self> {
        Ok(FileId(r.read_u32::<LittleEndian>()?))
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.0)
    }
}

impl LinkTablePayload for Stream {
    const ENCODED_SIZE: usize = Stream::ENCODED_SIZE;

    fn read(r: &mut impl Read) -> io::Result<Self> {
        Stream::read(r)
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        Stream::write(self, w)
    }
}

/// One decoded name + payload pair, in on-disk (sorted) order.
#[derive(Debug, Clone)]
pub struct LinkTableEntry<P> {
    pub name: Vec<u16>,
    pub payload: P,
}

/// `{size_u32, count_u32, entries[count], name_offsets[count], names_blob}`
/// (spec.md §3). `entries` and `name_offsets` are parallel arrays; names
/// are stored once in `names_blob` as `{len_u16, utf16_le[len]}`.
#[derive(Debug, Clone)]
pub struct LinkTable<P> {
    pub entries: Vec<LinkTableEntry<P>>,
}

impl<P: LinkTablePayload> LinkTable<P> {
    pub fn new() -> LinkTable<P> {
        LinkTable { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts keeping `entries` in upcased-UTF-16LE sorted order
    /// (spec.md invariant 3). Duplicate names are rejected by the caller
    /// before this is reached (the writer checks at `AddFile`/`AddLink`
    /// time), not here.
    pub fn insert_sorted(&mut self, table: &UpcaseTable, name: Vec<u16>, payload: P) {
        let pos = self
            .entries
            .binary_search_by(|e| compare_utf16le(table, &e.name, &name))
            .unwrap_or_else(|pos| pos);
        self.entries.insert(pos, LinkTableEntry { name, payload });
    }

    pub fn find(&self, table: &UpcaseTable, query: &str) -> Option<&LinkTableEntry<P>> {
        let idx = self
            .entries
            .binary_search_by(|e| compare_utf8_to_utf16le(table, query, &e.name).reverse())
            .ok()?;
        self.entries.get(idx)
    }

    pub fn read(r: &mut impl Read) -> io::Result<LinkTable<P>> {
        let size = r.read_u32::<LittleEndian>()?;
        let mut body = vec![0u8; size as usize];
        r.read_exact(&mut body)?;
        let mut cur = Cursor::new(body);

        let count = cur.read_u32::<LittleEndian>()?;
        let mut payloads = Vec::with_capacity(count as usize);
        for _ in 0..count {
            payloads.push(P::read(&mut cur)?);
        }
        let mut name_offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            name_offsets.push(cur.read_u32::<LittleEndian>()?);
        }
        let names_blob_start = cur.position();
        let blob = cur.into_inner();

        let mut entries = Vec::with_capacity(count as usize);
        for (payload, name_off) in payloads.into_iter().zip(name_offsets.into_iter()) {
            let abs = names_blob_start as usize + name_off as usize;
            if abs + 2 > blob.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link table name offset out of bounds",
                ));
            }
            let len = u16::from_le_bytes([blob[abs], blob[abs + 1]]) as usize;
            let start = abs + 2;
            let end = start + len * 2;
            if end > blob.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link table name runs past end of blob",
                ));
            }
            let name = blob[start..end]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            entries.push(LinkTableEntry { name, payload });
        }

        Ok(LinkTable { entries })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for e in &self.entries {
            e.payload.write(&mut body)?;
        }

        let mut blob = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            name_offsets.push(blob.len() as u32);
            blob.write_u16::<LittleEndian>(e.name.len() as u16)?;
            for &unit in &e.name {
                blob.write_u16::<LittleEndian>(unit)?;
            }
        }
        for off in name_offsets {
            body.write_u32::<LittleEndian>(off)?;
        }
        body.extend_from_slice(&blob);

        w.write_u32::<LittleEndian>(body.len() as u32)?;
        w.write_all(&body)?;
        Ok(())
    }

    /// Verifies the ordering invariant holds (used by tests and by the
    /// writer right before commit as a cheap self-check).
    pub fn is_sorted(&self, table: &UpcaseTable) -> bool {
        self.entries
            .windows(2)
            .all(|w| compare_utf16le(table, &w[0].name, &w[1].name) != Ordering::Greater)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::upcase::utf8_to_utf16le;

    #[test]
    fn insert_sorted_keeps_order() {
        let table = UpcaseTable::build_ntfs_upcase_table();
        let mut lt: LinkTable<FileId> = LinkTable::new();
        lt.insert_sorted(&table, utf8_to_utf16le("foobar.txt"), FileId(2));
        lt.insert_sorted(&table, utf8_to_utf16le("foo"), FileId(3));
        assert!(lt.is_sorted(&table));
        assert_eq!(lt.entries[0].name, utf8_to_utf16le("foo"));
    }

    #[test]
    fn round_trips_through_bytes() {
        let table = UpcaseTable::build_ntfs_upcase_table();
        let mut lt: LinkTable<FileId> = LinkTable::new();
        lt.insert_sorted(&table, utf8_to_utf16le("b"), FileId(1));
        lt.insert_sorted(&table, utf8_to_utf16le("a"), FileId(2));

        let mut buf = Vec::new();
        lt.write(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        let decoded: LinkTable<FileId> = LinkTable::read(&mut cur).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.find(&table, "a").unwrap().payload, FileId(2));
        assert_eq!(decoded.find(&table, "B").unwrap().payload, FileId(1));
    }
}
