//! `FilesystemHeader` and `RegionSet` (spec.md §3 "Filesystem header", §6).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use uuid::Uuid;

use super::common_header::{CommonHeader, CIM_MAGIC, CURRENT_VERSION, MIN_SUPPORTED_VERSION};
use super::region_offset::RegionOffset;

/// Identifies one region set: a GUID plus how many `region_<guid>_<i>`
/// files belong to it (spec.md §3 "Image").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSet {
    pub id: Uuid,
    pub region_count: u32,
}

impl RegionSet {
    pub const ENCODED_SIZE: usize = 16 + 4;

    pub fn read(r: &mut impl Read) -> io::Result<RegionSet> {
        let mut bytes = [0u8; 16];
        r.read_exact(&mut bytes)?;
        let id = Uuid::from_bytes(bytes);
        let region_count = r.read_u32::<LittleEndian>()?;
        Ok(RegionSet { id, region_count })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(self.id.as_bytes())?;
        w.write_u32::<LittleEndian>(self.region_count)?;
        Ok(())
    }
}

/// `FilesystemHeader { CommonHeader, RegionSet, filesystem_offset,
/// parent_count_u16, ParentRegionSets[parent_count] }` (spec.md §6).
#[derive(Debug, Clone)]
pub struct FilesystemHeader {
    pub common: CommonHeader,
    pub region_set: RegionSet,
    pub filesystem_offset: RegionOffset,
    pub parent_region_sets: Vec<RegionSet>,
}

impl FilesystemHeader {
    pub fn new(region_set: RegionSet, filesystem_offset: RegionOffset, parents: Vec<RegionSet>) -> Self {
        FilesystemHeader {
            common: CommonHeader {
                magic: CIM_MAGIC,
                version: CURRENT_VERSION,
            },
            region_set,
            filesystem_offset,
            parent_region_sets: parents,
        }
    }

    pub fn read(r: &mut impl Read) -> io::Result<FilesystemHeader> {
        let common = CommonHeader::read(r)?;
        let region_set = RegionSet::read(r)?;
        let filesystem_offset = RegionOffset::read(r)?;
        let parent_count = r.read_u16::<LittleEndian>()?;
        let mut parent_region_sets = Vec::with_capacity(parent_count as usize);
        for _ in 0..parent_count {
            parent_region_sets.push(RegionSet::read(r)?);
        }
        Ok(FilesystemHeader {
            common,
            region_set,
            filesystem_offset,
            parent_region_sets,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        self.common.write(w)?;
        self.region_set.write(w)?;
        self.filesystem_offset.write(w)?;
        w.write_u16::<LittleEndian>(self.parent_region_sets.len() as u16)?;
        for p in &self.parent_region_sets {
            p.write(w)?;
        }
        Ok(())
    }

    /// spec.md §3 invariants: magic matches, `current.major >=
    /// header.major >= min_supported.major`, total region count in
    /// `(0, 2^16)`.
    pub fn validate(&self, cim: &std::path::Path) -> Result<(), crate::error::Error> {
        use crate::error::Error;

        if !self.common.is_magic(&CIM_MAGIC) {
            return Err(Error::NotACim { cim: cim.to_path_buf() });
        }
        if self.common.version.major > CURRENT_VERSION.major
            || self.common.version.major < MIN_SUPPORTED_VERSION.major
        {
            return Err(Error::UnsupportedVersion {
                cim: cim.to_path_buf(),
                found_major: self.common.version.major,
                found_minor: self.common.version.minor,
                min_major: MIN_SUPPORTED_VERSION.major,
                min_minor: MIN_SUPPORTED_VERSION.minor,
            });
        }
        let total: u64 = self.parent_region_sets.iter().map(|p| p.region_count as u64).sum::<u64>()
            + self.region_set.region_count as u64;
        if total == 0 || total >= (1u64 << 16) {
            return Err(Error::InvalidRegionCount {
                cim: cim.to_path_buf(),
                count: total as u32,
            });
        }
        Ok(())
    }
}
