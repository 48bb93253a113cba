//! C2: region store. Opens each region file, validates its header, maps
//! it read-only, and serves bounds-checked `(offset, len) -> bytes`
//! (spec.md §4.1). The store never interprets the bytes it returns.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::format::{RegionHeader, RegionOffset, RegionSet};

/// Soft cap before the writer rolls a region set over to a new region
/// file (spec.md §9 supplement; purely a writer convenience, the reader
/// never assumes any boundary).
pub const DEFAULT_REGION_SIZE_LIMIT: u64 = 1 << 30;

pub fn region_file_name(region_set: Uuid, index: u32) -> String {
    format!("region_{region_set}_{index}")
}

pub fn object_id_file_name(region_set: Uuid, index: u32) -> String {
    format!("objectid_{region_set}_{index}")
}

/// Read-only view over one region set's files, one `Mmap` per
/// `region_<guid>_<index>` file, indexed 1-based (index 0 is the null
/// sentinel and has no backing file).
struct MappedRegionSet {
    maps: Vec<Option<Mmap>>,
}

/// Flattened, bounds-checked view across a child image's own regions and
/// every parent region-set it was forked from. Parent regions are loaded
/// first, in declared order, then the image's own (spec.md invariant 4).
pub struct RegionStore {
    cim_path: PathBuf,
    /// Indexed by the *global* `region_index` found in a `RegionOffset`.
    /// Slot 0 is always empty (null sentinel).
    regions: Vec<Option<Mmap>>,
}

impl RegionStore {
    pub fn open(
        cim_path: &Path,
        layer_dir: &Path,
        own: &RegionSet,
        parents: &[RegionSet],
    ) -> Result<RegionStore> {
        let mut regions: Vec<Option<Mmap>> = vec![None];

        for set in parents.iter().chain(std::iter::once(own)) {
            let mapped = Self::open_one_set(layer_dir, set)?;
            regions.extend(mapped.maps);
        }

        Ok(RegionStore {
            cim_path: cim_path.to_path_buf(),
            regions,
        })
    }

    fn open_one_set(layer_dir: &Path, set: &RegionSet) -> Result<MappedRegionSet> {
        let mut maps = Vec::with_capacity(set.region_count as usize);
        for index in 1..=set.region_count {
            let path = layer_dir.join(region_file_name(set.id, index));
            log::debug!(target: "cimfs::region", "opening region file {}", path.display());
            let file = File::open(&path).map_err(Error::Io)?;
            let header = {
                let mut f = &file;
                RegionHeader::read(&mut f).map_err(Error::Io)?
            };
            if !header.common.is_magic(&crate::format::REGION_MAGIC) {
                return Err(Error::NotACim { cim: path });
            }
            // Safety: the file is exclusively read-only for the lifetime of
            // this store and region files are never mutated once written
            // (spec.md invariant 5); nothing else in this process maps it.
            let mmap = unsafe { Mmap::map(&file) }.map_err(Error::Io)?;
            maps.push(Some(mmap));
        }
        Ok(MappedRegionSet { maps })
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Returns the *whole* mapped file, header included: `RegionOffset`s
    /// produced by `RegionSetWriter::append` are file-absolute (the first
    /// blob already lands at `RegionHeader::ENCODED_SIZE`), so stripping
    /// the header here a second time would shift every dereference.
    fn region_bytes(&self, region_index: u16) -> Result<&[u8]> {
        let region = self
            .regions
            .get(region_index as usize)
            .and_then(|o| o.as_ref())
            .ok_or_else(|| Error::InvalidRegionOffset {
                cim: self.cim_path.clone(),
                region_index,
                byte_offset: 0,
                region_size: 0,
            })?;
        Ok(region)
    }

    /// Bounds-checked accessor (spec.md invariant 1 / §4.1): fails when
    /// `region_index` is out of range, `byte_offset == 0` (null),
    /// `byte_offset > region_size`, or `offset + len > region_size`.
    pub fn read(&self, offset: RegionOffset, len: u64) -> Result<&[u8]> {
        if offset.is_null() {
            return Err(Error::InvalidRegionOffset {
                cim: self.cim_path.clone(),
                region_index: offset.region_index,
                byte_offset: offset.byte_offset,
                region_size: 0,
            });
        }
        let bytes = self.region_bytes(offset.region_index)?;
        let region_size = bytes.len() as u64;
        let start = offset.byte_offset;
        let end = start.checked_add(len).ok_or_else(|| Error::InvalidRegionOffset {
            cim: self.cim_path.clone(),
            region_index: offset.region_index,
            byte_offset: offset.byte_offset,
            region_size,
        })?;
        if start > region_size || end > region_size {
            return Err(Error::TruncatedRead {
                cim: self.cim_path.clone(),
                offset: start,
                wanted: len,
                available: region_size.saturating_sub(start),
            });
        }
        Ok(&bytes[start as usize..end as usize])
    }
}

/// Write-side counterpart: tracks a high-water mark per region file and
/// rolls to a new file when the soft cap is hit. Exclusively owned by one
/// `Writer` (spec.md §5 "region files are exclusively owned by the
/// writer until `Close`").
pub struct RegionSetWriter {
    layer_dir: PathBuf,
    region_set_id: Uuid,
    size_limit: u64,
    /// Number of region files contributed by parent region-sets this
    /// writer was forked from; this image's own files are indexed
    /// starting right after them in the flattened global numbering a
    /// `RegionOffset` uses (spec.md invariant 4).
    base_index: u32,
    current_index: u32,
    current_file: Option<BufWriter<File>>,
    current_len: u64,
    finished_counts: u32,
}

impl RegionSetWriter {
    pub fn create(
        layer_dir: &Path,
        region_set_id: Uuid,
        size_limit: u64,
        base_index: u32,
    ) -> Result<RegionSetWriter> {
        let mut w = RegionSetWriter {
            layer_dir: layer_dir.to_path_buf(),
            region_set_id,
            size_limit,
            base_index,
            current_index: 0,
            current_file: None,
            current_len: 0,
            finished_counts: 0,
        };
        w.roll()?;
        Ok(w)
    }

    fn roll(&mut self) -> Result<()> {
        self.current_index += 1;
        self.finished_counts = self.current_index;
        let path = self
            .layer_dir
            .join(region_file_name(self.region_set_id, self.current_index));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::Io)?;
        let mut writer = BufWriter::new(file);
        RegionHeader::fresh().write(&mut writer).map_err(Error::Io)?;
        self.current_len = RegionHeader::ENCODED_SIZE as u64;
        self.current_file = Some(writer);
        Ok(())
    }

    /// Appends `bytes`, rolling to a new region file first if they would
    /// not fit under the soft cap, and returns the `RegionOffset` they
    /// now live at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<RegionOffset> {
        if self.current_len + bytes.len() as u64 > self.size_limit && self.current_len > RegionHeader::ENCODED_SIZE as u64
        {
            self.roll()?;
        }
        let offset = self.current_len;
        self.current_file
            .as_mut()
            .expect("region writer always has a current file")
            .write_all(bytes)
            .map_err(Error::Io)?;
        self.current_len += bytes.len() as u64;
        Ok(RegionOffset::new((self.base_index + self.current_index) as u16, offset))
    }

    pub fn region_set(&self) -> RegionSet {
        RegionSet {
            id: self.region_set_id,
            region_count: self.finished_counts,
        }
    }

    /// Flushes the current region file. Region files otherwise need no
    /// trailer: the primary `.cim` file is the single point a torn write
    /// is detected at (spec.md §4.4 `Commit`).
    pub fn flush(&mut self) -> Result<()> {
        if let Some(f) = self.current_file.as_mut() {
            f.flush().map_err(Error::Io)?;
        }
        Ok(())
    }
}
