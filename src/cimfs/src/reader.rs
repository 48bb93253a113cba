//! C4: reader. Opens an image, walks the parent region chain, resolves
//! FileIDs to inodes, serves stat/read/readdir/open-stream (spec.md §4.3).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::format::{
    Attributes, FileId, FileRecord, FileTableDirectoryEntry, FilesystemHeader, FilesystemRecord,
    LinkTable, PeMappingTable, RegionOffset, Stream, StreamType, UpcaseTable, FILES_PER_TABLE,
};
use crate::region::RegionStore;

/// Caches the reader is allowed to grow without bound for its lifetime
/// (spec.md §3 "Caches (reader)"): inodes, interned secondary-data blobs,
/// and lazily loaded link tables. All insert-only — inodes are immutable
/// once written (spec.md §9 "Parent-chain mutable map cache").
#[derive(Default)]
struct Caches {
    inodes: HashMap<u32, FileRecord>,
    sd: HashMap<(u16, u64), Vec<u8>>,
    ea: HashMap<(u16, u64), Vec<u8>>,
    link_tables: HashMap<u32, LinkTable<FileId>>,
    stream_tables: HashMap<u32, LinkTable<Stream>>,
}

/// A thread-safe, read-only opened image (spec.md §5 "multi-reader
/// safe"). Lock scope for `Caches` never spans I/O — only lookup/insert.
pub struct Reader {
    cim_path: PathBuf,
    regions: RegionStore,
    fs_record: FilesystemRecord,
    upcase: UpcaseTable,
    own_region_set: crate::format::RegionSet,
    parent_region_sets: Vec<crate::format::RegionSet>,
    caches: Mutex<Caches>,
}

/// Options controlling `Reader::open` (see SPEC_FULL.md §10.3).
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub validate_on_open: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions { validate_on_open: true }
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub creation_time: crate::format::FileTime,
    pub last_write_time: crate::format::FileTime,
    pub change_time: crate::format::FileTime,
    pub last_access_time: crate::format::FileTime,
    pub attributes: Attributes,
    pub security_descriptor: Vec<u8>,
    pub extended_attributes: Vec<u8>,
    pub reparse_buffer: Vec<u8>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }
}

impl Reader {
    pub fn open(cim_path: impl AsRef<Path>) -> Result<Reader> {
        Self::open_with(cim_path, ReaderOptions::default())
    }

    pub fn open_with(cim_path: impl AsRef<Path>, opts: ReaderOptions) -> Result<Reader> {
        let cim_path = cim_path.as_ref().to_path_buf();
        log::info!(target: "cimfs::reader", "opening {}", cim_path.display());

        let mut file = File::open(&cim_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotACim { cim: cim_path.clone() }
            } else {
                Error::Io(e)
            }
        })?;
        let header = FilesystemHeader::read(&mut file).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::NotACim { cim: cim_path.clone() },
            _ => Error::Io(e),
        })?;
        header.validate(&cim_path)?;

        let layer_dir = cim_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let regions = RegionStore::open(&cim_path, &layer_dir, &header.region_set, &header.parent_region_sets)?;

        let fs_record = {
            let bytes = regions.read(header.filesystem_offset, FilesystemRecord::ENCODED_SIZE as u64)?;
            FilesystemRecord::read(&mut &bytes[..]).map_err(Error::Io)?
        };

        let upcase = {
            let bytes = regions.read(
                fs_record.upcase_table_offset,
                (crate::format::upcase::UPCASE_TABLE_LEN * 2) as u64,
            )?;
            UpcaseTable::read(&mut &bytes[..]).map_err(Error::Io)?
        };

        let reader = Reader {
            cim_path,
            regions,
            fs_record,
            upcase,
            own_region_set: header.region_set,
            parent_region_sets: header.parent_region_sets,
            caches: Mutex::new(Caches::default()),
        };

        if opts.validate_on_open {
            reader.load_inode(reader.fs_record.root_file_id)?;
        }

        Ok(reader)
    }

    pub fn cim_path(&self) -> &Path {
        &self.cim_path
    }

    /// This image's own region-set and its full ancestor chain, in the
    /// order `RegionStore::open` expects them (spec.md invariant 4). A
    /// writer forking from this image flattens `parent_region_sets +
    /// [own_region_set]` into the child's own `parent_region_sets`.
    pub fn region_sets(&self) -> (crate::format::RegionSet, &[crate::format::RegionSet]) {
        (self.own_region_set, &self.parent_region_sets)
    }

    pub fn upcase_table(&self) -> &UpcaseTable {
        &self.upcase
    }

    /// The inode's default stream exactly as stored, without copying its
    /// content — used when cloning a parent's file metadata into a forked
    /// child so the child's copy still points at the parent's bytes.
    pub fn raw_default_stream(&self, handle: &CimFile) -> Result<Stream> {
        Ok(self.load_inode(handle.file_id)?.default_stream)
    }

    pub fn raw_alternate_streams(&self, handle: &CimFile) -> Result<Vec<(String, Stream)>> {
        let inode = self.load_inode(handle.file_id)?;
        let st = self.load_stream_table(handle.file_id, &inode)?;
        Ok(st
            .entries
            .iter()
            .filter(|e| e.payload.stream_type == StreamType::Data)
            .map(|e| (crate::format::upcase::utf16le_to_string_lossy(&e.name), e.payload))
            .collect())
    }

    fn file_table_directory(&self) -> Result<Vec<FileTableDirectoryEntry>> {
        let bytes = self.regions.read(
            self.fs_record.file_table_directory_offset,
            self.fs_record.file_table_directory_len,
        )?;
        let count = self.fs_record.file_table_count as usize;
        let mut cur = std::io::Cursor::new(bytes);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(FileTableDirectoryEntry::read(&mut cur).map_err(Error::Io)?);
        }
        Ok(out)
    }

    fn load_inode(&self, id: u32) -> Result<FileRecord> {
        if let Some(rec) = self.caches.lock().unwrap().inodes.get(&id) {
            return Ok(rec.clone());
        }

        let (table_idx, slot) = crate::format::file_record::file_id_coordinates(id, FILES_PER_TABLE);
        let directory = self.file_table_directory()?;
        let entry = directory.get(table_idx as usize).ok_or(Error::FileNotFound {
            path: PathBuf::from(format!("<file id {id}>")),
        })?;
        if slot >= entry.entry_count {
            return Err(Error::FileNotFound {
                path: PathBuf::from(format!("<file id {id}>")),
            });
        }
        let record_bytes = self
            .regions
            .read(entry.offset, (entry.entry_count as u64) * (entry.entry_size as u64))?;
        let start = slot as usize * entry.entry_size as usize;
        let end = start + entry.entry_size as usize;
        let record = FileRecord::read_padded(&record_bytes[start..end]).map_err(Error::Io)?;

        self.caches.lock().unwrap().inodes.insert(id, record.clone());
        Ok(record)
    }

    fn load_link_table(&self, id: u32, inode: &FileRecord) -> Result<LinkTable<FileId>> {
        if let Some(lt) = self.caches.lock().unwrap().link_tables.get(&id) {
            return Ok(lt.clone());
        }
        if inode.default_stream.stream_type != StreamType::LinkTable {
            return Err(Error::NotADirectory {
                path: PathBuf::from(format!("<file id {id}>")),
            });
        }
        let bytes = self
            .regions
            .read(inode.default_stream.data_offset, inode.default_stream.size)?;
        let lt = LinkTable::read(&mut &bytes[..]).map_err(Error::Io)?;
        self.caches.lock().unwrap().link_tables.insert(id, lt.clone());
        Ok(lt)
    }

    fn load_stream_table(&self, id: u32, inode: &FileRecord) -> Result<LinkTable<Stream>> {
        if let Some(st) = self.caches.lock().unwrap().stream_tables.get(&id) {
            return Ok(st.clone());
        }
        if inode.stream_table.is_null() {
            return Ok(LinkTable::new());
        }
        // Stream tables are stored as a LinkTable<Stream> blob whose own
        // length is self-describing (size_u32 prefix), so peek that first.
        let size_prefix = self.regions.read(inode.stream_table, 4)?;
        let body_len = u32::from_le_bytes(size_prefix.try_into().unwrap()) as u64 + 4;
        let bytes = self.regions.read(inode.stream_table, body_len)?;
        let st = LinkTable::read(&mut &bytes[..]).map_err(Error::Io)?;
        self.caches.lock().unwrap().stream_tables.insert(id, st.clone());
        Ok(st)
    }

    fn cached_blob(
        &self,
        which: BlobKind,
        offset: RegionOffset,
        len: u32,
    ) -> Result<Vec<u8>> {
        if offset.is_null() || len == 0 {
            return Ok(Vec::new());
        }
        let key = (offset.region_index, offset.byte_offset);
        {
            let caches = self.caches.lock().unwrap();
            let cache = match which {
                BlobKind::SecurityDescriptor => &caches.sd,
                BlobKind::ExtendedAttributes => &caches.ea,
            };
            if let Some(v) = cache.get(&key) {
                return Ok(v.clone());
            }
        }
        let bytes = self.regions.read(offset, len as u64)?.to_vec();
        let mut caches = self.caches.lock().unwrap();
        let cache = match which {
            BlobKind::SecurityDescriptor => &mut caches.sd,
            BlobKind::ExtendedAttributes => &mut caches.ea,
        };
        cache.insert(key, bytes.clone());
        Ok(bytes)
    }

    /// `OpenAt(dir?, path)` (spec.md §4.3). `dir` is the starting inode; a
    /// leading `/` in `path` makes it absolute regardless of `dir`.
    pub fn open_at(&self, dir: Option<&CimFile>, path: &str) -> Result<CimFile> {
        let cleaned = clean_path(path);
        let absolute = cleaned.starts_with('/');
        let mut current_id = if absolute || dir.is_none() {
            self.fs_record.root_file_id
        } else {
            dir.unwrap().file_id
        };

        let trailing_slash = cleaned.len() > 1 && cleaned.ends_with('/');
        let components: Vec<&str> = cleaned.split('/').filter(|c| !c.is_empty()).collect();

        let mut inode = self.load_inode(current_id)?;
        for (i, component) in components.iter().enumerate() {
            if !inode.is_directory() {
                return Err(Error::path_ctx(
                    &self.cim_path,
                    "open",
                    path,
                    Error::NotADirectory {
                        path: PathBuf::from(*component),
                    },
                ));
            }
            let lt = self.load_link_table(current_id, &inode)?;
            let entry = lt.find(&self.upcase, component).ok_or_else(|| {
                Error::path_ctx(
                    &self.cim_path,
                    "open",
                    path,
                    Error::FileNotFound {
                        path: PathBuf::from(*component),
                    },
                )
            })?;
            current_id = entry.payload.0;
            inode = self.load_inode(current_id)?;
            let is_last = i + 1 == components.len();
            if is_last && trailing_slash && !inode.is_directory() {
                return Err(Error::path_ctx(
                    &self.cim_path,
                    "open",
                    path,
                    Error::NotADirectory { path: PathBuf::from(path) },
                ));
            }
        }

        Ok(CimFile {
            file_id: current_id,
            path: path.to_string(),
            cursor: 0,
        })
    }

    pub fn root(&self) -> CimFile {
        CimFile {
            file_id: self.fs_record.root_file_id,
            path: "/".to_string(),
            cursor: 0,
        }
    }

    pub fn stat(&self, handle: &CimFile) -> Result<FileInfo> {
        let inode = self.load_inode(handle.file_id)?;
        let size = if inode.is_directory() { 0 } else { inode.default_stream.size };
        Ok(FileInfo {
            size,
            creation_time: inode.creation_time,
            last_write_time: inode.last_write_time,
            change_time: inode.change_time,
            last_access_time: inode.last_access_time,
            attributes: inode.synthesized_attributes(),
            security_descriptor: self.cached_blob(
                BlobKind::SecurityDescriptor,
                inode.security_descriptor,
                inode.security_descriptor_len,
            )?,
            extended_attributes: self.cached_blob(
                BlobKind::ExtendedAttributes,
                inode.extended_attributes,
                inode.extended_attributes_len,
            )?,
            reparse_buffer: if inode.reparse_buffer.is_null() {
                Vec::new()
            } else {
                self.regions
                    .read(inode.reparse_buffer, inode.reparse_buffer_len as u64)?
                    .to_vec()
            },
        })
    }

    /// `File.Read` (spec.md §4.3). Only legal for `Data`/`PeImage` default
    /// streams; signals end-of-stream when `remaining == 0`.
    pub fn read(&self, handle: &mut CimFile, buf: &mut [u8]) -> Result<usize> {
        let inode = self.load_inode(handle.file_id)?;
        self.read_stream_at(&inode.default_stream, &mut handle.cursor, buf, &handle.path, None)
    }

    /// Shared by `read` (default stream, `stream_name = None`) and
    /// `read_stream` (named alternate stream). Errors are wrapped with
    /// `path_ctx` for the former and `stream_ctx` for the latter so the
    /// surfaced error names exactly what the caller asked for.
    fn read_stream_at(
        &self,
        stream: &Stream,
        cursor: &mut u64,
        buf: &mut [u8],
        path: &str,
        stream_name: Option<&str>,
    ) -> Result<usize> {
        let wrap = |inner: Error| match stream_name {
            Some(name) => Error::stream_ctx(&self.cim_path, "read", path, name, inner),
            None => Error::path_ctx(&self.cim_path, "read", path, inner),
        };

        if *cursor >= stream.size {
            return Ok(0);
        }
        match stream.stream_type {
            StreamType::Data => {
                let remaining = stream.size - *cursor;
                let want = (buf.len() as u64).min(remaining);
                let offset = RegionOffset::new(
                    stream.data_offset.region_index,
                    stream.data_offset.byte_offset + *cursor,
                );
                let bytes = self.regions.read(offset, want).map_err(wrap)?;
                buf[..bytes.len()].copy_from_slice(bytes);
                *cursor += bytes.len() as u64;
                Ok(bytes.len())
            }
            StreamType::PeImage => {
                let mapping_prefix = self.regions.read(stream.data_offset, 4).map_err(wrap)?;
                let mapping_count = u32::from_le_bytes(mapping_prefix.try_into().unwrap());
                let mapping_bytes_len =
                    4 + mapping_count as u64 * crate::format::PeMappingEntry::ENCODED_SIZE as u64;
                let mapping_bytes = self
                    .regions
                    .read(stream.data_offset, mapping_bytes_len)
                    .map_err(wrap)?;
                let mapping = PeMappingTable::read(&mut &mapping_bytes[..]).map_err(Error::Io).map_err(wrap)?;
                let segment_data_offset = RegionOffset::new(
                    stream.data_offset.region_index,
                    stream.data_offset.byte_offset + mapping_bytes_len,
                );

                let (delta, segment_end) = mapping
                    .resolve(*cursor)
                    .ok_or_else(|| wrap(Error::InvalidArgument("no PE mapping segment covers offset")))?;
                let remaining_in_segment = segment_end.saturating_sub(*cursor).min(stream.size - *cursor);
                let want = (buf.len() as u64).min(remaining_in_segment);
                let physical = (*cursor as i64 + delta) as u64;
                let offset = RegionOffset::new(
                    segment_data_offset.region_index,
                    segment_data_offset.byte_offset + physical,
                );
                let bytes = self.regions.read(offset, want).map_err(wrap)?;
                buf[..bytes.len()].copy_from_slice(bytes);
                *cursor += bytes.len() as u64;
                Ok(bytes.len())
            }
            StreamType::LinkTable => Err(wrap(Error::InvalidArgument(
                "link table is not readable as a byte stream",
            ))),
        }
    }

    /// `File.Readdir` (spec.md §4.3).
    pub fn readdir(&self, handle: &CimFile) -> Result<Vec<String>> {
        let inode = self.load_inode(handle.file_id)?;
        if !inode.is_directory() {
            return Err(Error::NotADirectory {
                path: PathBuf::from(&handle.path),
            });
        }
        let lt = self.load_link_table(handle.file_id, &inode)?;
        Ok(lt
            .entries
            .iter()
            .map(|e| crate::format::upcase::utf16le_to_string_lossy(&e.name))
            .collect())
    }

    /// `File.Readstreams` (spec.md §4.3): only `Data`-typed alternate
    /// streams are exposed.
    pub fn readstreams(&self, handle: &CimFile) -> Result<Vec<String>> {
        let inode = self.load_inode(handle.file_id)?;
        let st = self.load_stream_table(handle.file_id, &inode)?;
        Ok(st
            .entries
            .iter()
            .filter(|e| e.payload.stream_type == StreamType::Data)
            .map(|e| crate::format::upcase::utf16le_to_string_lossy(&e.name))
            .collect())
    }

    pub fn open_stream(&self, handle: &CimFile, name: &str) -> Result<CimStream> {
        let inode = self.load_inode(handle.file_id)?;
        let st = self.load_stream_table(handle.file_id, &inode)?;
        let entry = st.find(&self.upcase, name).ok_or_else(|| {
            Error::stream_ctx(
                &self.cim_path,
                "open_stream",
                &handle.path,
                name,
                Error::FileNotFound { path: PathBuf::from(name) },
            )
        })?;
        if entry.payload.stream_type != StreamType::Data {
            return Err(Error::stream_ctx(
                &self.cim_path,
                "open_stream",
                &handle.path,
                name,
                Error::UnsupportedStreamType {
                    cim: self.cim_path.clone(),
                    code: entry.payload.stream_type.code(),
                },
            ));
        }
        Ok(CimStream {
            owner_path: handle.path.clone(),
            name: name.to_string(),
            stream: entry.payload,
            cursor: 0,
        })
    }

    pub fn read_stream(&self, stream: &mut CimStream, buf: &mut [u8]) -> Result<usize> {
        self.read_stream_at(
            &stream.stream,
            &mut stream.cursor,
            buf,
            &stream.owner_path,
            Some(&stream.name),
        )
    }
}

enum BlobKind {
    SecurityDescriptor,
    ExtendedAttributes,
}

/// An open file handle with an independent read cursor (spec.md §4.3
/// "State machine per `File`"). Multiple handles may point at the same
/// inode.
pub struct CimFile {
    file_id: u32,
    path: String,
    cursor: u64,
}

impl CimFile {
    pub fn path(&self) -> &str {
        &self.path
    }
}

pub struct CimStream {
    owner_path: String,
    name: String,
    stream: Stream,
    cursor: u64,
}

/// `path.Clean`-equivalent normalization ahead of component splitting
/// (spec.md §4.3 `OpenAt`): collapses `//`, drops `.` components, and
/// resolves `..` lexically. Does not touch a leading `/`.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if !absolute {
                    stack.push("..");
                } else if !stack.is_empty() {
                    stack.pop();
                }
            }
            c => stack.push(c),
        }
    }
    let joined = stack.join("/");
    let mut out = String::new();
    if absolute {
        out.push('/');
    }
    out.push_str(&joined);
    if path.ends_with('/') && !out.ends_with('/') && out != "/" {
        out.push('/');
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_collapses_dots_and_slashes() {
        assert_eq!(clean_path("foo//bar/./baz"), "foo/bar/baz");
        assert_eq!(clean_path("/foo/../bar"), "/bar");
        assert_eq!(clean_path("foo/"), "foo/");
    }
}
