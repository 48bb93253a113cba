//! C5: writer. Emits a new image, optionally forked from a parent,
//! through the active-stream state machine described in spec.md §4.4 and
//! re-architected per §9 ("Active-writer implicit global") into explicit
//! `WriterState` variants.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::format::file_record::BasicInfo;
use crate::format::{
    upcase::utf8_to_utf16le, Attributes, FileId, FileRecord, FileTableDirectoryEntry, FileTime,
    FilesystemHeader, FilesystemRecord, LinkTable, RegionOffset, RegionSet, Stream, StreamType,
    UpcaseTable, FILES_PER_TABLE,
};
use crate::reader::Reader;
use crate::region::{RegionSetWriter, DEFAULT_REGION_SIZE_LIMIT};

/// See SPEC_FULL.md §10.3: `strict_overrun` governs what happens when a
/// stream is closed (explicitly or implicitly, by the next state-changing
/// call) before its declared size has been fully written.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub region_size_limit: u64,
    pub strict_overrun: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            region_size_limit: DEFAULT_REGION_SIZE_LIMIT,
            strict_overrun: true,
        }
    }
}

#[derive(Clone)]
struct PendingFile {
    is_directory: bool,
    attributes: Attributes,
    creation_time: FileTime,
    last_write_time: FileTime,
    change_time: FileTime,
    last_access_time: FileTime,
    reparse_tag: u32,
    security_descriptor: Vec<u8>,
    extended_attributes: Vec<u8>,
    reparse_buffer: Vec<u8>,
    default_stream: Stream,
    stream_table: RegionOffset,
    /// Directory children as `(name, FileId)`, insertion order; sorted
    /// into a `LinkTable` only at commit.
    children: Vec<(String, u32)>,
    alt_streams: Vec<(String, Stream)>,
}

enum StreamTarget {
    Default(u32),
    Alternate(u32, String),
}

enum WriterState {
    Idle,
    StreamActive {
        target: StreamTarget,
        stream_type: StreamType,
        declared_size: u64,
        remaining: u64,
        buffer: Vec<u8>,
    },
    Closed,
}

/// Emits one new CIMFS image (spec.md §4.4). Not `Send`/`Sync` by
/// construction (holds `RegionSetWriter`'s exclusive file handles) —
/// matches spec.md §5 "exclusively owned by its creator".
pub struct Writer {
    layer_dir: PathBuf,
    new_name: String,
    regions: RegionSetWriter,
    upcase: UpcaseTable,
    parent_region_sets: Vec<RegionSet>,
    files: Vec<PendingFile>,
    path_to_id: HashMap<String, u32>,
    dedup: HashMap<[u8; 16], RegionOffset>,
    state: WriterState,
    options: WriterOptions,
}

/// Writer paths are stored and looked up with `/` separators; callers may
/// pass either convention (the composer's tar entries and the host-layout
/// hive/BCD constants are `\`-separated, matching spec.md's literal
/// Windows-style paths).
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

impl Writer {
    /// `Create(imagePath, parentName?, newName)` (spec.md §4.4). `layer_dir`
    /// is the `cim-layers` directory all forks in a stack share (spec.md §6
    /// "Host-side layout").
    pub fn create(
        layer_dir: impl AsRef<Path>,
        parent_name: Option<&str>,
        new_name: &str,
        options: WriterOptions,
    ) -> Result<Writer> {
        let layer_dir = layer_dir.as_ref().to_path_buf();

        if new_name.is_empty() && parent_name.map_or(true, str::is_empty) {
            return Err(Error::InvalidArgument(
                "Writer::create requires a non-empty newName when no parentName is given",
            ));
        }

        let region_set_id = Uuid::new_v4();
        let root = PendingFile {
            is_directory: true,
            attributes: Attributes::empty(),
            creation_time: FileTime::default(),
            last_write_time: FileTime::default(),
            change_time: FileTime::default(),
            last_access_time: FileTime::default(),
            reparse_tag: 0,
            security_descriptor: crate::format::security::null_dacl_sd(),
            extended_attributes: Vec::new(),
            reparse_buffer: Vec::new(),
            default_stream: Stream {
                stream_type: StreamType::LinkTable,
                size: 0,
                data_offset: RegionOffset::NULL,
            },
            stream_table: RegionOffset::NULL,
            children: Vec::new(),
            alt_streams: Vec::new(),
        };

        let mut writer = match parent_name {
            Some(name) if !name.is_empty() => {
                log::info!(target: "cimfs::writer", "forking {new_name} from {name}");
                let parent = Reader::open(layer_dir.join(name))?;
                let (parent_own, parent_ancestors) = parent.region_sets();
                let mut parent_region_sets: Vec<RegionSet> = parent_ancestors.to_vec();
                parent_region_sets.push(parent_own);
                let base_index: u32 = parent_region_sets.iter().map(|s| s.region_count).sum();

                let regions =
                    RegionSetWriter::create(&layer_dir, region_set_id, options.region_size_limit, base_index)?;

                let mut writer = Writer {
                    layer_dir,
                    new_name: new_name.to_string(),
                    regions,
                    upcase: parent.upcase_table().clone(),
                    parent_region_sets,
                    files: vec![root],
                    path_to_id: HashMap::new(),
                    dedup: HashMap::new(),
                    state: WriterState::Idle,
                    options,
                };
                writer.path_to_id.insert(String::new(), 1);
                writer.clone_subtree(&parent, &parent.root(), "")?;
                writer
            }
            _ => {
                let regions = RegionSetWriter::create(&layer_dir, region_set_id, options.region_size_limit, 0)?;
                let mut writer = Writer {
                    layer_dir,
                    new_name: new_name.to_string(),
                    regions,
                    upcase: UpcaseTable::build_ntfs_upcase_table(),
                    parent_region_sets: Vec::new(),
                    files: vec![root],
                    path_to_id: HashMap::new(),
                    dedup: HashMap::new(),
                    state: WriterState::Idle,
                    options,
                };
                writer.path_to_id.insert(String::new(), 1);
                writer
            }
        };
        writer.state = WriterState::Idle;
        Ok(writer)
    }

    /// Eagerly copies `parent`'s entire tree rooted at `dir` into this
    /// writer's pending file table. Only metadata is copied; `Stream`
    /// descriptors keep pointing at the parent's region bytes, which stay
    /// reachable through the flattened `RegionStore` a reader builds for a
    /// forked image (spec.md invariant 4).
    fn clone_subtree(&mut self, parent: &Reader, dir: &crate::reader::CimFile, prefix: &str) -> Result<()> {
        for name in parent.readdir(dir)? {
            let child_path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let child = parent.open_at(Some(dir), &name)?;
            let info = parent.stat(&child)?;

            let pending = if info.is_dir() {
                PendingFile {
                    is_directory: true,
                    attributes: info.attributes,
                    creation_time: info.creation_time,
                    last_write_time: info.last_write_time,
                    change_time: info.change_time,
                    last_access_time: info.last_access_time,
                    reparse_tag: 0,
                    security_descriptor: info.security_descriptor,
                    extended_attributes: info.extended_attributes,
                    reparse_buffer: info.reparse_buffer,
                    default_stream: Stream {
                        stream_type: StreamType::LinkTable,
                        size: 0,
                        data_offset: RegionOffset::NULL,
                    },
                    stream_table: RegionOffset::NULL,
                    children: Vec::new(),
                    alt_streams: Vec::new(),
                }
            } else {
                let alt_streams = parent.raw_alternate_streams(&child)?;
                PendingFile {
                    is_directory: false,
                    attributes: info.attributes,
                    creation_time: info.creation_time,
                    last_write_time: info.last_write_time,
                    change_time: info.change_time,
                    last_access_time: info.last_access_time,
                    reparse_tag: 0,
                    security_descriptor: info.security_descriptor,
                    extended_attributes: info.extended_attributes,
                    reparse_buffer: info.reparse_buffer,
                    default_stream: parent.raw_default_stream(&child)?,
                    stream_table: RegionOffset::NULL,
                    children: Vec::new(),
                    alt_streams,
                }
            };

            let is_dir = pending.is_directory;
            let new_id = self.files.len() as u32 + 1;
            self.files.push(pending);
            self.path_to_id.insert(child_path.clone(), new_id);
            let parent_id = *self.path_to_id.get(prefix).expect("parent directory already cloned");
            self.files[(parent_id - 1) as usize].children.push((name, new_id));

            if is_dir {
                self.clone_subtree(parent, &child, &child_path)?;
            }
        }
        Ok(())
    }

    fn append_content(&mut self, stream_type: StreamType, bytes: &[u8]) -> Result<RegionOffset> {
        if bytes.is_empty() {
            return Ok(RegionOffset::NULL);
        }
        if stream_type != StreamType::Data {
            return self.regions.append(bytes);
        }
        let digest = Sha256::digest(bytes);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        if let Some(offset) = self.dedup.get(&key) {
            return Ok(*offset);
        }
        let offset = self.regions.append(bytes)?;
        self.dedup.insert(key, offset);
        Ok(offset)
    }

    /// Finalizes whatever stream is active, if any. Returns `Ok(())`
    /// whether or not a stream was active. Under `strict_overrun` (the
    /// default) a short stream fails the call with `WriteTruncated`
    /// before any state changes; under the lenient policy it stores the
    /// bytes actually written and logs a warning instead.
    fn close_active_stream(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, WriterState::Idle);
        let (target, stream_type, declared_size, remaining, buffer) = match state {
            WriterState::StreamActive {
                target,
                stream_type,
                declared_size,
                remaining,
                buffer,
            } => (target, stream_type, declared_size, remaining, buffer),
            other => {
                self.state = other;
                return Ok(());
            }
        };

        if remaining > 0 {
            if self.options.strict_overrun {
                self.state = WriterState::StreamActive {
                    target,
                    stream_type,
                    declared_size,
                    remaining,
                    buffer,
                };
                return Err(Error::WriteTruncated { remaining });
            }
            log::warn!(
                target: "cimfs::writer",
                "stream closed with {remaining} of {declared_size} bytes undelivered, lenient policy keeps the short write"
            );
        }

        let actual_size = declared_size - remaining;
        let offset = self.append_content(stream_type, &buffer)?;
        let stream = Stream {
            stream_type,
            size: actual_size,
            data_offset: offset,
        };
        match target {
            StreamTarget::Default(id) => self.files[(id - 1) as usize].default_stream = stream,
            StreamTarget::Alternate(id, name) => self.files[(id - 1) as usize].alt_streams.push((name, stream)),
        }
        Ok(())
    }

    /// Whether `path` (normalized, no leading/trailing `/`) has already
    /// been added in this writer session — used by the composer to avoid
    /// re-adding an ancestor directory during hard-link pull-up.
    pub fn contains_path(&self, path: &str) -> bool {
        self.path_to_id.contains_key(path)
    }

    fn lookup_parent(&self, path: &str) -> Result<u32> {
        let (parent_path, _) = split_parent(path);
        self.path_to_id
            .get(parent_path)
            .copied()
            .ok_or_else(|| Error::path_ctx(&self.layer_dir, "add", path, Error::FileNotFound { path: parent_path.into() }))
    }

    fn replace_or_insert_child(&mut self, parent_id: u32, name: &str, new_id: u32) {
        let children = &mut self.files[(parent_id - 1) as usize].children;
        if let Some(slot) = children.iter_mut().find(|(n, _)| n == name) {
            slot.1 = new_id;
        } else {
            children.push((name.to_string(), new_id));
        }
    }

    /// `AddFile(path, basic_info, size, sd, ea, reparse)` (spec.md §4.4).
    /// `basic_info.attributes` carrying `DIRECTORY` selects a `LinkTable`
    /// default stream; the bit itself is never persisted (it, like
    /// `REPARSE_POINT`, is synthesized back by the reader).
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        path: &str,
        basic_info: BasicInfo,
        size: u64,
        sd: Vec<u8>,
        ea: Vec<u8>,
        mut reparse: Vec<u8>,
    ) -> Result<()> {
        self.close_active_stream()?;
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(Error::InvalidArgument("cannot AddFile the root path"));
        }
        let is_directory = basic_info.attributes.contains(Attributes::DIRECTORY);
        let mut reparse_tag = 0u32;
        if basic_info.attributes.contains(Attributes::REPARSE_POINT) && reparse.is_empty() {
            // Spec.md §4.6: some producers set REPARSE_POINT with an empty
            // buffer; treat that as not-a-reparse-point.
            reparse_tag = 0;
        } else if !reparse.is_empty() {
            reparse_tag = 1;
        }
        if reparse.is_empty() {
            reparse.clear();
        }

        let parent_id = self.lookup_parent(&path)?;
        let (_, name) = split_parent(&path);

        let new_id = self.files.len() as u32 + 1;
        let pending = PendingFile {
            is_directory,
            attributes: basic_info.stored_attributes(),
            creation_time: basic_info.creation_time,
            last_write_time: basic_info.last_write_time,
            change_time: basic_info.change_time,
            last_access_time: basic_info.last_access_time,
            reparse_tag,
            security_descriptor: if sd.is_empty() { crate::format::security::null_dacl_sd() } else { sd },
            extended_attributes: ea,
            reparse_buffer: reparse,
            default_stream: Stream {
                stream_type: if is_directory { StreamType::LinkTable } else { StreamType::Data },
                size: 0,
                data_offset: RegionOffset::NULL,
            },
            stream_table: RegionOffset::NULL,
            children: Vec::new(),
            alt_streams: Vec::new(),
        };
        self.files.push(pending);
        self.path_to_id.insert(path.clone(), new_id);
        self.replace_or_insert_child(parent_id, name, new_id);

        let declared_size = if is_directory { 0 } else { size };
        self.state = WriterState::StreamActive {
            target: StreamTarget::Default(new_id),
            stream_type: if is_directory { StreamType::LinkTable } else { StreamType::Data },
            declared_size,
            remaining: declared_size,
            buffer: Vec::with_capacity(declared_size.min(1 << 20) as usize),
        };
        Ok(())
    }

    /// `Write(buf) -> usize` (spec.md §4.4).
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.state {
            WriterState::StreamActive { remaining, buffer, .. } => {
                if buf.len() as u64 > *remaining {
                    return Err(Error::Overrun {
                        attempted: buf.len() as u64,
                        remaining: *remaining,
                    });
                }
                buffer.extend_from_slice(buf);
                *remaining -= buf.len() as u64;
                Ok(buf.len())
            }
            _ => Err(Error::InvalidState),
        }
    }

    /// `AddLink(old_path, new_path)` (spec.md §4.4, resolving the Open
    /// Question in spec.md §9: `new` is created pointing at existing
    /// `old`).
    pub fn add_link(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.close_active_stream()?;
        let old_path = normalize_path(old_path);
        let new_path = normalize_path(new_path);

        let target_id = *self.path_to_id.get(&old_path).ok_or_else(|| {
            Error::link_ctx(
                &self.layer_dir,
                "add_link",
                &old_path,
                &new_path,
                Error::LinkTargetMissing { target: (&old_path).into() },
            )
        })?;
        let parent_id = self.path_to_id.get(split_parent(&new_path).0).copied().ok_or_else(|| {
            Error::link_ctx(
                &self.layer_dir,
                "add_link",
                &old_path,
                &new_path,
                Error::FileNotFound {
                    path: split_parent(&new_path).0.into(),
                },
            )
        })?;
        let (_, name) = split_parent(&new_path);
        self.path_to_id.insert(new_path.clone(), target_id);
        self.replace_or_insert_child(parent_id, name, target_id);
        Ok(())
    }

    /// `CreateAlternateStream(path, size)` (spec.md §4.4). `path` is
    /// `"<owner>:<stream>"`; the composer is responsible for stripping
    /// any trailing `:$DATA` suffix before calling this (spec.md §4.6).
    pub fn create_alternate_stream(&mut self, path: &str, size: u64) -> Result<()> {
        self.close_active_stream()?;
        let (owner, stream_name) = path.rsplit_once(':').ok_or(Error::InvalidArgument(
            "CreateAlternateStream path must be \"owner:stream\"",
        ))?;
        let owner = normalize_path(owner);
        let owner_id = *self.path_to_id.get(&owner).ok_or_else(|| {
            Error::stream_ctx(
                &self.layer_dir,
                "create_alternate_stream",
                &owner,
                stream_name,
                Error::FileNotFound { path: owner.clone().into() },
            )
        })?;
        self.state = WriterState::StreamActive {
            target: StreamTarget::Alternate(owner_id, stream_name.to_string()),
            stream_type: StreamType::Data,
            declared_size: size,
            remaining: size,
            buffer: Vec::with_capacity(size.min(1 << 20) as usize),
        };
        Ok(())
    }

    /// `Unlink(path)` (spec.md §4.4 / §4.6). Removing the entry from its
    /// parent's children list is the only on-disk effect: since the whole
    /// directory's link table is rebuilt at commit regardless of whether
    /// this image is forked, omission alone reproduces tombstone
    /// semantics without a separate on-disk marker.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.close_active_stream()?;
        let path = normalize_path(path);
        let id = self
            .path_to_id
            .remove(&path)
            .ok_or_else(|| Error::path_ctx(&self.layer_dir, "unlink", &path, Error::FileNotFound { path: path.clone().into() }))?;
        let (parent_path, _) = split_parent(&path);
        if let Some(&parent_id) = self.path_to_id.get(parent_path) {
            self.files[(parent_id - 1) as usize].children.retain(|(_, cid)| *cid != id);
        }
        Ok(())
    }

    fn write_directory_link_table(&mut self, file_id: u32) -> Result<()> {
        let children = self.files[(file_id - 1) as usize].children.clone();
        let mut table: LinkTable<FileId> = LinkTable::new();
        for (name, id) in children {
            table.insert_sorted(&self.upcase, utf8_to_utf16le(&name), FileId(id));
        }
        let mut buf = Vec::new();
        table.write(&mut buf).map_err(Error::Io)?;
        let offset = self.regions.append(&buf)?;
        let pending = &mut self.files[(file_id - 1) as usize];
        pending.default_stream = Stream {
            stream_type: StreamType::LinkTable,
            size: buf.len() as u64,
            data_offset: offset,
        };
        Ok(())
    }

    fn write_stream_table(&mut self, file_id: u32) -> Result<()> {
        let alt_streams = self.files[(file_id - 1) as usize].alt_streams.clone();
        if alt_streams.is_empty() {
            return Ok(());
        }
        let mut table: LinkTable<Stream> = LinkTable::new();
        for (name, stream) in alt_streams {
            table.insert_sorted(&self.upcase, utf8_to_utf16le(&name), stream);
        }
        let mut buf = Vec::new();
        table.write(&mut buf).map_err(Error::Io)?;
        let offset = self.regions.append(&buf)?;
        self.files[(file_id - 1) as usize].stream_table = offset;
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.close_active_stream()?;

        let directory_ids: Vec<u32> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_directory)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        for id in directory_ids {
            self.write_directory_link_table(id)?;
        }
        let file_ids: Vec<u32> = (1..=self.files.len() as u32).collect();
        for id in file_ids {
            self.write_stream_table(id)?;
        }

        let mut directory_offsets = Vec::new();
        for chunk in self.files.chunks(FILES_PER_TABLE as usize) {
            let mut buf = Vec::with_capacity(chunk.len() * FileRecord::ENCODED_SIZE);
            for f in chunk {
                let record = FileRecord {
                    attributes: f.attributes,
                    creation_time: f.creation_time,
                    last_write_time: f.last_write_time,
                    change_time: f.change_time,
                    last_access_time: f.last_access_time,
                    reparse_tag: f.reparse_tag,
                    security_descriptor: self.regions.append(&f.security_descriptor)?,
                    security_descriptor_len: f.security_descriptor.len() as u32,
                    extended_attributes: self.regions.append(&f.extended_attributes)?,
                    extended_attributes_len: f.extended_attributes.len() as u32,
                    reparse_buffer: self.regions.append(&f.reparse_buffer)?,
                    reparse_buffer_len: f.reparse_buffer.len() as u32,
                    stream_table: f.stream_table,
                    default_stream: f.default_stream,
                };
                record.write(&mut buf).map_err(Error::Io)?;
            }
            let offset = self.regions.append(&buf)?;
            directory_offsets.push(FileTableDirectoryEntry {
                offset,
                entry_size: FileRecord::ENCODED_SIZE as u32,
                entry_count: chunk.len() as u32,
            });
        }

        let mut directory_bytes = Vec::new();
        for entry in &directory_offsets {
            entry.write(&mut directory_bytes).map_err(Error::Io)?;
        }
        let file_table_directory_offset = self.regions.append(&directory_bytes)?;

        let mut upcase_bytes = Vec::new();
        self.upcase.write(&mut upcase_bytes).map_err(Error::Io)?;
        let upcase_table_offset = self.regions.append(&upcase_bytes)?;

        let fs_record = FilesystemRecord {
            root_file_id: 1,
            file_table_directory_offset,
            file_table_directory_len: directory_bytes.len() as u64,
            upcase_table_offset,
            file_table_count: directory_offsets.len() as u32,
        };
        let mut fs_record_bytes = Vec::new();
        fs_record.write(&mut fs_record_bytes).map_err(Error::Io)?;
        let filesystem_offset = self.regions.append(&fs_record_bytes)?;

        self.regions.flush()?;
        let region_set = self.regions.region_set();
        let header = FilesystemHeader::new(region_set, filesystem_offset, self.parent_region_sets.clone());

        let primary_path = self.layer_dir.join(&self.new_name);
        let mut primary = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&primary_path)
            .map_err(Error::Io)?;
        header.write(&mut primary).map_err(Error::Io)?;
        log::info!(target: "cimfs::writer", "committed {}", primary_path.display());
        Ok(())
    }

    /// `Commit` (spec.md §4.4): serializes everything but leaves the
    /// writer usable for a subsequent `Close` (a plain `commit()` without
    /// consuming `self` mirrors the original's separate `Commit`/`Close`
    /// calls, the latter being idempotent once committed).
    pub fn commit(&mut self) -> Result<()> {
        if matches!(self.state, WriterState::Closed) {
            return Ok(());
        }
        self.commit_inner()?;
        self.state = WriterState::Closed;
        Ok(())
    }

    /// `Close` (spec.md §4.4 / §5): attempts `commit` exactly once;
    /// region file handles are dropped either way when `self` goes out of
    /// scope, matching the scoped-acquisition resource policy.
    pub fn close(mut self) -> Result<()> {
        if matches!(self.state, WriterState::Closed) {
            return Ok(());
        }
        self.commit()
    }
}
