//! Tar consumption algorithm (spec.md §4.6): translates a Windows-layer
//! backup-format tar stream into `Writer` calls, demuxing delta hives
//! and the BCD file to the scratch directory instead of the CIM.

use std::fs::{self, File};
use std::io::{Read, Write as _};
use std::path::Path;

use tar::{Archive, Entry, EntryType};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::format::file_record::{Attributes, BasicInfo, FileTime};
use crate::host_layout::is_side_file;
use crate::writer::{Writer, WriterOptions};

const WHITEOUT_PREFIX: &str = ".wh.";
const ADS_SUFFIX: &str = ":$DATA";

/// PAX extended-header keys this crate reads Windows-specific metadata
/// from (security descriptor, extended attributes, reparse buffer,
/// attribute bits). A backup-format tar stream that lacks these simply
/// yields empty SD/EA/reparse and bare attribute bits from the tar mode.
const PAX_SECURITY_DESCRIPTOR: &str = "MSWINDOWS.rawsd";
const PAX_EXTENDED_ATTRIBUTES: &str = "MSWINDOWS.xattr";
const PAX_REPARSE_BUFFER: &str = "MSWINDOWS.reparse";
const PAX_FILE_ATTRIBUTES: &str = "MSWINDOWS.fileattr";

const WINDOWS_EPOCH_OFFSET_SECONDS: u64 = 11_644_473_600;

fn unix_to_filetime(seconds: u64) -> FileTime {
    FileTime((seconds + WINDOWS_EPOCH_OFFSET_SECONDS) * 10_000_000)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportSummary {
    pub files_added: u64,
    pub links_added: u64,
    pub removed: u64,
    pub side_files_written: u64,
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn strip_whiteout(path: &str) -> Option<String> {
    let pos = path.rfind('/');
    let (dir, base) = match pos {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    };
    let stripped = base.strip_prefix(WHITEOUT_PREFIX)?;
    Some(if dir.is_empty() {
        stripped.to_string()
    } else {
        format!("{dir}/{stripped}")
    })
}

struct BackupInfo {
    basic_info: BasicInfo,
    security_descriptor: Vec<u8>,
    extended_attributes: Vec<u8>,
    reparse_buffer: Vec<u8>,
}

fn pax_value_bytes<'a, R: Read>(entry: &'a Entry<'_, R>, key: &str) -> Result<Option<Vec<u8>>> {
    let Some(extensions) = entry.pax_extensions().map_err(Error::Io)? else {
        return Ok(None);
    };
    for ext in extensions {
        let ext = ext.map_err(Error::Io)?;
        if ext.key().unwrap_or("") == key {
            return Ok(Some(ext.value_bytes().to_vec()));
        }
    }
    Ok(None)
}

fn read_backup_info<R: Read>(entry: &Entry<'_, R>) -> Result<BackupInfo> {
    let header = entry.header();
    let mut attributes = Attributes::empty();
    if entry.header().entry_type() == EntryType::Directory {
        attributes |= Attributes::DIRECTORY;
    }
    if let Some(raw) = pax_value_bytes(entry, PAX_FILE_ATTRIBUTES)? {
        if let Ok(text) = std::str::from_utf8(&raw) {
            if let Ok(bits) = text.trim().parse::<u32>() {
                attributes |= Attributes::from_bits_truncate(bits);
            }
        }
    }

    let mtime = header.mtime().unwrap_or(0);
    let file_time = unix_to_filetime(mtime);

    let mut reparse_buffer = pax_value_bytes(entry, PAX_REPARSE_BUFFER)?.unwrap_or_default();
    if attributes.contains(Attributes::REPARSE_POINT) && reparse_buffer.is_empty() {
        // spec.md §4.6: some producers set REPARSE_POINT spuriously with
        // no buffer behind it; treat that as not-a-reparse-point.
        attributes.remove(Attributes::REPARSE_POINT);
    }
    if !reparse_buffer.is_empty() {
        attributes |= Attributes::REPARSE_POINT;
    } else {
        reparse_buffer.clear();
    }

    Ok(BackupInfo {
        basic_info: BasicInfo {
            attributes,
            creation_time: file_time,
            last_write_time: file_time,
            change_time: file_time,
            last_access_time: file_time,
        },
        security_descriptor: pax_value_bytes(entry, PAX_SECURITY_DESCRIPTOR)?.unwrap_or_default(),
        extended_attributes: pax_value_bytes(entry, PAX_EXTENDED_ATTRIBUTES)?.unwrap_or_default(),
        reparse_buffer,
    })
}

fn entry_path_string<R: Read>(entry: &Entry<'_, R>) -> Result<String> {
    let path = entry.path().map_err(Error::Io)?;
    Ok(normalize(&path.to_string_lossy()))
}

fn copy_payload<R: Read>(entry: &mut Entry<'_, R>, writer: &mut Writer, size: u64) -> Result<()> {
    let mut buf = vec![0u8; (size.min(1 << 20)).max(1) as usize];
    let mut remaining = size;
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = entry.read(&mut buf[..want]).map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

fn write_side_file<R: Read>(dest_layer_dir: &Path, path: &str, entry: &mut Entry<'_, R>) -> Result<()> {
    let dest = dest_layer_dir.join(path.replace('/', std::path::MAIN_SEPARATOR_STR));
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let mut out = File::create(&dest).map_err(Error::Io)?;
    std::io::copy(entry, &mut out).map_err(Error::Io)?;
    out.flush().map_err(Error::Io)?;
    log::debug!(target: "cimfs::compose", "side file {} -> {}", path, dest.display());
    Ok(())
}

/// Consumes `tar_reader` into a freshly created `Writer` (spec.md §4.6).
/// `parent_name` forks the destination image the way `Writer::create`
/// does; pass `None` for a base layer. Returns the writer still open (not
/// yet committed) so the caller can run finalization (C7) before
/// `close()`.
pub fn import_layer<R: Read>(
    dest_layer_dir: &Path,
    new_name: &str,
    parent_name: Option<&str>,
    tar_reader: R,
    writer_options: WriterOptions,
    cancel: &CancelToken,
) -> Result<(Writer, ImportSummary)> {
    let mut writer = Writer::create(dest_layer_dir, parent_name, new_name, writer_options)?;
    let mut summary = ImportSummary::default();

    let mut archive = Archive::new(tar_reader);
    let mut entries = archive.entries().map_err(Error::Io)?.peekable();

    while let Some(entry) = entries.next() {
        cancel.check()?;
        let mut entry = entry.map_err(Error::Io)?;
        let path = entry_path_string(&entry)?;
        let entry_type = entry.header().entry_type();

        if let Some(target) = strip_whiteout(&path) {
            log::debug!(target: "cimfs::compose", "whiteout {target}");
            writer.unlink(&target)?;
            summary.removed += 1;
            continue;
        }

        if entry_type == EntryType::Link {
            let link_name = entry
                .link_name()
                .map_err(Error::Io)?
                .ok_or_else(|| Error::InvalidTarStream(format!("{path}: hard link entry missing linkname")))?;
            let old_path = normalize(&link_name.to_string_lossy());
            log::debug!(target: "cimfs::compose", "hard link {path} -> {old_path}");
            writer.add_link(&old_path, &path)?;
            summary.links_added += 1;
            continue;
        }

        let size = entry.header().size().map_err(Error::Io)?;

        if is_side_file(&path) {
            write_side_file(dest_layer_dir, &path, &mut entry)?;
            summary.side_files_written += 1;
            continue;
        }

        let info = read_backup_info(&entry)?;
        log::debug!(target: "cimfs::compose", "add {path} ({size} bytes)");
        writer.add_file(
            &path,
            info.basic_info,
            size,
            info.security_descriptor,
            info.extended_attributes,
            info.reparse_buffer,
        )?;
        summary.files_added += 1;
        copy_payload(&mut entry, &mut writer, size)?;

        loop {
            let Some(Ok(next)) = entries.peek() else { break };
            let next_path = entry_path_string(next)?;
            if next.header().entry_type() != EntryType::Regular {
                break;
            }
            let Some(rest) = next_path.strip_prefix(&format!("{path}:")) else { break };
            let Some(stream_name) = rest.strip_suffix(ADS_SUFFIX) else { break };
            let stream_name = stream_name.to_string();

            let mut stream_entry = entries.next().unwrap().map_err(Error::Io)?;
            let stream_size = stream_entry.header().size().map_err(Error::Io)?;
            log::debug!(target: "cimfs::compose", "alternate stream {path}:{stream_name} ({stream_size} bytes)");
            writer.create_alternate_stream(&format!("{path}:{stream_name}"), stream_size)?;
            copy_payload(&mut stream_entry, &mut writer, stream_size)?;
        }
    }

    Ok((writer, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_whiteout_prefix() {
        assert_eq!(strip_whiteout("a/b/.wh.c.txt").as_deref(), Some("a/b/c.txt"));
        assert_eq!(strip_whiteout(".wh.root.txt").as_deref(), Some("root.txt"));
        assert_eq!(strip_whiteout("a/b/c.txt"), None);
    }

    #[test]
    fn normalizes_backslashes() {
        assert_eq!(normalize("Files\\Windows\\System32"), "Files/Windows/System32");
    }
}
