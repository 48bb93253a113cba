//! Cross-layer hard-link pull-up (spec.md §4.6). Only needed by merged-
//! CIM composer variants whose `Writer` does not already hold the whole
//! parent tree in memory; the per-layer fork path (`writer::Writer`'s
//! eager clone at `Create`) already makes every ancestor-visible path
//! resolvable locally, so this only fires when a link target is genuinely
//! absent from the image being written.

use std::path::Path;

use crate::error::{Error, Result};
use crate::format::file_record::BasicInfo;
use crate::format::Attributes;
use crate::reader::Reader;
use crate::writer::Writer;

/// Walks `parent_layer_dirs` top-to-bottom (nearest parent first) looking
/// for `target`; on the first hit, synthesizes `add_file` calls for every
/// missing ancestor directory plus the target file itself, streaming its
/// content from the parent reader into `writer`, then performs
/// `writer.add_link(target, new_path)`. Fails with `LinkTargetMissing` if
/// no parent has it.
pub fn pull_up_link(writer: &mut Writer, parent_cim_paths: &[impl AsRef<Path>], target: &str, new_path: &str) -> Result<()> {
    for parent_cim in parent_cim_paths {
        let parent = match Reader::open(parent_cim.as_ref()) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let Ok(handle) = parent.open_at(None, target) else {
            continue;
        };
        let info = parent.stat(&handle)?;

        ensure_ancestor_dirs(writer, target)?;

        if info.is_dir() {
            writer.add_file(
                target,
                BasicInfo {
                    attributes: Attributes::DIRECTORY,
                    creation_time: info.creation_time,
                    last_write_time: info.last_write_time,
                    change_time: info.change_time,
                    last_access_time: info.last_access_time,
                },
                0,
                info.security_descriptor,
                info.extended_attributes,
                info.reparse_buffer,
            )?;
        } else {
            writer.add_file(
                target,
                BasicInfo {
                    attributes: info.attributes,
                    creation_time: info.creation_time,
                    last_write_time: info.last_write_time,
                    change_time: info.change_time,
                    last_access_time: info.last_access_time,
                },
                info.size,
                info.security_descriptor,
                info.extended_attributes,
                info.reparse_buffer,
            )?;
            let mut handle = handle;
            let mut buf = vec![0u8; (info.size.min(1 << 20)).max(1) as usize];
            loop {
                let n = parent.read(&mut handle, &mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n])?;
            }
        }

        writer.add_link(target, new_path)?;
        return Ok(());
    }

    Err(Error::LinkTargetMissing { target: target.into() })
}

/// Creates any ancestor directory of `path` that does not exist yet in
/// `writer`, with default timestamps (spec.md §4.6 "synthesize `Add`
/// calls for each missing ancestor directory").
fn ensure_ancestor_dirs(writer: &mut Writer, path: &str) -> Result<()> {
    let mut built = String::new();
    let mut components: Vec<&str> = path.split('/').collect();
    components.pop();
    for component in components {
        built = if built.is_empty() { component.to_string() } else { format!("{built}/{component}") };
        if writer.contains_path(&built) {
            continue;
        }
        writer.add_file(
            &built,
            BasicInfo {
                attributes: Attributes::DIRECTORY,
                ..Default::default()
            },
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )?;
    }
    Ok(())
}
