//! C7: layer finalizer (spec.md §4.7). Runs after a composer import
//! commits: base layers get a `Hives` directory of in-CIM hard links and
//! a `layout` marker; non-base layers get their delta hives merged
//! against the parent's base hives through an external black-box facility
//! and the merged result added back into the CIM.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::format::file_record::BasicInfo;
use crate::format::Attributes;
use crate::host_layout::{
    config_hive_path, hive_base_path, hive_delta_scratch_path, HIVE_NAMES, HIVES_DIR, LAYOUT_FILE_NAME,
    LAYOUT_MARKER_CONTENTS,
};
use crate::reader::Reader;
use crate::writer::Writer;

/// The external hive-merge facility (spec.md §4.6/§4.7): a black box
/// given a base hive path and a delta hive path that produces a merged
/// hive at `out_path`. Implementations surface their own failures as
/// `Error::MergeOpen`/`Error::MergeSave`; this crate never guesses at
/// what "open" or "save" means inside the facility.
pub trait HiveMerge {
    fn merge(&self, base_hive: &Path, delta_hive: &Path, out_path: &Path) -> Result<()>;
}

fn directory_info() -> BasicInfo {
    BasicInfo { attributes: Attributes::DIRECTORY, ..Default::default() }
}

/// Base-layer finalization (spec.md §4.7, S2): an empty `Hives`
/// directory, an in-CIM hard link per hive name from the config path the
/// tar stream wrote to `Hives\<NAME>_BASE`, and the `layout` marker.
pub fn finalize_base_layer(writer: &mut Writer, cancel: &CancelToken) -> Result<()> {
    writer.add_file(HIVES_DIR, directory_info(), 0, Vec::new(), Vec::new(), Vec::new())?;

    for name in HIVE_NAMES {
        cancel.check()?;
        let source = config_hive_path(name);
        let target = hive_base_path(name);
        log::debug!(target: "cimfs::finalize", "linking {source} -> {target}");
        writer.add_link(&source, &target)?;
    }

    writer.add_file(
        LAYOUT_FILE_NAME,
        BasicInfo::default(),
        LAYOUT_MARKER_CONTENTS.len() as u64,
        Vec::new(),
        Vec::new(),
        Vec::new(),
    )?;
    writer.write(LAYOUT_MARKER_CONTENTS.as_bytes())?;
    log::info!(target: "cimfs::finalize", "wrote layout marker");
    Ok(())
}

/// Non-base-layer finalization (spec.md §4.7). For each hive with a
/// delta file in the scratch directory: reads the parent's base hive out
/// of its committed CIM into a temp file (the merge facility operates on
/// host paths, not CIM handles), invokes `merge`, then adds the merged
/// result into the CIM at `Hives\<NAME>_BASE`. Hives with no delta are
/// left untouched.
pub fn finalize_non_base_layer(
    writer: &mut Writer,
    layer_dir: &Path,
    parent_cim_path: &Path,
    merger: &dyn HiveMerge,
    cancel: &CancelToken,
) -> Result<()> {
    let parent = Reader::open(parent_cim_path)?;

    for name in HIVE_NAMES {
        cancel.check()?;
        let delta_path = hive_delta_scratch_path(layer_dir, name);
        if !delta_path.exists() {
            continue;
        }

        let base_tmp_path = layer_dir.join(format!("{name}_base.tmp"));
        export_parent_hive(&parent, name, &base_tmp_path)?;

        let merged_path = layer_dir.join(format!("{name}_merged.tmp"));
        let merge_result = merger.merge(&base_tmp_path, &delta_path, &merged_path);
        let _ = fs::remove_file(&base_tmp_path);
        merge_result?;

        let bytes = fs::read(&merged_path).map_err(crate::error::Error::Io)?;
        log::info!(target: "cimfs::finalize", "merged {name} hive ({} bytes)", bytes.len());
        writer.add_file(
            &hive_base_path(name),
            BasicInfo::default(),
            bytes.len() as u64,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )?;
        writer.write(&bytes)?;
        let _ = fs::remove_file(&merged_path);
    }
    Ok(())
}

fn export_parent_hive(parent: &Reader, name: &str, out_path: &Path) -> Result<()> {
    let mut handle = parent.open_at(None, &hive_base_path(name))?;
    let info = parent.stat(&handle)?;
    let mut out = fs::File::create(out_path).map_err(crate::error::Error::Io)?;
    let mut buf = vec![0u8; (info.size.min(1 << 20)).max(1) as usize];
    loop {
        let n = parent.read(&mut handle, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(crate::error::Error::Io)?;
    }
    Ok(())
}
