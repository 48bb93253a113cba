//! Host-side directory layout conventions (spec.md §6 "Host-side
//! layout") and `DestroyCim`. Nothing here touches the image format
//! itself; it only names files on disk the way the rest of the crate
//! expects to find them.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::format::FilesystemHeader;
use crate::region::{object_id_file_name, region_file_name};

/// The five base config-hive names, as written under
/// `Files\Windows\System32\config\` and exposed at `Hives\<NAME>_BASE`
/// (spec.md §4.6, §4.7, S2).
pub const HIVE_NAMES: [&str; 5] = ["SOFTWARE", "SYSTEM", "SAM", "SECURITY", "DEFAULT"];

/// The delta-hive basename for each of `HIVE_NAMES`, in the same order
/// (spec.md §4.6 `is_side_file`). `DEFAULT`'s delta is named
/// `DEFAULTUSER_DELTA`, not `DEFAULT_DELTA` — the one name in this list
/// that doesn't match its base name.
fn delta_name(name: &str) -> &str {
    if name == "DEFAULT" {
        "DEFAULTUSER"
    } else {
        name
    }
}

/// Path (inside the tar stream / CIM) to the boot configuration data
/// file, the other side-file besides the delta hives (spec.md §4.6).
pub const BCD_PATH: &str = "UtilityVM\\Files\\EFI\\Microsoft\\Boot\\BCD";

/// Exact and only accepted contents of the `layout` marker file written
/// by base-layer finalization (spec.md §4.7, S2).
pub const LAYOUT_MARKER_CONTENTS: &str = "vhd-with-hives\n";

/// Name of the marker file itself, written to the CIM root.
pub const LAYOUT_FILE_NAME: &str = "layout";

/// In-CIM directory base-layer finalization hard-links the five hive
/// files into (spec.md §4.7): `Hives\<NAME>_BASE`.
pub const HIVES_DIR: &str = "Hives";

pub fn hive_base_path(name: &str) -> String {
    format!("{HIVES_DIR}\\{name}_BASE")
}

pub fn hive_delta_scratch_path(layer_dir: &Path, name: &str) -> PathBuf {
    layer_dir.join(HIVES_DIR).join(format!("{}_DELTA", delta_name(name)))
}

pub fn config_hive_path(name: &str) -> String {
    format!("Files\\Windows\\System32\\config\\{name}")
}

/// Returns the path a tar entry should be routed to the scratch
/// directory for, per `is_side_file` (spec.md §4.6): the five delta hive
/// basenames, or an exact match on `BCD_PATH`. Separator-agnostic: tar
/// entries from a Windows backup-format stream carry `\`-separated
/// names, but callers may also pass `/`-separated paths.
pub fn is_side_file(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    if normalized == BCD_PATH.replace('\\', "/") {
        return true;
    }
    let basename = normalized.rsplit('/').next().unwrap_or(&normalized);
    HIVE_NAMES
        .iter()
        .any(|name| basename.eq_ignore_ascii_case(&format!("{}_DELTA", delta_name(name))))
}

/// `DestroyCim(cim_path)` (spec.md §6 "Driver/mounter interface"):
/// removes the primary file, every region file, and every object-id
/// file belonging to *this* image's own region set — deliberately not a
/// parent's, matching the original's scope (SPEC_FULL.md "Supplemented
/// from the original implementation").
pub fn destroy_cim(cim_path: impl AsRef<Path>) -> Result<()> {
    let cim_path = cim_path.as_ref();
    let layer_dir = cim_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut file = fs::File::open(cim_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotACim { cim: cim_path.to_path_buf() }
        } else {
            Error::Io(e)
        }
    })?;
    let header = FilesystemHeader::read(&mut file).map_err(Error::Io)?;
    drop(file);

    for index in 1..=header.region_set.region_count {
        let region_path = layer_dir.join(region_file_name(header.region_set.id, index));
        remove_if_exists(&region_path)?;
        let object_id_path = layer_dir.join(object_id_file_name(header.region_set.id, index));
        remove_if_exists(&object_id_path)?;
    }

    remove_if_exists(cim_path)?;
    log::info!(target: "cimfs::host_layout", "destroyed {}", cim_path.display());
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_delta_hives_and_bcd() {
        assert!(is_side_file("Files\\Windows\\System32\\config\\SOFTWARE_DELTA"));
        assert!(is_side_file(BCD_PATH));
        assert!(!is_side_file("Files\\Windows\\System32\\config\\SOFTWARE"));
    }

    #[test]
    fn default_hive_delta_is_defaultuser_not_default() {
        assert!(is_side_file("Files\\Windows\\System32\\config\\DEFAULTUSER_DELTA"));
        assert!(!is_side_file("Files\\Windows\\System32\\config\\DEFAULT_DELTA"));
    }

    #[test]
    fn hive_paths_match_spec() {
        assert_eq!(hive_base_path("SYSTEM"), "Hives\\SYSTEM_BASE");
        assert_eq!(config_hive_path("SAM"), "Files\\Windows\\System32\\config\\SAM");
        assert_eq!(
            hive_delta_scratch_path(Path::new("/layer"), "DEFAULT"),
            Path::new("/layer/Hives/DEFAULTUSER_DELTA")
        );
        assert_eq!(
            hive_delta_scratch_path(Path::new("/layer"), "SYSTEM"),
            Path::new("/layer/Hives/SYSTEM_DELTA")
        );
    }
}
