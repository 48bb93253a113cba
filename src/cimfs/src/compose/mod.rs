//! C6: layer writer / composer (spec.md §4.6). Translates a Windows-layer
//! backup-format tar stream into CIMFS operations, routing delta hives
//! and the BCD file to a scratch directory beside the CIM instead of
//! into it, and handling cross-layer hard-link pull-up for composer
//! variants that need it.

pub mod pullup;
pub mod tar_import;

pub use pullup::pull_up_link;
pub use tar_import::{import_layer, ImportSummary};

use crate::error::{Error, Result};
use crate::writer::Writer;

/// Keeps a merged-CIM variant's parent writers open for the duration of
/// an import so `Unlink` can be propagated to every ancestor, not just
/// the child being written (spec.md §4.6 "Removal semantics";
/// SPEC_FULL.md §10.5).
pub struct MergedTargets {
    parents: Vec<Writer>,
}

impl MergedTargets {
    pub fn new(parents: Vec<Writer>) -> MergedTargets {
        MergedTargets { parents }
    }

    /// Invokes `Unlink` on every held parent writer, tolerating parents
    /// that never had `path` to begin with.
    pub fn unlink_everywhere(&mut self, path: &str) -> Result<()> {
        for parent in &mut self.parents {
            match parent.unlink(path) {
                Ok(()) => {}
                Err(Error::PathError { inner, .. }) if matches!(*inner, Error::FileNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn close_all(self) -> Result<()> {
        for parent in self.parents {
            parent.close()?;
        }
        Ok(())
    }
}
