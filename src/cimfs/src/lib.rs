//! CIMFS: a read-optimized, content-addressed, append-only image format
//! for Windows container layers, plus the writer/reader pair and layer
//! import/finalize pipeline built on top of it.

pub mod cancel;
pub mod compose;
pub mod error;
pub mod finalize;
pub mod format;
pub mod host_layout;
pub mod reader;
pub mod region;
pub mod writer;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use reader::{CimFile, CimStream, FileInfo, Reader, ReaderOptions};
pub use writer::{Writer, WriterOptions};

#[cfg(test)]
mod testutil;
