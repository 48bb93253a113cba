use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias; every fallible public operation returns this.
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy from spec.md §4.5, grouped as *format*, *bounds*, *state*,
/// *semantic* and *I/O* errors. `PathError`/`StreamError`/`LinkError`/
/// `OpError` carry the context envelope (cim path, op, file path, stream
/// name) spec.md §4.5 and §7 require on every surfaced error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{cim}: not a cim file")]
    NotACim { cim: PathBuf },

    #[error("{cim}: unsupported format version {found_major}.{found_minor} (need >= {min_major}.{min_minor})")]
    UnsupportedVersion {
        cim: PathBuf,
        found_major: u16,
        found_minor: u16,
        min_major: u16,
        min_minor: u16,
    },

    #[error("{cim}: invalid region count {count}")]
    InvalidRegionCount { cim: PathBuf, count: u32 },

    #[error("{cim}: region offset out of bounds (region {region_index}, offset {byte_offset}, region size {region_size})")]
    InvalidRegionOffset {
        cim: PathBuf,
        region_index: u16,
        byte_offset: u64,
        region_size: u64,
    },

    #[error("{cim}: truncated read at offset {offset} (wanted {wanted} bytes, region has {available})")]
    TruncatedRead {
        cim: PathBuf,
        offset: u64,
        wanted: u64,
        available: u64,
    },

    #[error("{cim}: unsupported stream type {code}")]
    UnsupportedStreamType { cim: PathBuf, code: u8 },

    #[error("{cim}: {op} on {path}")]
    PathError {
        cim: PathBuf,
        op: &'static str,
        path: PathBuf,
        #[source]
        inner: Box<Error>,
    },

    #[error("{cim}: {op} on {path} stream {stream}")]
    StreamError {
        cim: PathBuf,
        op: &'static str,
        path: PathBuf,
        stream: String,
        #[source]
        inner: Box<Error>,
    },

    #[error("{cim}: {op} link {old} -> {new}")]
    LinkError {
        cim: PathBuf,
        op: &'static str,
        old: PathBuf,
        new: PathBuf,
        #[source]
        inner: Box<Error>,
    },

    #[error("{cim}: {op}")]
    OpError {
        cim: PathBuf,
        op: &'static str,
        #[source]
        inner: Box<Error>,
    },

    #[error("no active stream")]
    InvalidState,

    #[error("write of {attempted} bytes overruns remaining {remaining}")]
    Overrun { attempted: u64, remaining: u64 },

    #[error("stream closed with {remaining} bytes undelivered")]
    WriteTruncated { remaining: u64 },

    #[error("hard link target {target} not found in this image or any parent")]
    LinkTargetMissing { target: PathBuf },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{path}: not found")]
    FileNotFound { path: PathBuf },

    #[error("{path}: not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path}: is a directory")]
    IsADirectory { path: PathBuf },

    #[error("tar stream malformed: {0}")]
    InvalidTarStream(String),

    #[error("layer directory layout not recognized: {0}")]
    UnrecognizedLayout(String),

    #[error("hive merge failed to open {0}")]
    MergeOpen(PathBuf),

    #[error("hive merge failed to save {0}")]
    MergeSave(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn path_ctx(
        cim: impl Into<PathBuf>,
        op: &'static str,
        path: impl Into<PathBuf>,
        inner: Error,
    ) -> Error {
        Error::PathError {
            cim: cim.into(),
            op,
            path: path.into(),
            inner: Box::new(inner),
        }
    }

    pub fn stream_ctx(
        cim: impl Into<PathBuf>,
        op: &'static str,
        path: impl Into<PathBuf>,
        stream: impl Into<String>,
        inner: Error,
    ) -> Error {
        Error::StreamError {
            cim: cim.into(),
            op,
            path: path.into(),
            stream: stream.into(),
            inner: Box::new(inner),
        }
    }

    pub fn link_ctx(
        cim: impl Into<PathBuf>,
        op: &'static str,
        old: impl Into<PathBuf>,
        new: impl Into<PathBuf>,
        inner: Error,
    ) -> Error {
        Error::LinkError {
            cim: cim.into(),
            op,
            old: old.into(),
            new: new.into(),
            inner: Box::new(inner),
        }
    }

    pub fn op_ctx(cim: impl Into<PathBuf>, op: &'static str, inner: Error) -> Error {
        Error::OpError {
            cim: cim.into(),
            op,
            inner: Box::new(inner),
        }
    }
}
