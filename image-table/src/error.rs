use std::path::PathBuf;

/// Failure to construct an [`ImageTable`][crate::table::ImageTable]: the backing file could not
/// be opened. This is the only error kind that prevents a table from existing at all.
#[derive(te::Error, Debug)]
pub enum OpenError {
    /// The backing `.imageTable` data file could not be created or opened.
    #[error("could not open image table data file {path:?}: {source}")]
    DataFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to grow the backing file to accommodate a new entry index.
///
/// Per spec §7 this is non-fatal: the in-memory `entry_count` is left unchanged and the
/// triggering `set` is abandoned silently (after being logged).
#[derive(te::Error, Debug)]
#[error("could not resize image table file {path:?} to {requested_len} bytes: {source}")]
pub struct GrowError {
    pub path: PathBuf,
    pub requested_len: u64,
    #[source]
    pub source: std::io::Error,
}

/// Failure to complete a `set` call end to end.
#[derive(te::Error, Debug)]
pub enum SetError {
    #[error(transparent)]
    Grow(#[from] GrowError),
    #[error(transparent)]
    ChunkMap(#[from] ChunkMapError),
    /// The table is at its effective maximum entry count and every occupied entry is currently
    /// in use (spec §4.4: eviction has no candidate victim).
    #[error("image table is saturated: every occupied entry is currently in use")]
    Saturated,
}

/// Failure while loading or saving the `.metadata` side-file. Never fatal: the table keeps
/// running on whatever in-memory state it has (empty, if this happened during load).
#[derive(te::Error, Debug)]
pub enum MetadataError {
    #[error("could not read metadata file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode metadata file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("could not write metadata file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode metadata: {source}")]
    Encode {
        #[source]
        source: bincode::Error,
    },
}

/// Errors surfaced by the chunk cache when a requested chunk cannot be mapped.
#[derive(te::Error, Debug)]
pub enum ChunkMapError {
    #[error("entry index {0} is beyond the end of the table")]
    IndexOutOfBounds(u32),
    #[error("could not map chunk {chunk_index}: {source}")]
    Map {
        chunk_index: u32,
        #[source]
        source: std::io::Error,
    },
}
