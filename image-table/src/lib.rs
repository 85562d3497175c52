//! A persistent, memory-mapped image cache for a single pixel format (spec §1).
//!
//! An [`ImageTable`] holds pre-rendered pixel buffers for entities identified by an opaque
//! [`Uuid`][uuid::Uuid], keyed further by a source-image id so a caller can invalidate a cached
//! entry when the thing it was rendered from changes. Retrieval aliases the memory-mapped file
//! directly (no decode, scale, or copy on the hot path): the [`Entry`] backing a returned image
//! keeps the chunk mapping alive for as long as the image is held.
//!
//! Callers supply three collaborators (spec §2, §6):
//! - [`format::ImageFormat`] — the pixel geometry this table stores.
//! - [`host::TableHost`] — hardware row alignment and screen scale.
//! - [`host::ImageSink`] — the platform image constructor that wraps an [`Entry`]'s pixel bytes.
//!
//! The orchestrator is [`table::ImageTable`]; its `set`/`get`/`entry_exists`/`delete`/`reset`
//! operations are the only entry points a caller needs (spec §6 "Consumer interface").

extern crate thiserror as te;

pub mod alloc;
pub mod cache;
pub mod chunk;
pub mod entry;
pub mod error;
pub mod format;
pub mod host;
pub mod index;
pub mod layout;
pub mod metadata;
pub mod table;
pub mod util;

pub use chunk::Chunk;
pub use entry::Entry;
pub use error::{ChunkMapError, GrowError, MetadataError, OpenError, SetError};
pub use format::{BitmapInfo, ColorModel, Fingerprint, ImageFormat};
pub use host::{ImageSink, TableHost};
pub use layout::TableLayout;
pub use table::{ImageTable, Stats};
