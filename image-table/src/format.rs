//! The Format Descriptor: an external collaborator (spec §2.1). Modeled as a trait rather than a
//! concrete struct — the same choice the teacher crate makes for its `Voxel`/`Registry`
//! abstractions (`data/voxel.rs`, `data/registry.rs`) — so callers can plug in whatever type
//! already describes their pixel format instead of being forced through one.

use std::hash::Hash;

/// The color model of an [`ImageFormat`]'s pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorModel {
    Grayscale,
    Rgb,
}

/// Bitmap layout flags carried through to the platform image constructor untouched. The table
/// itself never interprets these; they exist purely to be handed back to the host's image
/// builder (spec §6: "bitmap-info flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BitmapInfo(pub u32);

/// An opaque, caller-supplied description of one pixel format that a single [`ImageTable`][crate::table::ImageTable]
/// stores. Two descriptors are considered compatible (no reconciliation needed on open) iff
/// their [`fingerprint`][ImageFormat::fingerprint] values are equal.
pub trait ImageFormat {
    /// Pixel width, in pixels.
    fn pixel_width(&self) -> u32;
    /// Pixel height, in pixels.
    fn pixel_height(&self) -> u32;
    /// Bytes used to store one pixel (e.g. 4 for 8-bit RGBA).
    fn bytes_per_pixel(&self) -> u32;
    /// Bits per color component (e.g. 8 for 8-bit-per-channel RGBA).
    fn bits_per_component(&self) -> u32;
    /// Whether this format stores grayscale or RGB(A) pixels.
    fn color_model(&self) -> ColorModel;
    /// Platform bitmap layout flags, passed through untouched to the host image constructor.
    fn bitmap_info(&self) -> BitmapInfo;
    /// A stable, filename-safe name. Used to derive `<name>.imageTable` / `<name>.metadata`.
    fn name(&self) -> &str;
    /// The caller-configured maximum entry count. May be raised internally (spec §4.1: "the
    /// effective maximum is then raised to `entries_per_chunk`").
    fn maximum_count(&self) -> u32;
    /// A value that's equal between two descriptors iff they are interchangeable for the
    /// purposes of this table (i.e. describe the same on-disk layout). Used to detect stale
    /// metadata at open (spec §4.5 "Load").
    fn fingerprint(&self) -> Fingerprint;
}

/// A deterministic, serializable fingerprint of an [`ImageFormat`]. Two formats are compatible
/// iff their fingerprints compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Build a fingerprint from a format's defining fields, folding them with a stable hasher.
    /// Exposed as a free function rather than forced on [`ImageFormat`] implementors, since the
    /// inputs it needs are already exposed as trait methods.
    ///
    /// Deliberately excludes `maximum_count`: that field is eviction *policy*, not on-disk
    /// layout, so changing it alone shouldn't invalidate an otherwise-compatible table.
    pub fn compute(format: &dyn ImageFormat) -> Self {
        use std::hash::Hasher;
        let mut hasher = rustc_hash::FxHasher::default();
        format.pixel_width().hash(&mut hasher);
        format.pixel_height().hash(&mut hasher);
        format.bytes_per_pixel().hash(&mut hasher);
        format.bits_per_component().hash(&mut hasher);
        format.color_model().hash(&mut hasher);
        format.bitmap_info().hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}
