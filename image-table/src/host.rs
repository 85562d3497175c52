//! Host collaborators (spec §2, "external"): the hardware row alignment, the screen scale
//! factor, and the platform image wrapper constructor. Kept as trait boundaries so the storage
//! core never names a concrete platform image type, the same separation the teacher crate keeps
//! between `topo::world` (storage) and `render::core` (presentation).

use std::sync::Arc;

use crate::entry::Entry;

/// Host services the table needs but does not implement itself.
pub trait TableHost {
    /// The byte alignment pixel rows must respect (spec: "hardware row alignment constant,
    /// typically 64").
    fn row_alignment(&self) -> u64;
    /// The device/screen scale factor. Opaque to the table; forwarded to [`ImageSink`] so the
    /// platform image can size itself correctly.
    fn screen_scale(&self) -> f32;
}

/// Constructs the platform-specific image wrapper that aliases an [`Entry`]'s mapped pixel
/// bytes without copying them (spec §4.1 "get", Design Note "Image aliasing across FFI/ownership
/// boundary"). Implementors must keep `entry` alive for as long as the returned image can be
/// read from — this is why `build` takes ownership of an `Arc<Entry>` rather than a borrow.
pub trait ImageSink {
    /// The concrete platform image type produced.
    type Image;

    /// Wrap the pixel bytes backing `entry` in a platform image. `row_stride` and
    /// `image_byte_length` describe the sub-slice of the entry that holds pixel data (the
    /// trailing 32-byte header is excluded). `scale` is the host's current screen scale.
    fn build(&self, entry: Arc<Entry>, row_stride: u32, scale: f32) -> Self::Image;
}
