//! Geometry derived from an [`ImageFormat`], computed once at table construction (spec §3
//! invariants). Pulled into its own module rather than left inline on
//! [`ImageTable`][crate::table::ImageTable] so the arithmetic — and its invariants — can be unit
//! tested in isolation, the same separation the teacher crate draws between `ChunkPos` math and
//! the chunk manager that uses it.

use crate::format::ImageFormat;
use crate::util::align_up;

/// Trailing per-entry header: a 16-byte entity id followed by a 16-byte source-image id.
pub const HEADER_SIZE: u64 = 32;

/// The minimum number of entries a chunk may hold, even if a single entry is enormous
/// (spec §3: `entries_per_chunk = max(4, floor(2 MiB / entry_length))`).
const MIN_ENTRIES_PER_CHUNK: u64 = 4;

/// The target chunk size used to derive `entries_per_chunk`.
const CHUNK_TARGET_BYTES: u64 = 2 * 1024 * 1024;

/// Derived, immutable geometry for one table. Every field here is computed once from an
/// [`ImageFormat`] plus the hardware row alignment and OS page size, and never changes for the
/// lifetime of the table (the entry/chunk/file *counts* grow; the per-entry geometry does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Bytes per pixel row, rounded up to `row_alignment`.
    pub row_stride: u64,
    /// `row_stride * height` — the pixel payload size, before header and padding.
    pub image_bytes: u64,
    /// `align_up(image_bytes + HEADER_SIZE, page_size)` — the full size of one entry slot.
    pub entry_length: u64,
    /// `max(4, floor(2 MiB / entry_length))`.
    pub entries_per_chunk: u64,
    /// `entry_length * entries_per_chunk`.
    pub chunk_length: u64,
    /// `max(configured_maximum, entries_per_chunk)` (spec §4.1: "effective maximum").
    pub effective_maximum_count: u32,
}

impl TableLayout {
    /// Compute the layout for `format`, using `row_alignment` and `page_size` as the hardware
    /// and OS constants (spec §3 invariants, verbatim).
    pub fn compute(format: &dyn ImageFormat, row_alignment: u64, page_size: u64) -> Self {
        let width = u64::from(format.pixel_width());
        let height = u64::from(format.pixel_height());
        let bytes_per_pixel = u64::from(format.bytes_per_pixel());

        let row_stride = align_up(width * bytes_per_pixel, row_alignment);
        let image_bytes = row_stride * height;
        let entry_length = align_up(image_bytes + HEADER_SIZE, page_size);

        let entries_per_chunk = (CHUNK_TARGET_BYTES / entry_length).max(MIN_ENTRIES_PER_CHUNK);
        let chunk_length = entry_length * entries_per_chunk;

        let configured_maximum = format.maximum_count();
        let effective_maximum_count = if u64::from(configured_maximum) < entries_per_chunk {
            // Spec §4.1: warn (non-fatally) and raise so at least one chunk is fully useful.
            tracing::warn!(
                configured_maximum,
                entries_per_chunk,
                "configured maximum_count is smaller than entries_per_chunk; raising effective maximum"
            );
            entries_per_chunk as u32
        } else {
            configured_maximum
        };

        Self {
            row_stride,
            image_bytes,
            entry_length,
            entries_per_chunk,
            chunk_length,
            effective_maximum_count,
        }
    }

    /// `chunk_count = ceil(entry_count / entries_per_chunk)`.
    pub fn chunk_count_for(&self, entry_count: u64) -> u64 {
        entry_count.div_ceil(self.entries_per_chunk)
    }

    /// `file_length = entry_length * entry_count`.
    pub fn file_length_for(&self, entry_count: u64) -> u64 {
        self.entry_length * entry_count
    }

    /// The entry index that starts chunk `chunk_index`.
    pub fn first_entry_in_chunk(&self, chunk_index: u32) -> u64 {
        u64::from(chunk_index) * self.entries_per_chunk
    }

    /// Which chunk index a given entry index falls into.
    pub fn chunk_index_for_entry(&self, entry_index: u32) -> u32 {
        (u64::from(entry_index) / self.entries_per_chunk) as u32
    }

    /// The byte offset of `entry_index` within its chunk's mapped region.
    pub fn offset_within_chunk(&self, entry_index: u32) -> u64 {
        (u64::from(entry_index) % self.entries_per_chunk) * self.entry_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fmt {
        w: u32,
        h: u32,
        bpp: u32,
        max: u32,
    }

    impl ImageFormat for Fmt {
        fn pixel_width(&self) -> u32 {
            self.w
        }
        fn pixel_height(&self) -> u32 {
            self.h
        }
        fn bytes_per_pixel(&self) -> u32 {
            self.bpp
        }
        fn bits_per_component(&self) -> u32 {
            8
        }
        fn color_model(&self) -> crate::format::ColorModel {
            crate::format::ColorModel::Rgb
        }
        fn bitmap_info(&self) -> crate::format::BitmapInfo {
            crate::format::BitmapInfo(0)
        }
        fn name(&self) -> &str {
            "test"
        }
        fn maximum_count(&self) -> u32 {
            self.max
        }
        fn fingerprint(&self) -> crate::format::Fingerprint {
            crate::format::Fingerprint::compute(self)
        }
    }

    #[test]
    fn layout_is_page_and_row_aligned() {
        let format = Fmt { w: 128, h: 128, bpp: 4, max: 2 };
        let layout = TableLayout::compute(&format, 64, 4096);

        assert_eq!(layout.row_stride % 64, 0);
        assert_eq!(layout.entry_length % 4096, 0);
        assert_eq!(layout.chunk_length, layout.entry_length * layout.entries_per_chunk);
        assert!(layout.entries_per_chunk >= 4);
        // max=2 is below entries_per_chunk, so it should have been raised.
        assert_eq!(layout.effective_maximum_count as u64, layout.entries_per_chunk);
    }

    #[test]
    fn file_length_and_chunk_count_track_entry_count() {
        let format = Fmt { w: 64, h: 64, bpp: 4, max: 1000 };
        let layout = TableLayout::compute(&format, 64, 4096);

        assert_eq!(layout.file_length_for(10), layout.entry_length * 10);
        assert_eq!(
            layout.chunk_count_for(layout.entries_per_chunk + 1),
            2
        );
    }
}
