//! Entry-slot allocation and eviction selection (spec §4.4 `next_entry_index`). Pulled out of
//! `table.rs` so the decision procedure — free slot, grow, or evict — can be unit tested against
//! a bare [`IndexState`] without a real backing file.

use uuid::Uuid;

use crate::index::IndexState;
use crate::layout::TableLayout;

/// What the caller should do next to obtain a free entry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Use this entry index directly; it is currently unoccupied.
    Use(u32),
    /// No free index exists but the table is under its effective maximum: grow the file by one
    /// chunk's worth of entries, then call [`next_entry_index`] again.
    Grow,
    /// The table is at its effective maximum and has no free index: delete this entity (the MRU
    /// eviction victim), then call [`next_entry_index`] again.
    Evict(Uuid),
    /// The table is at its effective maximum, has no free index, and every occupied entry is
    /// currently in use (spec §4.4: "if no victim exists... the table has reached saturation").
    Exhausted,
}

/// Decide how to obtain a free entry index for a new `set`, given the current `entry_count`
/// (spec §4.4, steps 1-3, verbatim):
///
/// 1. If an unoccupied index exists in `[0, entry_count)`, use it.
/// 2. Otherwise, if `entry_count < effective_maximum_count`, grow.
/// 3. Otherwise, evict the least-recently-used entity that is not currently in use; if none
///    exists, the table is saturated.
pub fn next_entry_index(index: &IndexState, layout: &TableLayout, entry_count: u64) -> Allocation {
    if let Some(free) = index.first_free_index(entry_count) {
        return Allocation::Use(free);
    }

    if entry_count < u64::from(layout.effective_maximum_count) {
        return Allocation::Grow;
    }

    match index.find_eviction_victim() {
        Some(victim) => Allocation::Evict(victim),
        None => Allocation::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BitmapInfo, ColorModel, Fingerprint, ImageFormat};

    struct Fmt {
        max: u32,
    }

    impl ImageFormat for Fmt {
        fn pixel_width(&self) -> u32 {
            8
        }
        fn pixel_height(&self) -> u32 {
            8
        }
        fn bytes_per_pixel(&self) -> u32 {
            4
        }
        fn bits_per_component(&self) -> u32 {
            8
        }
        fn color_model(&self) -> ColorModel {
            ColorModel::Rgb
        }
        fn bitmap_info(&self) -> BitmapInfo {
            BitmapInfo(0)
        }
        fn name(&self) -> &str {
            "test"
        }
        fn maximum_count(&self) -> u32 {
            self.max
        }
        fn fingerprint(&self) -> Fingerprint {
            Fingerprint::compute(self)
        }
    }

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn uses_free_index_before_growing_or_evicting() {
        let format = Fmt { max: 100 };
        let layout = TableLayout::compute(&format, 64, 4096);
        let mut index = IndexState::default();
        index.insert(uuid(1), 0, uuid(9));

        assert_eq!(next_entry_index(&index, &layout, 2), Allocation::Use(1));
    }

    #[test]
    fn grows_when_below_effective_maximum_and_full() {
        let format = Fmt { max: 100 };
        let layout = TableLayout::compute(&format, 64, 4096);
        let mut index = IndexState::default();
        index.insert(uuid(1), 0, uuid(9));

        assert_eq!(next_entry_index(&index, &layout, 1), Allocation::Grow);
    }

    #[test]
    fn evicts_lru_when_at_effective_maximum() {
        let format = Fmt { max: 1 };
        let layout = TableLayout::compute(&format, 64, 4096);
        // effective_maximum_count gets raised to entries_per_chunk, so fill every slot.
        let mut index = IndexState::default();
        for i in 0..layout.effective_maximum_count {
            index.insert(uuid(i as u8 + 1), i, uuid(9));
        }

        match next_entry_index(&index, &layout, layout.effective_maximum_count as u64) {
            Allocation::Evict(victim) => assert_eq!(victim, uuid(1)),
            other => panic!("expected Evict, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_when_every_occupied_entry_is_in_use() {
        let format = Fmt { max: 1 };
        let layout = TableLayout::compute(&format, 64, 4096);
        let mut index = IndexState::default();
        for i in 0..layout.effective_maximum_count {
            let id = uuid(i as u8 + 1);
            index.insert(id, i, uuid(9));
            index.mark_in_use(id);
        }

        assert_eq!(
            next_entry_index(&index, &layout, layout.effective_maximum_count as u64),
            Allocation::Exhausted
        );
    }
}
