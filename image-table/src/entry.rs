//! An [`Entry`] is a handle onto a single, fixed-size entry slot inside a [`Chunk`] (spec §2.3,
//! §4.3). Multiple `Entry` handles may exist for the same entry index at once (e.g. one writer
//! under the per-index monitor, concurrently with readers who already vended an image for an
//! older header generation); each is an independent reference count against its parent chunk.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::layout::HEADER_SIZE;
use crate::table::Shared;

/// A callback run exactly once, when the owning [`Entry`] is dropped. Used by the orchestrator
/// to decrement the in-use count for the entity id an `Entry` was vended for (spec §4.1 `get`,
/// step 3).
pub type OnDrop = Box<dyn FnOnce() + Send>;

/// A live handle onto one entry slot: `entry_length` bytes inside a mapped [`Chunk`], of which
/// the first `image_byte_length` are pixel data and the trailing 32 are the id header.
pub struct Entry {
    chunk: Arc<Chunk>,
    offset_in_chunk: u64,
    entry_index: u32,
    entry_length: u64,
    image_byte_length: u64,
    notify: Weak<Shared>,
    on_drop: Mutex<Option<OnDrop>>,
}

impl Entry {
    /// Build a new handle over the entry at `entry_index` inside `chunk`. Increments the
    /// chunk's live-entry count; the matching decrement happens in [`Drop`].
    pub(crate) fn new(
        chunk: Arc<Chunk>,
        offset_in_chunk: u64,
        entry_index: u32,
        entry_length: u64,
        image_byte_length: u64,
        notify: Weak<Shared>,
    ) -> Arc<Self> {
        chunk.acquire_entry();
        Arc::new(Self {
            chunk,
            offset_in_chunk,
            entry_index,
            entry_length,
            image_byte_length,
            notify,
            on_drop: Mutex::new(None),
        })
    }

    /// Register a callback to run once, when this entry is dropped. Replaces any previously set
    /// callback (there is at most one meaningful owner of this hook at a time: the orchestrator,
    /// right after vending the entry from `get`).
    pub(crate) fn set_on_drop(&self, callback: OnDrop) {
        *self.on_drop.lock() = Some(callback);
    }

    /// This entry's index within the table.
    #[inline]
    pub fn entry_index(&self) -> u32 {
        self.entry_index
    }

    /// The number of bytes of pixel data (excludes padding and the trailing header).
    #[inline]
    pub fn image_byte_length(&self) -> u64 {
        self.image_byte_length
    }

    /// Raw pointer to the start of this entry's `entry_length`-byte slot.
    ///
    /// # Safety
    /// The pointer is valid for reads and writes for as long as `self` (or any `Entry`/`Chunk`
    /// clone sharing the same backing chunk) is alive. Callers aliasing this pointer into a
    /// platform image (spec Design Note: "Image aliasing across FFI/ownership boundary") must
    /// keep a strong reference to this `Entry` for as long as they read through the pointer.
    #[inline]
    pub fn bytes(self: &Arc<Self>) -> *mut u8 {
        unsafe { self.chunk.base_ptr().add(self.offset_in_chunk as usize) }
    }

    /// The pixel payload as a byte slice.
    ///
    /// # Safety
    /// Same aliasing requirements as [`Entry::bytes`]: the returned slice's lifetime is
    /// unconnected to `self`'s borrow, so the caller must independently keep this `Entry` (or an
    /// `Arc` clone of it) alive for as long as the slice is read.
    #[inline]
    pub unsafe fn pixel_bytes<'a>(self: &Arc<Self>) -> &'a [u8] {
        std::slice::from_raw_parts(self.bytes(), self.image_byte_length as usize)
    }

    /// The pixel payload as a mutable byte slice, for the `draw` callback.
    ///
    /// # Safety
    /// See [`Entry::pixel_bytes`]. Additionally, the caller must ensure no other writer is
    /// concurrently touching this slot — in the orchestrator this is guaranteed by the
    /// per-index monitor (spec §5).
    #[inline]
    pub unsafe fn pixel_bytes_mut<'a>(self: &Arc<Self>) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.bytes(), self.image_byte_length as usize)
    }

    /// Spec §6: the trailing header sits at `entry_length - HEADER_SIZE`, after pixel data *and*
    /// the padding that fills out the rest of the page-aligned slot — not immediately after
    /// `image_byte_length`.
    fn header_offset(&self) -> usize {
        self.entry_length as usize - HEADER_SIZE as usize
    }

    /// The 16-byte entity id stored in this entry's trailing header.
    pub fn entity_uuid_bytes(&self) -> [u8; 16] {
        let ptr = unsafe { self.chunk.base_ptr().add(self.offset_in_chunk as usize + self.header_offset()) };
        let mut out = [0u8; 16];
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), 16) };
        out
    }

    /// The 16-byte source-image id stored in this entry's trailing header.
    pub fn source_uuid_bytes(&self) -> [u8; 16] {
        let ptr = unsafe {
            self.chunk
                .base_ptr()
                .add(self.offset_in_chunk as usize + self.header_offset() + 16)
        };
        let mut out = [0u8; 16];
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), 16) };
        out
    }

    pub fn entity_id(&self) -> Uuid {
        Uuid::from_bytes(self.entity_uuid_bytes())
    }

    pub fn source_id(&self) -> Uuid {
        Uuid::from_bytes(self.source_uuid_bytes())
    }

    /// Overwrite the 32-byte trailing header with `entity_id`/`source_id` (spec §4.1 `set`,
    /// step 3). Written "atomically" in the sense the spec means it: under the table lock, as
    /// one uninterrupted pair of writes, before any concurrent reader can observe this slot.
    pub fn write_header(&self, entity_id: Uuid, source_id: Uuid) {
        let base = unsafe { self.chunk.base_ptr().add(self.offset_in_chunk as usize + self.header_offset()) };
        unsafe {
            std::ptr::copy_nonoverlapping(entity_id.as_bytes().as_ptr(), base, 16);
            std::ptr::copy_nonoverlapping(source_id.as_bytes().as_ptr(), base.add(16), 16);
        }
    }

    /// Ask the OS to write back this entire entry slot (pixels + header).
    pub fn flush(&self) -> std::io::Result<()> {
        self.chunk.flush_range(self.offset_in_chunk as usize, self.entry_length as usize)
    }

    /// Touch every page of the pixel payload to fault it in (spec §4.1 `get`, step 4).
    pub fn preheat(&self, page_size: u64) {
        self.chunk
            .preheat_range(self.offset_in_chunk as usize, self.image_byte_length as usize, page_size);
    }
}

static_assertions::const_assert_eq!(HEADER_SIZE, 32);

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(callback) = self.on_drop.lock().take() {
            callback();
        }

        let remaining = self.chunk.release_entry();
        if remaining == 0 {
            if let Some(shared) = self.notify.upgrade() {
                shared.on_chunk_drained(self.chunk.index(), &self.chunk);
            }
        }
    }
}

static_assertions::assert_impl_all!(Entry: Send, Sync);
