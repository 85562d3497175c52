//! A [`Chunk`] is a contiguous, memory-mapped window over a range of entry slots in the backing
//! file (spec §2.3). Reference-counted via the `Arc` the chunk cache and every live [`Entry`][crate::entry::Entry]
//! hold; unmapped when the last live entry goes away (spec §4.2).

use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::ChunkMapError;

/// A mapped window over `[chunk_index * chunk_length, chunk_index * chunk_length + mapped_len)`
/// of the backing file.
///
/// The mapping is read/write and shared (spec §4.2: "so that writes by `draw` become visible to
/// both readers of the same in-memory range and to the backing file when flushed"). Access to
/// the raw bytes goes through [`Chunk::base_ptr`] rather than through the lock on every touch;
/// the mutex here only ever guards the rare in-place remap described on
/// [`ChunkCache`][crate::cache::ChunkCache] — never ordinary pixel reads/writes, which would
/// otherwise serialize unrelated entries against each other.
pub struct Chunk {
    index: u32,
    mapped_len: u64,
    mmap: Mutex<MmapMut>,
    /// Count of outstanding [`Entry`][crate::entry::Entry] handles into this chunk. Gates both
    /// eviction from the chunk cache and whether this chunk may be remapped in place.
    live_entries: AtomicU32,
}

impl Chunk {
    /// Map `[chunk_index * chunk_length, chunk_index * chunk_length + mapped_len)` of `file`.
    pub fn map(file: &File, chunk_index: u32, byte_offset: u64, mapped_len: u64) -> Result<Self, ChunkMapError> {
        // SAFETY: `file` has already been sized (via `set_len`) to cover `byte_offset +
        // mapped_len`; the file is owned by the table for its lifetime (spec §5 "Shared
        // resources") so no other process is expected to truncate it concurrently.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(byte_offset)
                .len(mapped_len as usize)
                .map_mut(file)
        }
        .map_err(|source| ChunkMapError::Map { chunk_index, source })?;

        Ok(Self {
            index: chunk_index,
            mapped_len,
            mmap: Mutex::new(mmap),
            live_entries: AtomicU32::new(0),
        })
    }

    /// This chunk's index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Number of bytes actually mapped (may be less than a full `chunk_length` for the tail
    /// chunk of a table whose `entry_count` isn't chunk-aligned).
    #[inline]
    pub fn mapped_len(&self) -> u64 {
        self.mapped_len
    }

    /// A pointer to the start of the mapped region. Valid for as long as `self` is not remapped
    /// — guaranteed by the chunk cache only remapping a chunk while its `live_entries` count is
    /// zero, which can only be observed while holding the table lock that also gates the
    /// creation of new entries into this chunk.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.lock().as_mut_ptr()
    }

    /// Ask the OS to write back `[offset, offset + len)` of this chunk's mapping.
    pub fn flush_range(&self, offset: usize, len: usize) -> std::io::Result<()> {
        self.mmap.lock().flush_range(offset, len)
    }

    /// Touch every page in `[offset, offset + len)` to fault it into the process's working set
    /// (spec §4.3 `preheat`).
    pub fn preheat_range(&self, offset: usize, len: usize, page_size: u64) {
        let guard = self.mmap.lock();
        let bytes = &guard[offset..offset + len];
        let mut i = 0usize;
        let stride = page_size as usize;
        let mut checksum: u8 = 0;
        while i < bytes.len() {
            // `read_volatile` through a raw pointer so the optimizer can't prove this read is
            // dead and elide it; the actual value doesn't matter, only that the page is faulted.
            checksum = checksum.wrapping_add(unsafe { std::ptr::read_volatile(&bytes[i]) });
            i += stride;
        }
        std::hint::black_box(checksum);
    }

    /// Current number of outstanding `Entry` handles into this chunk.
    #[inline]
    pub fn live_entry_count(&self) -> u32 {
        self.live_entries.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn acquire_entry(&self) {
        self.live_entries.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one outstanding entry handle. Returns the count *after* the release, so the
    /// caller can tell when it has dropped to zero and the chunk is eligible for eviction.
    #[inline]
    pub(crate) fn release_entry(&self) -> u32 {
        self.live_entries.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.live_entries.load(Ordering::Acquire),
            0,
            "chunk {} unmapped with outstanding entry handles",
            self.index
        );
        if let Err(err) = self.mmap.get_mut().flush() {
            tracing::warn!(chunk_index = self.index, error = %err, "failed to flush chunk on unmap");
        }
    }
}
