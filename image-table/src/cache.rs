//! The chunk cache: which chunks are currently mapped, keyed by chunk index (spec §4.2). Callers
//! always reach this through the table lock, so — like [`IndexState`][crate::index::IndexState]
//! — nothing in here does its own locking.

use std::fs::File;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::error::ChunkMapError;

/// Currently-mapped chunks. A chunk is present here from the moment it is first touched by
/// `set`/`get` until its `live_entries` count drops back to zero and the orchestrator evicts it
/// (spec §4.2: "A chunk with zero live entries may be unmapped (`munmap`) to bound resident
/// memory").
#[derive(Default)]
pub struct ChunkCache {
    chunks: FxHashMap<u32, Arc<Chunk>>,
}

impl ChunkCache {
    /// The chunk at `chunk_index`, if currently mapped.
    pub fn get(&self, chunk_index: u32) -> Option<Arc<Chunk>> {
        self.chunks.get(&chunk_index).cloned()
    }

    /// The chunk at `chunk_index`, mapping it from `file` if it isn't already resident.
    pub fn get_or_map(
        &mut self,
        chunk_index: u32,
        file: &File,
        byte_offset: u64,
        mapped_len: u64,
    ) -> Result<Arc<Chunk>, ChunkMapError> {
        if let Some(chunk) = self.chunks.get(&chunk_index) {
            return Ok(Arc::clone(chunk));
        }

        let chunk = Arc::new(Chunk::map(file, chunk_index, byte_offset, mapped_len)?);
        self.chunks.insert(chunk_index, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Evict `chunk_index` from the cache if it is still mapped and has no live entries. Called
    /// from [`Entry`][crate::entry::Entry]'s drop path once a chunk's entry count reaches zero.
    /// Returns `true` if a chunk was actually evicted.
    ///
    /// If another `Entry` was created for this chunk between the count reaching zero and this
    /// call acquiring the table lock, `live_entry_count` will no longer be zero and eviction is
    /// skipped — the chunk stays resident, which is always safe, just not maximally eager.
    pub fn evict_if_drained(&mut self, chunk_index: u32) -> bool {
        let Some(chunk) = self.chunks.get(&chunk_index) else {
            return false;
        };
        if chunk.live_entry_count() != 0 {
            return false;
        }
        self.chunks.remove(&chunk_index);
        true
    }

    /// Drop every mapped chunk (spec §4.1 `reset`). Callers must ensure no `Entry` handles are
    /// outstanding; chunks with live entries are retained by those `Entry`'s own `Arc` anyway, so
    /// this only releases the cache's reference.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn mapped_chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
