//! The orchestrator (spec §4, §5). [`ImageTable`] is the public entry point; it holds the
//! caller-supplied format/host/sink collaborators directly, while everything that an [`Entry`]
//! needs to reach back into on drop lives in the non-generic [`Shared`] so `Entry`/`Chunk` never
//! have to be generic over `F`/`H`/`S` themselves — the same split the teacher crate draws
//! between its generic `ChunkManager<P>` and the non-generic storage it hands out references
//! into.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::alloc::{self, Allocation};
use crate::cache::ChunkCache;
use crate::chunk::Chunk;
use crate::entry::Entry;
use crate::error::{GrowError, OpenError, SetError};
use crate::format::{Fingerprint, ImageFormat};
use crate::host::{ImageSink, TableHost};
use crate::index::IndexState;
use crate::layout::TableLayout;
use crate::metadata::{self, MetadataDoc, MetadataWriter};
use crate::util;

/// Point-in-time counters describing table occupancy (spec §6 "Observability").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub entry_count: u64,
    pub occupied_count: u64,
    pub mapped_chunk_count: u64,
    pub effective_maximum_count: u32,
    /// Total number of MRU-driven evictions performed over the table's lifetime (spec §4.4
    /// step 2).
    pub evictions_total: u64,
    /// Number of times allocation found every occupied entry in use and had no victim to evict
    /// (spec §7 "Eviction pressure"). A non-zero count means callers are holding images for the
    /// entire effective maximum at once.
    pub eviction_pressure_events: u64,
}

/// Mutable state reached only while holding [`Shared::state`]'s lock.
struct TableState {
    entry_count: u64,
    index: IndexState,
    chunks: ChunkCache,
    /// Per-entry-index write monitors (spec §5: "a monitor lock per entry index, serializing
    /// concurrent writers to the same slot"). Created lazily and never removed proactively —
    /// removed only when the entity at that index is deleted, so a monitor is never shared
    /// across two different entities that happened to reuse the same index.
    monitors: FxHashMap<u32, Arc<Mutex<()>>>,
}

impl TableState {
    fn monitor_for(&mut self, entry_index: u32) -> Arc<Mutex<()>> {
        Arc::clone(self.monitors.entry(entry_index).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

/// Everything an [`Entry`] needs to notify back on drop, plus the single table lock guarding all
/// other mutable state (spec §5 "Concurrency model"). `ReentrantMutex<RefCell<_>>` mirrors the
/// teacher crate's own `LockStrategy` helper: a single thread may re-enter while already holding
/// the lock (e.g. `delete` called from inside an eviction loop that is itself under the lock),
/// while `RefCell` gives ordinary `&mut` access to the guarded state once inside.
pub(crate) struct Shared {
    file: File,
    data_path: PathBuf,
    layout: TableLayout,
    fingerprint: Fingerprint,
    page_size: u64,
    state: ReentrantMutex<RefCell<TableState>>,
    metadata_writer: MetadataWriter,
    evictions_total: AtomicU64,
    eviction_pressure_events: AtomicU64,
}

impl Shared {
    /// Called from [`Entry`]'s `Drop` impl once a chunk's live-entry count reaches zero. Evicts
    /// the chunk from the cache if it is still at zero by the time this acquires the lock (spec
    /// §4.2).
    pub(crate) fn on_chunk_drained(&self, chunk_index: u32, _chunk: &Arc<Chunk>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.chunks.evict_if_drained(chunk_index);
    }

    fn ensure_chunk_mapped(
        &self,
        state: &mut TableState,
        chunk_index: u32,
    ) -> Result<Arc<Chunk>, crate::error::ChunkMapError> {
        let byte_offset = u64::from(chunk_index) * self.layout.chunk_length;
        state.chunks.get_or_map(chunk_index, &self.file, byte_offset, self.layout.chunk_length)
    }

    /// Grow the backing file by exactly one `entries_per_chunk`-sized increment (Design Note:
    /// "chunk-aligned growth"). Keeping growth chunk-aligned means every mapped chunk is always
    /// fully sized — there is never a partially-mapped tail chunk that would need remapping
    /// later when the table grows past it.
    fn grow_by_one_chunk(&self, state: &mut TableState) -> Result<(), GrowError> {
        let new_entry_count = state.entry_count + self.layout.entries_per_chunk;
        let new_len = self.layout.file_length_for(new_entry_count);
        self.file
            .set_len(new_len)
            .map_err(|source| GrowError { path: self.data_path.clone(), requested_len: new_len, source })?;
        state.entry_count = new_entry_count;
        Ok(())
    }

    fn save_metadata_snapshot(&self, state: &TableState) {
        let doc = MetadataDoc::snapshot(self.fingerprint, state.entry_count, &state.index);
        self.metadata_writer.enqueue(doc);
    }
}

/// A persistent, memory-mapped cache of pre-rendered images for a single pixel format, keyed by
/// an opaque entity [`Uuid`] (spec §1 "Overview").
///
/// `F`/`H`/`S` are the caller's format descriptor, host environment, and platform image sink
/// (spec §2). They are held directly on `ImageTable` rather than folded into [`Shared`] since
/// none of them is needed from an [`Entry`]'s drop path — only the index, chunk cache, and
/// metadata writer are.
pub struct ImageTable<F: ImageFormat, H: TableHost, S: ImageSink> {
    shared: Arc<Shared>,
    format: F,
    host: H,
    sink: S,
}

impl<F: ImageFormat, H: TableHost, S: ImageSink> ImageTable<F, H, S> {
    /// Open (creating if necessary) a table for `format` under the process-wide cache directory
    /// (spec §2.2, [`util::cache_dir`]).
    pub fn open(format: F, host: H, sink: S) -> Result<Self, OpenError> {
        Self::open_in(util::cache_dir(), format, host, sink)
    }

    /// Open a table rooted at a caller-chosen directory. Exposed mainly for tests, which should
    /// never share the process-wide cache directory with each other.
    pub fn open_in(dir: impl AsRef<Path>, format: F, host: H, sink: S) -> Result<Self, OpenError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| OpenError::DataFile { path: dir.to_path_buf(), source })?;

        let data_path = dir.join(format!("{}.imageTable", format.name()));
        let metadata_path = metadata::sidecar_path(&data_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .map_err(|source| OpenError::DataFile { path: data_path.clone(), source })?;

        let page_size = util::page_size();
        let layout = TableLayout::compute(&format, host.row_alignment(), page_size);
        let fingerprint = format.fingerprint();

        let existing_len = file
            .metadata()
            .map_err(|source| OpenError::DataFile { path: data_path.clone(), source })?
            .len();
        let mut entry_count = existing_len / layout.entry_length;

        let loaded = metadata::load(&metadata_path).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read image table metadata; starting empty");
            None
        });

        let index = match loaded {
            Some(doc) if doc.fingerprint != fingerprint => {
                // Spec §4.5 "Load": a format fingerprint mismatch means the on-disk layout is no
                // longer compatible with this run's format descriptor. Delete both files and
                // start empty rather than misinterpret bytes laid out for a different geometry.
                tracing::warn!(
                    path = %metadata_path.display(),
                    "image table format fingerprint changed; discarding data and metadata"
                );
                entry_count = 0;
                let _ = std::fs::remove_file(&metadata_path);
                file.set_len(0).map_err(|source| OpenError::DataFile { path: data_path.clone(), source })?;
                IndexState::default()
            }
            Some(doc) if (doc.entries.len() as u64) > entry_count => {
                // Spec §4.1 "Reconciliation on open": metadata references more slots than the
                // data file actually has (e.g. the data file was deleted/truncated externally
                // while the metadata file survived). Fully reset rather than trust stale indexes.
                tracing::warn!(
                    path = %metadata_path.display(),
                    recorded_entries = doc.entries.len(),
                    entry_count,
                    "image table metadata references more entries than the data file holds; resetting"
                );
                entry_count = 0;
                file.set_len(0).map_err(|source| OpenError::DataFile { path: data_path.clone(), source })?;
                IndexState::default()
            }
            Some(doc) => doc.rebuild_index(),
            None => IndexState::default(),
        };

        let state = TableState { entry_count, index, chunks: ChunkCache::default(), monitors: FxHashMap::default() };
        let metadata_writer = MetadataWriter::spawn(metadata_path);

        let shared = Arc::new(Shared {
            file,
            data_path,
            layout,
            fingerprint,
            page_size,
            state: ReentrantMutex::new(RefCell::new(state)),
            metadata_writer,
            evictions_total: AtomicU64::new(0),
            eviction_pressure_events: AtomicU64::new(0),
        });

        Ok(Self { shared, format, host, sink })
    }

    /// Render and store the image for `entity_id` (spec §4.1 `set`). Index bookkeeping (slot
    /// assignment, header ids, MRU promotion) is all made visible to concurrent `get`s and
    /// persisted to the metadata queue *before* the table lock is released — only then does
    /// `draw` run, under this entry's per-index monitor, so concurrent `set`/`get` calls for
    /// *other* entity ids proceed unblocked while it does (spec §5 "Ordering guarantees").
    pub fn set<D>(&self, entity_id: Uuid, source_id: Uuid, draw: D) -> Result<(), SetError>
    where
        D: FnOnce(&mut [u8], u32),
    {
        let (entry, monitor) = self.acquire_entry_and_publish(entity_id, source_id)?;

        let _monitor_guard = monitor.lock();
        // SAFETY: the per-index monitor just acquired is the only synchronization any other
        // `set` for this same entry index will wait on. The header/bookkeeping were already
        // published under the table lock above, before this monitor was even requested.
        let pixels = unsafe { entry.pixel_bytes_mut() };
        draw(pixels, self.shared.layout.row_stride as u32);
        if let Err(err) = entry.flush() {
            tracing::warn!(error = %err, %entity_id, "failed to flush image table entry to disk");
        }
        Ok(())
    }

    /// Resolve (allocating/growing/evicting as needed), acquire an `Entry` handle, write its
    /// header, publish the index/MRU bookkeeping, and enqueue a metadata save — all under the
    /// table lock (spec §4.1 `set`, steps 1-5), before returning the entry and its per-index
    /// monitor for the caller to run `draw` under, lock-free (step 6-7).
    fn acquire_entry_and_publish(
        &self,
        entity_id: Uuid,
        source_id: Uuid,
    ) -> Result<(Arc<Entry>, Arc<Mutex<()>>), SetError> {
        loop {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();

            let entry_index = if let Some(existing) = state.index.entry_index_of(entity_id) {
                existing
            } else {
                match alloc::next_entry_index(&state.index, &self.shared.layout, state.entry_count) {
                    Allocation::Use(idx) => idx,
                    Allocation::Grow => {
                        self.shared.grow_by_one_chunk(&mut state)?;
                        continue;
                    }
                    Allocation::Evict(victim) => {
                        tracing::debug!(victim = %victim, "evicting least-recently-used entry to make room");
                        self.delete_locked(&mut state, victim);
                        self.shared.evictions_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Allocation::Exhausted => {
                        tracing::warn!(
                            effective_maximum_count = self.shared.layout.effective_maximum_count,
                            "image table is saturated: every occupied entry is in use, nothing to evict"
                        );
                        self.shared.eviction_pressure_events.fetch_add(1, Ordering::Relaxed);
                        return Err(SetError::Saturated);
                    }
                }
            };

            let chunk_index = self.shared.layout.chunk_index_for_entry(entry_index);
            let chunk = self.shared.ensure_chunk_mapped(&mut state, chunk_index)?;
            let offset_in_chunk = self.shared.layout.offset_within_chunk(entry_index);
            let monitor = state.monitor_for(entry_index);

            let entry = Entry::new(
                chunk,
                offset_in_chunk,
                entry_index,
                self.shared.layout.entry_length,
                self.shared.layout.image_bytes,
                Arc::downgrade(&self.shared),
            );

            // Spec §4.1 `set`, step 3: write the header under the table lock, before any
            // concurrent `get` can observe this slot.
            entry.write_header(entity_id, source_id);
            // Step 4: publish bookkeeping so a concurrent `get` for `entity_id` finds this slot
            // immediately, even though `draw` hasn't run yet.
            state.index.insert(entity_id, entry_index, source_id);
            // Step 5: persist metadata asynchronously.
            self.shared.save_metadata_snapshot(&state);

            return Ok((entry, monitor));
        }
    }

    /// Retrieve the cached image for `entity_id`, if present and still valid for `source_id`
    /// (spec §4.1 `get`). Returns `None` on a cache miss, including when the stored source id no
    /// longer matches — in which case the stale entry is deleted so a subsequent `set` reuses its
    /// slot. If `preheat` is set, every page of the returned image's pixel region is faulted in
    /// before this call returns (spec §4.1 `get`, step 4).
    pub fn get(&self, entity_id: Uuid, source_id: Uuid, preheat: bool) -> Option<S::Image> {
        let entry = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();

            let entry_index = state.index.entry_index_of(entity_id)?;
            if state.index.source_id_of(entity_id) != Some(source_id) {
                tracing::debug!(%entity_id, "source id mismatch on get; evicting stale entry");
                self.delete_locked(&mut state, entity_id);
                self.shared.save_metadata_snapshot(&state);
                return None;
            }

            state.index.promote(entity_id);
            state.index.mark_in_use(entity_id);

            let chunk_index = self.shared.layout.chunk_index_for_entry(entry_index);
            let chunk = match self.shared.ensure_chunk_mapped(&mut state, chunk_index) {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(error = %err, %entity_id, "failed to map chunk for get");
                    state.index.release_in_use(entity_id);
                    return None;
                }
            };
            let offset_in_chunk = self.shared.layout.offset_within_chunk(entry_index);

            Entry::new(
                chunk,
                offset_in_chunk,
                entry_index,
                self.shared.layout.entry_length,
                self.shared.layout.image_bytes,
                Arc::downgrade(&self.shared),
            )
        };

        if entry.entity_id() != entity_id || entry.source_id() != source_id {
            // The header disagrees with the index. Should not happen outside a bug elsewhere in
            // this module, but vending stale pixels would be worse than a spurious miss.
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            state.index.release_in_use(entity_id);
            return None;
        }

        if preheat {
            entry.preheat(self.shared.page_size);
        }

        let shared = Arc::clone(&self.shared);
        entry.set_on_drop(Box::new(move || {
            let guard = shared.state.lock();
            let mut state = guard.borrow_mut();
            state.index.release_in_use(entity_id);
        }));

        let row_stride = self.shared.layout.row_stride as u32;
        Some(self.sink.build(entry, row_stride, self.host.screen_scale()))
    }

    /// Whether `entity_id` currently has a stored entry valid for `source_id`, without
    /// constructing an image (spec §4.1 `entry_exists`: "mirrors the verification step of `get`
    /// without constructing an image"). On an id mismatch the stale entry is deleted, same as
    /// `get`, and `false` is returned.
    pub fn entry_exists(&self, entity_id: Uuid, source_id: Uuid) -> bool {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();

        let Some(_entry_index) = state.index.entry_index_of(entity_id) else {
            return false;
        };

        if state.index.source_id_of(entity_id) != Some(source_id) {
            tracing::debug!(%entity_id, "source id mismatch on entry_exists; evicting stale entry");
            self.delete_locked(&mut state, entity_id);
            self.shared.save_metadata_snapshot(&state);
            return false;
        }

        true
    }

    /// Remove `entity_id`'s entry, if any, freeing its slot for reuse (spec §4.1 `delete`).
    /// Returns whether an entry actually existed.
    pub fn delete(&self, entity_id: Uuid) -> bool {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        let existed = state.index.entry_index_of(entity_id).is_some();
        self.delete_locked(&mut state, entity_id);
        if existed {
            self.shared.save_metadata_snapshot(&state);
        }
        existed
    }

    /// Spec §5: the per-index monitor map is never pruned, so its identity per index is stable
    /// for the process lifetime — removing it here on delete would let a concurrent `set` already
    /// holding the old monitor for this index race, unsynchronized, against whatever new entity
    /// reuses the index next.
    fn delete_locked(&self, state: &mut TableState, entity_id: Uuid) {
        state.index.remove(entity_id);
    }

    /// Discard every entry and truncate the backing file back to empty (spec §4.1 `reset`).
    pub fn reset(&self) -> Result<(), GrowError> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        state.index.clear();
        state.monitors.clear();
        state.chunks.clear();
        state.entry_count = 0;
        self.shared
            .file
            .set_len(0)
            .map_err(|source| GrowError { path: self.shared.data_path.clone(), requested_len: 0, source })?;
        self.shared.save_metadata_snapshot(&state);
        Ok(())
    }

    /// Snapshot of current occupancy, for diagnostics (spec §6 "Observability").
    pub fn stats(&self) -> Stats {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        Stats {
            entry_count: state.entry_count,
            occupied_count: state.index.len() as u64,
            mapped_chunk_count: state.chunks.mapped_chunk_count() as u64,
            effective_maximum_count: self.shared.layout.effective_maximum_count,
            evictions_total: self.shared.evictions_total.load(Ordering::Relaxed),
            eviction_pressure_events: self.shared.eviction_pressure_events.load(Ordering::Relaxed),
        }
    }

    /// The geometry this table was opened with.
    pub fn layout(&self) -> TableLayout {
        self.shared.layout
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}
