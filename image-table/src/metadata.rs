//! On-disk metadata: the sidecar file recording which entity occupies which entry slot, its
//! source id, and its MRU position (spec §4.5). Persisted with `bincode` the same way the
//! reference mmap-storage example in the retrieval pack snapshots its own index structures.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MetadataError;
use crate::format::Fingerprint;
use crate::index::IndexState;

/// One entity's slot assignment, as recorded on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entity_id: Uuid,
    pub source_id: Uuid,
    pub entry_index: u32,
    pub mru_index: u32,
}

/// The full sidecar document (spec §4.5). `fingerprint` lets `open` detect a format change and
/// discard stale metadata rather than misinterpreting bytes laid out for a different geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDoc {
    pub fingerprint: Fingerprint,
    pub entry_count: u64,
    pub entries: Vec<EntryRecord>,
}

impl MetadataDoc {
    /// Snapshot the current index state into a document ready to serialize (spec §4.5 "Save").
    pub fn snapshot(fingerprint: Fingerprint, entry_count: u64, index: &IndexState) -> Self {
        let entries = index
            .iter_entities()
            .filter_map(|entity_id| {
                let entry_index = index.entry_index_of(entity_id)?;
                let source_id = index.source_id_of(entity_id)?;
                let mru_index = index.mru_index_of(entity_id).unwrap_or(u32::MAX);
                Some(EntryRecord { entity_id, source_id, entry_index, mru_index })
            })
            .collect();

        Self { fingerprint, entry_count, entries }
    }

    /// Rebuild an [`IndexState`] from this document. Used on `open` once the fingerprint has
    /// already been confirmed to match the live format (spec §4.5 "Load").
    pub fn rebuild_index(&self) -> IndexState {
        let mut index = IndexState::default();
        for record in &self.entries {
            index.insert(record.entity_id, record.entry_index, record.source_id);
        }
        let positions = self
            .entries
            .iter()
            .map(|record| {
                let pos = if record.mru_index == u32::MAX { None } else { Some(record.mru_index) };
                (record.entity_id, pos)
            })
            .collect();
        index.rebuild_mru(positions);
        index
    }
}

/// Read and deserialize a metadata document from `path`. Returns `Ok(None)` if the file does not
/// exist yet (a brand new table).
pub fn load(path: &Path) -> Result<Option<MetadataDoc>, MetadataError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(MetadataError::Read { path: path.to_path_buf(), source }),
    };

    let doc = bincode::deserialize_from(BufReader::new(file))
        .map_err(|source| MetadataError::Decode { path: path.to_path_buf(), source })?;
    Ok(Some(doc))
}

/// Serialize and write `doc` to `path`, replacing any existing file.
///
/// The write is not transactional: a crash mid-write can leave a truncated or corrupt file.
/// `open` already treats a corrupt metadata file as absent metadata (rebuilding from a clean
/// table), which is the behavior the spec calls out as acceptable for this subsystem.
pub fn save(path: &Path, doc: &MetadataDoc) -> Result<(), MetadataError> {
    let file = File::create(path).map_err(|source| MetadataError::Write { path: path.to_path_buf(), source })?;
    bincode::serialize_into(BufWriter::new(file), doc).map_err(|source| MetadataError::Encode { source })
}

/// A dedicated background thread that owns all metadata writes, so `set`/`delete` never block on
/// disk I/O for the sidecar file (spec §4.5 "Save is asynchronous... the table may coalesce
/// rapid, successive saves"). Built on a bounded(1) channel: if a write is already queued when a
/// newer snapshot arrives, the newer one replaces it — "latest wins" coalescing rather than a
/// growing backlog.
pub struct MetadataWriter {
    sender: Sender<MetadataDoc>,
    handle: Option<JoinHandle<()>>,
}

impl MetadataWriter {
    pub fn spawn(path: PathBuf) -> Self {
        let (sender, receiver): (Sender<MetadataDoc>, Receiver<MetadataDoc>) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name("image-table-metadata".into())
            .spawn(move || {
                while let Ok(doc) = receiver.recv() {
                    if let Err(err) = save(&path, &doc) {
                        tracing::warn!(error = %err, path = %path.display(), "failed to persist image table metadata");
                    }
                }
            })
            .expect("failed to spawn metadata writer thread");

        Self { sender, handle: Some(handle) }
    }

    /// Queue `doc` to be written. Never blocks: if the single queue slot is occupied by an
    /// unwritten snapshot, that snapshot is discarded in favor of `doc`, which is always at least
    /// as fresh.
    pub fn enqueue(&self, doc: MetadataDoc) {
        match self.sender.try_send(doc) {
            Ok(()) => {}
            Err(TrySendError::Full(doc)) => {
                // Single producer (the table lock serializes all calls to `enqueue`), so it's
                // safe to drain the stale pending snapshot and resend without a retry loop.
                let _ = self.sender.try_recv();
                let _ = self.sender.try_send(doc);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("metadata writer thread is gone; dropping queued save");
            }
        }
    }
}

impl Drop for MetadataWriter {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel; the background thread's `recv` loop then exits
        // on its own once it has flushed whatever was last queued.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build the sidecar metadata path for a table rooted at `image_file_path` (spec §6: the data
/// file is `<format_name>.imageTable`, the sidecar is `<format_name>.metadata` next to it).
pub fn sidecar_path(image_file_path: &Path) -> PathBuf {
    image_file_path.with_extension("metadata")
}
