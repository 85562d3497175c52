//! In-memory bookkeeping for the Index & MRU State (spec §2.4, §3). Every method here assumes
//! the caller already holds the table lock — this type has no locking of its own, the same way
//! the teacher crate's `ChunkStatuses`/`InnerChunkStorage` expect to be reached only from behind
//! `ChunkManager`'s own synchronization.

use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

/// `indexMap`, `sourceMap`, `occupied`, the MRU order, and the in-use multiset, kept together
/// since every mutation touches at least two of them in lockstep (spec §3 invariants).
#[derive(Default)]
pub struct IndexState {
    index_map: FxHashMap<Uuid, u32>,
    source_map: FxHashMap<Uuid, Uuid>,
    occupied: FxHashSet<u32>,
    /// Most-recent-first. Scale is bounded by `effective_maximum_count`, so linear
    /// insert/remove here is deliberate — see `layout::TableLayout` for why that bound is small
    /// in practice.
    mru: Vec<Uuid>,
    in_use: FxHashMap<Uuid, u32>,
}

impl IndexState {
    pub fn entry_index_of(&self, entity_id: Uuid) -> Option<u32> {
        self.index_map.get(&entity_id).copied()
    }

    pub fn source_id_of(&self, entity_id: Uuid) -> Option<Uuid> {
        self.source_map.get(&entity_id).copied()
    }

    pub fn is_occupied(&self, entry_index: u32) -> bool {
        self.occupied.contains(&entry_index)
    }

    pub fn len(&self) -> usize {
        self.index_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_map.is_empty()
    }

    /// Record that `entity_id` now lives at `entry_index` with the given `source_id`, and
    /// promote it to the MRU head (spec §4.1 `set`, step 4).
    pub fn insert(&mut self, entity_id: Uuid, entry_index: u32, source_id: Uuid) {
        self.index_map.insert(entity_id, entry_index);
        self.occupied.insert(entry_index);
        self.source_map.insert(entity_id, source_id);
        self.promote(entity_id);
    }

    /// Move `entity_id` to MRU position 0, inserting it if absent (spec §4.4 `access`).
    pub fn promote(&mut self, entity_id: Uuid) {
        if let Some(pos) = self.mru.iter().position(|id| *id == entity_id) {
            self.mru.remove(pos);
        }
        self.mru.insert(0, entity_id);
    }

    /// Remove `entity_id` from every tracked structure. Returns the entry index it occupied, if
    /// any (spec §4.1 `delete`).
    pub fn remove(&mut self, entity_id: Uuid) -> Option<u32> {
        let entry_index = self.index_map.remove(&entity_id)?;
        self.occupied.remove(&entry_index);
        self.source_map.remove(&entity_id);
        if let Some(pos) = self.mru.iter().position(|id| *id == entity_id) {
            self.mru.remove(pos);
        }
        self.in_use.remove(&entity_id);
        Some(entry_index)
    }

    /// Clear all state (spec §4.1 `reset`).
    pub fn clear(&mut self) {
        self.index_map.clear();
        self.source_map.clear();
        self.occupied.clear();
        self.mru.clear();
        self.in_use.clear();
    }

    /// Mark one more outstanding reader for `entity_id` (spec §4.1 `get`, step 3).
    pub fn mark_in_use(&mut self, entity_id: Uuid) {
        *self.in_use.entry(entity_id).or_insert(0) += 1;
    }

    /// Release one outstanding reader for `entity_id`, dropping the bookkeeping entry once the
    /// count reaches zero.
    pub fn release_in_use(&mut self, entity_id: Uuid) {
        if let Some(count) = self.in_use.get_mut(&entity_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_use.remove(&entity_id);
            }
        }
    }

    pub fn is_in_use(&self, entity_id: Uuid) -> bool {
        self.in_use.contains_key(&entity_id)
    }

    /// Walk the MRU from oldest to newest (tail to head) looking for the first entity id that is
    /// not currently in use (spec §4.4, eviction victim selection).
    pub fn find_eviction_victim(&self) -> Option<Uuid> {
        self.mru
            .iter()
            .rev()
            .find(|id| !self.in_use.contains_key(*id))
            .copied()
    }

    /// The smallest entry index in `[0, entry_count)` that is not occupied, if any (spec §4.4
    /// `next_entry_index`, step 1).
    pub fn first_free_index(&self, entry_count: u64) -> Option<u32> {
        (0..entry_count as u32).find(|idx| !self.occupied.contains(idx))
    }

    /// Rebuild MRU from a list of `(entity_id, mru_index)` pairs loaded from metadata (spec
    /// §4.5 "Load"). Entries with no recorded position are appended in arbitrary (but stable)
    /// order after the positioned ones, per "ignoring any entity with no recorded position,
    /// then compacting".
    pub fn rebuild_mru(&mut self, positions: Vec<(Uuid, Option<u32>)>) {
        let mut positioned: Vec<(u32, Uuid)> = positions
            .iter()
            .filter_map(|(id, pos)| pos.map(|p| (p, *id)))
            .collect();
        positioned.sort_by_key(|(pos, _)| *pos);

        let mut unpositioned: Vec<Uuid> = positions
            .iter()
            .filter(|(_, pos)| pos.is_none())
            .map(|(id, _)| *id)
            .collect();

        self.mru = positioned.into_iter().map(|(_, id)| id).collect();
        self.mru.append(&mut unpositioned);
    }

    /// This entity's current position in MRU (0 = most recent), used when snapshotting metadata
    /// for a save (spec §4.5 "Save").
    pub fn mru_index_of(&self, entity_id: Uuid) -> Option<u32> {
        self.mru.iter().position(|id| *id == entity_id).map(|p| p as u32)
    }

    pub fn iter_entities(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.index_map.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn insert_promotes_to_mru_head() {
        let mut state = IndexState::default();
        state.insert(uuid(1), 0, uuid(101));
        state.insert(uuid(2), 1, uuid(102));

        assert_eq!(state.mru_index_of(uuid(2)), Some(0));
        assert_eq!(state.mru_index_of(uuid(1)), Some(1));
    }

    #[test]
    fn get_promotes_existing_entity() {
        let mut state = IndexState::default();
        state.insert(uuid(1), 0, uuid(101));
        state.insert(uuid(2), 1, uuid(102));
        state.promote(uuid(1));

        assert_eq!(state.mru_index_of(uuid(1)), Some(0));
        assert_eq!(state.mru_index_of(uuid(2)), Some(1));
    }

    #[test]
    fn eviction_victim_skips_in_use_entities() {
        let mut state = IndexState::default();
        state.insert(uuid(1), 0, uuid(101));
        state.insert(uuid(2), 1, uuid(102));
        // MRU is now [2, 1]; oldest is 1.
        state.mark_in_use(uuid(1));

        // 1 is in use, so the next-oldest not-in-use entity should be picked, which is 2.
        assert_eq!(state.find_eviction_victim(), Some(uuid(2)));
    }

    #[test]
    fn remove_clears_every_structure() {
        let mut state = IndexState::default();
        state.insert(uuid(1), 0, uuid(101));
        assert_eq!(state.remove(uuid(1)), Some(0));
        assert!(state.is_empty());
        assert!(!state.is_occupied(0));
        assert_eq!(state.mru_index_of(uuid(1)), None);
    }
}
