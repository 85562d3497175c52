//! End-to-end behaviour of [`ImageTable`] against a tiny in-test pixel format (spec §8). Every
//! test opens its own [`tempfile::tempdir`] so tables never share a cache directory.

use std::path::Path;
use std::sync::{Arc, Once};

use image_table::{BitmapInfo, ColorModel, Entry, Fingerprint, ImageFormat, ImageSink, ImageTable, TableHost};
use pretty_assertions::assert_eq;
use uuid::Uuid;

static TRACING_INIT: Once = Once::new();

/// Install a `tracing_subscriber` fmt subscriber once per test binary, so the `tracing::warn!`
/// calls this crate makes on its log-worthy paths (spec §7) are visible when a test is run with
/// `--nocapture` instead of silently going nowhere.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().init();
    });
}

#[derive(Clone, Copy)]
struct TestFormat {
    name: &'static str,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    maximum_count: u32,
}

impl TestFormat {
    fn rgba(name: &'static str, width: u32, height: u32, maximum_count: u32) -> Self {
        Self { name, width, height, bytes_per_pixel: 4, maximum_count }
    }
}

impl ImageFormat for TestFormat {
    fn pixel_width(&self) -> u32 {
        self.width
    }
    fn pixel_height(&self) -> u32 {
        self.height
    }
    fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
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
        self.name
    }
    fn maximum_count(&self) -> u32 {
        self.maximum_count
    }
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self)
    }
}

struct TestHost;

impl TableHost for TestHost {
    fn row_alignment(&self) -> u64 {
        64
    }
    fn screen_scale(&self) -> f32 {
        1.0
    }
}

/// A stand-in "platform image": just the aliased [`Entry`] plus the row stride it was built
/// with, so tests can read pixels straight through the mapped memory (spec §4.1 `get`, step 3:
/// "the image's lifetime extends the Entry's").
struct TestImage {
    entry: Arc<Entry>,
}

impl TestImage {
    fn pixels(&self) -> &[u8] {
        unsafe { self.entry.pixel_bytes() }
    }
}

struct TestSink;

impl ImageSink for TestSink {
    type Image = TestImage;

    fn build(&self, entry: Arc<Entry>, _row_stride: u32, _scale: f32) -> TestImage {
        TestImage { entry }
    }
}

type Table = ImageTable<TestFormat, TestHost, TestSink>;

fn open(dir: &Path, format: TestFormat) -> Table {
    init_tracing();
    ImageTable::open_in(dir, format, TestHost, TestSink).expect("table should open")
}

fn fill(byte: u8) -> impl FnOnce(&mut [u8], u32) {
    move |pixels, _row_stride| pixels.fill(byte)
}

fn uuid(n: u8) -> Uuid {
    Uuid::from_bytes([n; 16])
}

/// A deterministic entity id derived from a loop index, for tests that need more distinct ids
/// than fit in a `u8` (e.g. filling an entire chunk's worth of entries).
fn entity_idx(n: u32) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[12..16].copy_from_slice(&n.to_be_bytes());
    Uuid::from_bytes(bytes)
}

/// A source id paired with [`entity_idx`], distinguished by a leading marker byte so the two
/// namespaces never collide.
fn source_idx(n: u32) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xFF;
    bytes[12..16].copy_from_slice(&n.to_be_bytes());
    Uuid::from_bytes(bytes)
}

#[test]
fn set_then_get_round_trips_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("roundtrip", 4, 4, 16));

    let (e1, s1) = (uuid(1), uuid(101));
    table.set(e1, s1, fill(0xAA)).unwrap();

    let image = table.get(e1, s1, false).expect("entry should be present");
    assert!(image.pixels().iter().all(|&b| b == 0xAA));
}

#[test]
fn second_set_for_same_entity_overwrites_pixels_and_keeps_slot() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("overwrite", 4, 4, 16));

    let (e1, s1) = (uuid(1), uuid(101));
    table.set(e1, s1, fill(0x11)).unwrap();
    table.set(e1, s1, fill(0x22)).unwrap();

    let image = table.get(e1, s1, false).expect("entry should still be present");
    assert!(image.pixels().iter().all(|&b| b == 0x22));
}

#[test]
fn delete_then_get_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("delete", 4, 4, 16));

    let (e1, s1) = (uuid(1), uuid(101));
    table.set(e1, s1, fill(0xFF)).unwrap();
    assert!(table.delete(e1));

    assert!(table.get(e1, s1, false).is_none());
    assert!(!table.entry_exists(e1, s1));
}

#[test]
fn source_id_mismatch_evicts_and_reports_miss() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("mismatch", 4, 4, 16));

    let e1 = uuid(1);
    let (s1, s2) = (uuid(101), uuid(102));

    table.set(e1, s1, fill(0x10)).unwrap();
    table.set(e1, s2, fill(0x20)).unwrap();

    // The slot now holds (e1, s2); asking for s1 is a stale request and deletes the slot.
    assert!(table.get(e1, s1, false).is_none());
    assert!(table.get(e1, s2, false).is_none());

    table.set(e1, s2, fill(0x30)).unwrap();
    let image = table.get(e1, s2, false).expect("fresh set should be retrievable");
    assert!(image.pixels().iter().all(|&b| b == 0x30));
}

#[test]
fn reset_clears_entries_and_truncates_file() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("reset", 4, 4, 16));

    table.set(uuid(1), uuid(101), fill(0x10)).unwrap();
    table.set(uuid(2), uuid(102), fill(0x20)).unwrap();

    table.reset().unwrap();

    assert!(!table.entry_exists(uuid(1), uuid(101)));
    assert!(!table.entry_exists(uuid(2), uuid(102)));
    assert_eq!(table.stats().entry_count, 0);
    assert_eq!(table.stats().occupied_count, 0);
}

#[test]
fn eviction_picks_oldest_not_in_use_entry_when_saturated() {
    let dir = tempfile::tempdir().unwrap();
    // maximum_count=1 is below entries_per_chunk, so it gets raised (spec §4.1) to whatever this
    // geometry's entries_per_chunk actually is; fill every slot that raised maximum allows.
    let table = open(dir.path(), TestFormat::rgba("eviction", 4, 4, 1));
    let max = table.layout().effective_maximum_count;

    for i in 0..max {
        table.set(entity_idx(i), source_idx(i), fill((i % 250 + 1) as u8)).unwrap();
    }
    assert_eq!(table.stats().occupied_count, u64::from(max));

    // MRU is [max-1, ..., 1, 0]; entity 0 is the oldest and not in use, so it's the victim.
    table.set(entity_idx(max), source_idx(max), fill(77)).unwrap();

    assert_eq!(table.stats().occupied_count, u64::from(max));
    assert!(table.get(entity_idx(0), source_idx(0), false).is_none());
    let image = table.get(entity_idx(max), source_idx(max), false).unwrap();
    assert!(image.pixels().iter().all(|&b| b == 77));
}

#[test]
fn in_use_entry_is_never_selected_as_eviction_victim() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("in-use", 4, 4, 1));
    let max = table.layout().effective_maximum_count;

    for i in 0..max {
        table.set(entity_idx(i), source_idx(i), fill((i % 250 + 1) as u8)).unwrap();
    }

    // Hold entity 0's image (the oldest, and otherwise the first eviction victim).
    let held = table.get(entity_idx(0), source_idx(0), false).expect("entity 0 should be present");

    // Force three more evictions; entity 0 must survive all of them since it's pinned in-use.
    table.set(entity_idx(max), source_idx(max), fill(201)).unwrap();
    table.set(entity_idx(max + 1), source_idx(max + 1), fill(202)).unwrap();
    table.set(entity_idx(max + 2), source_idx(max + 2), fill(203)).unwrap();

    assert!(held.pixels().iter().all(|&b| b == 1), "held entity's pixels must not be disturbed");
    drop(held);

    assert!(table.entry_exists(entity_idx(0), source_idx(0)), "pinned entity must survive eviction pressure");
}

#[test]
fn saturation_with_everything_in_use_reports_error_without_evicting() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("saturated", 4, 4, 1));
    let max = table.layout().effective_maximum_count;

    let mut held = Vec::new();
    for i in 0..max {
        table.set(entity_idx(i), source_idx(i), fill((i % 250 + 1) as u8)).unwrap();
        held.push(table.get(entity_idx(i), source_idx(i), false).unwrap());
    }
    assert_eq!(table.stats().occupied_count, u64::from(max));

    // Every occupied slot is pinned in-use; a new entity cannot evict anything and must not
    // silently overwrite a held slot (spec §8 "With all entries in use...").
    let result = table.set(entity_idx(max), source_idx(max), fill(99));
    assert!(matches!(result, Err(image_table::SetError::Saturated)));
    assert_eq!(table.stats().eviction_pressure_events, 1);

    for (i, image) in held.iter().enumerate() {
        assert!(image.pixels().iter().all(|&b| b == (i as u8 % 250 + 1)));
    }
}

#[test]
fn metadata_and_pixels_survive_reopen_with_identical_format() {
    let dir = tempfile::tempdir().unwrap();
    let format = TestFormat::rgba("reopen", 4, 4, 16);

    {
        let table = open(dir.path(), format);
        table.set(uuid(1), uuid(101), fill(0x41)).unwrap();
        table.set(uuid(2), uuid(102), fill(0x42)).unwrap();
        // Force a synchronous view of the metadata writer's output by dropping the table, which
        // joins its background thread and flushes whatever was last queued.
    }

    let table = open(dir.path(), format);
    let image1 = table.get(uuid(1), uuid(101), false).expect("entity 1 should survive reopen");
    let image2 = table.get(uuid(2), uuid(102), false).expect("entity 2 should survive reopen");
    assert!(image1.pixels().iter().all(|&b| b == 0x41));
    assert!(image2.pixels().iter().all(|&b| b == 0x42));
}

#[test]
fn reopen_with_changed_format_resets_the_table() {
    let dir = tempfile::tempdir().unwrap();

    {
        let table = open(dir.path(), TestFormat::rgba("fingerprint", 4, 4, 16));
        table.set(uuid(1), uuid(101), fill(0x55)).unwrap();
    }

    // Same name, different pixel geometry: the fingerprint changes, so the reopened table must
    // start empty rather than misinterpret the old bytes.
    let table = open(dir.path(), TestFormat::rgba("fingerprint", 8, 8, 16));
    assert!(table.get(uuid(1), uuid(101), false).is_none());
    assert_eq!(table.stats().occupied_count, 0);
}

#[test]
fn missing_metadata_file_opens_with_empty_index() {
    let dir = tempfile::tempdir().unwrap();
    let format = TestFormat::rgba("no-metadata", 4, 4, 16);

    {
        let table = open(dir.path(), format);
        table.set(uuid(1), uuid(101), fill(0x33)).unwrap();
    }

    let data_path = dir.path().join("no-metadata.imageTable");
    let metadata_path = data_path.with_extension("metadata");
    std::fs::remove_file(&metadata_path).unwrap();

    let table = open(dir.path(), format);
    assert_eq!(table.stats().occupied_count, 0);
    // The data file is untouched, but with no metadata there's no way to know entity 1 lived at
    // index 0, so it's unreachable until overwritten by a new `set`.
    assert!(table.get(uuid(1), uuid(101), false).is_none());
}

#[test]
fn missing_data_file_triggers_full_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let format = TestFormat::rgba("no-data", 4, 4, 16);

    {
        let table = open(dir.path(), format);
        table.set(uuid(1), uuid(101), fill(0x77)).unwrap();
    }

    let data_path = dir.path().join("no-data.imageTable");
    std::fs::remove_file(&data_path).unwrap();

    let table = open(dir.path(), format);
    assert_eq!(table.stats().occupied_count, 0);
    assert_eq!(table.stats().entry_count, 0);
}

#[test]
fn file_length_is_always_a_multiple_of_entry_length() {
    let dir = tempfile::tempdir().unwrap();
    let table = open(dir.path(), TestFormat::rgba("alignment", 4, 4, 1));

    for i in 1..=10u8 {
        table.set(uuid(i), uuid(100 + i), fill(i)).unwrap();
    }

    let data_path = dir.path().join("alignment.imageTable");
    let file_len = std::fs::metadata(&data_path).unwrap().len();
    assert_eq!(file_len % table.layout().entry_length, 0);
}
