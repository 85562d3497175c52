//! Small helpers shared across the table. Mirrors the teacher crate's own `util` module: a grab
//! bag of alignment/conversion helpers with no state of their own, plus the process-wide globals
//! that are computed once and never mutated (Design Note: "Global directory and page size").

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Round `value` up to the next multiple of `align` (`align` must be a power of two).
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
    (value + (align - 1)) & !(align - 1)
}

static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

/// The OS page size, queried once and cached for the remainder of the process lifetime.
#[cfg(unix)]
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions and never fails in practice
        // on a POSIX system; a negative return is treated as "unknown" and falls back to 4 KiB.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 {
            raw as u64
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| 4096)
}

/// Per-process cache subdirectory the table's two files live under. Set once via
/// [`set_cache_dir`]; if never set, defaults to the platform temp dir joined with
/// `image-table-cache`.
static CACHE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Configure the cache directory. Must be called, if at all, before the first [`cache_dir`]
/// call; later calls are no-ops (consistent with the Design Note that this is process-wide
/// configuration computed once at first use, never mutated after init).
pub fn set_cache_dir(dir: impl Into<PathBuf>) {
    let _ = CACHE_DIR.set(dir.into());
}

/// The per-process cache subdirectory.
pub fn cache_dir() -> &'static Path {
    CACHE_DIR.get_or_init(|| std::env::temp_dir().join("image-table-cache"))
}
