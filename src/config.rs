use core::time::Duration;

/// Shift of a small (base) page.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a small (base) page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Order of a large (2 MiB) page in small pages.
pub const LARGE_PAGE_ORDER: u32 = 9;

/// Number of small pages covered by one large page.
pub const LARGE_PAGE_RATIO: u64 = 1 << LARGE_PAGE_ORDER;

/// Lower bound of pages allocated per cycle once the guest is under pressure.
pub const RATE_ALLOC_MIN: u32 = 512;

/// Upper bound of pages allocated per cycle with sleeping allocations.
pub const RATE_ALLOC_MAX: u32 = 2048;

/// Step by which the allocation rate grows after an undisturbed cycle.
pub const RATE_ALLOC_INC: u32 = 16;

/// Lower bound of pages released per cycle.
pub const RATE_FREE_MIN: u32 = 512;

/// Upper bound of pages released per cycle.
pub const RATE_FREE_MAX: u32 = 16384;

/// Step by which the release rate grows after a successful cycle.
pub const RATE_FREE_INC: u32 = 16;

/// Non-sleeping allocations are throttled to this many pages per cycle even
/// when the guest shows no sign of memory pressure.
pub const NOSLEEP_ALLOC_MAX: u32 = 16384;

/// Number of polling cycles in which allocations stay at the sleeping rate
/// after a non-sleeping allocation failed.
pub const SLOW_PAGE_ALLOCATION_CYCLES: u32 = 4;

/// Number of page handles held by one storage chunk.
pub const CHUNK_PAGES: usize = 1000;

/// Number of refused pages quarantined per size class and cycle.
pub const ERROR_PAGES: usize = 16;

/// Default period of the balloon polling task.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
