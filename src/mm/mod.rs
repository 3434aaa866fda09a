//! Page reservation interface of the embedding kernel.

pub mod reserved_page;

pub use self::reserved_page::{PageHandle, PageSize, PhysAddr, ReservedPageAllocator, ppn};
