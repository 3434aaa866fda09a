use core::ptr::NonNull;

pub use memory_addresses::PhysAddr;

use crate::config::{LARGE_PAGE_RATIO, PAGE_SHIFT};

/// Opaque handle of a page reserved from the guest OS.
///
/// The balloon never dereferences a handle, it only hands it back to the
/// [`ReservedPageAllocator`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle(usize);

impl PageHandle {
	pub const fn new(raw: usize) -> Self {
		Self(raw)
	}

	pub const fn as_usize(self) -> usize {
		self.0
	}
}

/// Size class of a balloon page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSize {
	/// A base page of [`PAGE_SIZE`](crate::config::PAGE_SIZE) bytes.
	Small,
	/// A 2 MiB page, worth [`LARGE_PAGE_RATIO`] small pages.
	Large,
}

impl PageSize {
	/// Size classes in the order the balloon releases them.
	pub const ALL: [PageSize; 2] = [PageSize::Small, PageSize::Large];

	/// Index of this size class in per-size tables.
	pub const fn index(self) -> usize {
		match self {
			PageSize::Small => 0,
			PageSize::Large => 1,
		}
	}

	/// Number of small pages this page accounts for.
	pub const fn small_pages(self) -> u64 {
		match self {
			PageSize::Small => 1,
			PageSize::Large => LARGE_PAGE_RATIO,
		}
	}
}

/// Physical page number of `addr` as used on the hypercall interface.
pub fn ppn(addr: PhysAddr) -> u64 {
	addr.as_u64() >> PAGE_SHIFT
}

/// Page reservation primitives of the guest OS.
///
/// # Safety
///
/// - A mapping returned by [`Self::map`] must be valid for volatile reads and
///   writes of [`PAGE_SIZE`](crate::config::PAGE_SIZE) bytes, aligned to 8 bytes, until it is passed to
///   [`Self::unmap`].
/// - [`Self::phys_addr`] must return the page aligned physical address of the
///   page behind `handle`, and [`Self::handle_from_phys`] must be its inverse.
pub unsafe trait ReservedPageAllocator {
	/// Reserves one page of the given size. Returns `None` if the OS is out of
	/// such pages. Only sleeping allocations may block.
	fn alloc(&mut self, size: PageSize, can_sleep: bool) -> Option<PageHandle>;

	/// Returns a page previously reserved through [`Self::alloc`].
	fn free(&mut self, handle: PageHandle, size: PageSize);

	fn phys_addr(&self, handle: PageHandle) -> PhysAddr;

	fn handle_from_phys(&self, addr: PhysAddr) -> PageHandle;

	/// Maps a small page into kernel address space.
	fn map(&mut self, handle: PageHandle) -> Option<NonNull<u64>>;

	fn unmap(&mut self, mapping: NonNull<u64>);

	/// Maximum number of small pages the balloon may ever hold.
	fn page_limit(&self) -> u64;
}
