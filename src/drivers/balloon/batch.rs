//! Shared page for batched lock and unlock requests.
//!
//! Each 64-bit entry carries the page-aligned physical address of a balloon
//! page. The hypervisor reports the outcome for that page in the low bits.

use core::ptr::NonNull;

use align_address::Align;
use bit_field::BitField;
use num_enum::FromPrimitive;
use volatile::VolatilePtr;

use super::monitor::BalloonStatus;
use crate::config::PAGE_SIZE;
use crate::mm::{PageHandle, PageSize, PhysAddr, ReservedPageAllocator, ppn};

/// Bits of an entry holding the per-page status.
const STATUS_BITS: core::ops::Range<usize> = 0..5;

pub(crate) struct BatchPage {
	handle: PageHandle,
	mapping: NonNull<u64>,
	ppn: u64,
}

// SAFETY: The mapping is owned exclusively by this batch page and only
// accessed through `&mut self` or `&self` of the owning balloon.
unsafe impl Send for BatchPage {}

impl BatchPage {
	/// Number of entries that fit into the page.
	pub const MAX_ENTRIES: usize = (PAGE_SIZE / 8) as usize;

	/// Reserves and maps the batch page.
	pub fn new(pages: &mut dyn ReservedPageAllocator) -> Option<Self> {
		let handle = pages.alloc(PageSize::Small, true)?;
		let Some(mapping) = pages.map(handle) else {
			pages.free(handle, PageSize::Small);
			return None;
		};
		let ppn = ppn(pages.phys_addr(handle));

		Some(Self {
			handle,
			mapping,
			ppn,
		})
	}

	/// Unmaps and returns the page to the OS.
	pub fn release(self, pages: &mut dyn ReservedPageAllocator) {
		pages.unmap(self.mapping);
		pages.free(self.handle, PageSize::Small);
	}

	/// Page number passed to the batched commands.
	pub fn ppn(&self) -> u64 {
		self.ppn
	}

	fn entry(&self, index: usize) -> VolatilePtr<'_, u64> {
		assert!(index < Self::MAX_ENTRIES);
		// SAFETY: The mapping covers `MAX_ENTRIES` aligned entries and stays
		// valid until `release`.
		unsafe { VolatilePtr::new(self.mapping.add(index)) }
	}

	/// Stores `addr` with a cleared status.
	pub fn set_entry(&mut self, index: usize, addr: PhysAddr) {
		self.entry(index).write(addr.as_u64().align_down(PAGE_SIZE));
	}

	pub fn entry_addr(&self, index: usize) -> PhysAddr {
		PhysAddr::new(self.entry(index).read().align_down(PAGE_SIZE))
	}

	pub fn entry_status(&self, index: usize) -> BalloonStatus {
		let status = self.entry(index).read().get_bits(STATUS_BITS);
		BalloonStatus::from_primitive(status as i32)
	}
}
