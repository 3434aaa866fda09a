//! Lock and unlock strategies selected at reset time.

use alloc::boxed::Box;

use enum_dispatch::enum_dispatch;

use super::batch::BatchPage;
use super::monitor::{BalloonStatus, Monitor};
use super::stats::PageStats;
use super::storage::BalloonStorage;
use crate::mm::{PageHandle, PageSize, ReservedPageAllocator, ppn};

/// Everything a lock or unlock request touches.
pub(crate) struct BalloonState {
	pub monitor: Monitor,
	pub pages: Box<dyn ReservedPageAllocator + Send>,
	pub storage: BalloonStorage,
	pub stats: PageStats,
	/// Current size in small pages.
	pub n_pages: u64,
	/// Desired size in small pages, as last reported by the hypervisor.
	pub target: u64,
}

impl BalloonState {
	/// Returns a page to the OS.
	pub fn release(&mut self, size: PageSize, handle: PageHandle) {
		self.pages.free(handle, size);
		self.stats.prim_free[size.index()] += 1;
	}

	/// Records a page the hypervisor locked.
	fn accept(&mut self, size: PageSize, handle: PageHandle) {
		match self.storage.push(size, handle) {
			Ok(()) => self.n_pages += size.small_pages(),
			Err(err) => {
				error!("<balloon> {err}, returning locked page {handle:?}");
				self.release(size, handle);
			}
		}
	}

	/// Handles a page the hypervisor refused to lock.
	fn refuse(&mut self, size: PageSize, handle: PageHandle, status: BalloonStatus) {
		self.stats.refused_alloc[size.index()] += 1;
		trace!("<balloon> Lock of {handle:?} refused: {status}");

		match status {
			BalloonStatus::ErrorReset | BalloonStatus::ErrorPpnNotNeeded => {
				self.release(size, handle);
			}
			_ => {
				if let Err(handle) = self.storage.quarantine(size, handle) {
					debug!("<balloon> Error page list full, releasing {handle:?}");
					self.release(size, handle);
				}
			}
		}
	}

	/// Returns a page the hypervisor gave back to the OS.
	fn unlocked(&mut self, size: PageSize, handle: PageHandle) {
		self.release(size, handle);
		self.n_pages -= size.small_pages();
	}

	/// Puts a page the hypervisor kept back into storage.
	fn restore(&mut self, size: PageSize, handle: PageHandle) {
		self.stats.refused_free[size.index()] += 1;
		if let Err(err) = self.storage.push(size, handle) {
			error!("<balloon> {err}, dropping track of locked page {handle:?}");
			self.unlocked(size, handle);
		}
	}

	/// Releases every page held, without telling the hypervisor.
	pub fn release_all(&mut self) {
		for size in PageSize::ALL {
			while let Some(handle) = self.storage.pop(size) {
				self.release(size, handle);
			}
		}
		self.release_error_pages();
		self.storage.release_spare();
		self.n_pages = 0;
	}

	/// Ends the quarantine of pages refused this cycle.
	pub fn release_error_pages(&mut self) {
		for size in PageSize::ALL {
			while let Some(handle) = self.storage.pop_error_page(size) {
				self.stats.error_free[size.index()] += 1;
				self.release(size, handle);
			}
		}
	}
}

/// Lock and unlock requests of one protocol flavor.
///
/// Pages are first staged with [`BalloonOps::add_page`] at consecutive
/// indices starting at zero and then handed to the hypervisor together.
#[enum_dispatch]
pub(crate) trait BalloonOps {
	/// Maximum number of pages staged per request.
	fn max_entries(&self) -> usize;

	fn add_page(&mut self, state: &BalloonState, index: usize, handle: PageHandle);

	/// Locks the staged pages. Refused pages end up quarantined or released.
	///
	/// An error means the request as a whole failed, or the hypervisor needs
	/// no more pages, and the cycle should stop.
	fn lock(
		&mut self,
		state: &mut BalloonState,
		num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus>;

	/// Unlocks the staged pages. Pages the hypervisor keeps go back into storage.
	fn unlock(
		&mut self,
		state: &mut BalloonState,
		num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus>;
}

#[enum_dispatch(BalloonOps)]
pub(crate) enum Ops {
	Single(SinglePageOps),
	Batched(BatchedOps),
}

impl Ops {
	pub fn is_batched(&self) -> bool {
		matches!(self, Ops::Batched(_))
	}

	/// Gives back the batch page, if any, and falls back to single page requests.
	pub fn teardown(&mut self, pages: &mut dyn ReservedPageAllocator) {
		if let Ops::Batched(ops) = core::mem::take(self) {
			ops.batch.release(pages);
		}
	}
}

impl Default for Ops {
	fn default() -> Self {
		Ops::Single(SinglePageOps::default())
	}
}

/// One hypercall per small page.
#[derive(Default)]
pub(crate) struct SinglePageOps {
	staged: Option<PageHandle>,
}

impl BalloonOps for SinglePageOps {
	fn max_entries(&self) -> usize {
		1
	}

	fn add_page(&mut self, _state: &BalloonState, index: usize, handle: PageHandle) {
		debug_assert_eq!(index, 0);
		self.staged = Some(handle);
	}

	fn lock(
		&mut self,
		state: &mut BalloonState,
		num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus> {
		debug_assert_eq!(size, PageSize::Small);
		let Some(handle) = self.staged.take() else {
			return Ok(());
		};
		debug_assert_eq!(num_pages, 1);

		if let Err(err) = state.storage.reserve(size, 1) {
			error!("<balloon> {err}");
			state.release(size, handle);
			return Err(BalloonStatus::Failure);
		}

		let ppn = ppn(state.pages.phys_addr(handle));
		match state.monitor.lock_page(ppn) {
			Ok(target) => {
				state.target = target;
				state.accept(size, handle);
				Ok(())
			}
			Err(status @ (BalloonStatus::ErrorReset | BalloonStatus::ErrorPpnNotNeeded)) => {
				state.refuse(size, handle, status);
				Err(status)
			}
			Err(status) => {
				state.refuse(size, handle, status);
				Ok(())
			}
		}
	}

	fn unlock(
		&mut self,
		state: &mut BalloonState,
		_num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus> {
		let Some(handle) = self.staged.take() else {
			return Ok(());
		};

		let ppn = ppn(state.pages.phys_addr(handle));
		match state.monitor.unlock_page(ppn) {
			Ok(target) => {
				state.target = target;
				state.unlocked(size, handle);
				Ok(())
			}
			Err(status) => {
				warn!("<balloon> Unlock of {handle:?} failed: {status}");
				state.restore(size, handle);
				Err(status)
			}
		}
	}
}

/// Many pages per hypercall through a shared [`BatchPage`].
pub(crate) struct BatchedOps {
	batch: BatchPage,
}

impl BatchedOps {
	pub fn new(batch: BatchPage) -> Self {
		Self { batch }
	}

	fn staged(&self, state: &BalloonState, index: usize) -> PageHandle {
		state.pages.handle_from_phys(self.batch.entry_addr(index))
	}
}

impl BalloonOps for BatchedOps {
	fn max_entries(&self) -> usize {
		BatchPage::MAX_ENTRIES
	}

	fn add_page(&mut self, state: &BalloonState, index: usize, handle: PageHandle) {
		self.batch.set_entry(index, state.pages.phys_addr(handle));
	}

	fn lock(
		&mut self,
		state: &mut BalloonState,
		num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus> {
		if let Err(err) = state.storage.reserve(size, num_pages) {
			error!("<balloon> {err}");
			for index in 0..num_pages {
				let handle = self.staged(state, index);
				state.release(size, handle);
			}
			return Err(BalloonStatus::Failure);
		}

		match state
			.monitor
			.lock_batched(self.batch.ppn(), num_pages, size)
		{
			Ok(target) => state.target = target,
			Err(status) => {
				warn!("<balloon> Batched lock of {num_pages} pages failed: {status}");
				for index in 0..num_pages {
					let handle = self.staged(state, index);
					state.release(size, handle);
				}
				return Err(status);
			}
		}

		let mut not_needed = false;
		for index in 0..num_pages {
			let handle = self.staged(state, index);
			match self.batch.entry_status(index) {
				BalloonStatus::Success => state.accept(size, handle),
				status => {
					not_needed |= status == BalloonStatus::ErrorPpnNotNeeded;
					state.refuse(size, handle, status);
				}
			}
		}

		if not_needed {
			return Err(BalloonStatus::ErrorPpnNotNeeded);
		}
		Ok(())
	}

	fn unlock(
		&mut self,
		state: &mut BalloonState,
		num_pages: usize,
		size: PageSize,
	) -> Result<(), BalloonStatus> {
		let result = state
			.monitor
			.unlock_batched(self.batch.ppn(), num_pages, size);

		if let Err(status) = result {
			warn!("<balloon> Batched unlock of {num_pages} pages failed: {status}");
			for index in 0..num_pages {
				let handle = self.staged(state, index);
				state.restore(size, handle);
			}
			return Err(status);
		}

		for index in 0..num_pages {
			let handle = self.staged(state, index);
			match self.batch.entry_status(index) {
				BalloonStatus::Success => state.unlocked(size, handle),
				status => {
					trace!("<balloon> Unlock of {handle:?} refused: {status}");
					state.restore(size, handle);
				}
			}
		}
		result.map(|target| state.target = target)
	}
}
