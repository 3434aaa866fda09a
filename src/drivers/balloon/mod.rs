//! VMware memory balloon.
//!
//! The balloon reserves guest pages and locks them with the hypervisor, which
//! may then reclaim the host memory backing them. Once per polling cycle the
//! driver asks the hypervisor for the desired balloon size and inflates or
//! deflates toward it, throttled by adaptive allocation and release rates.

use alloc::boxed::Box;

use self::batch::BatchPage;
use self::monitor::{Backdoor, BalloonStatus, Capabilities, GuestType, Monitor};
use self::ops::{BalloonOps, BalloonState, BatchedOps, Ops};
use self::stats::{BalloonStats, BalloonStatusReport, PageStats};
use self::storage::BalloonStorage;
use super::Driver;
use crate::config::{
	LARGE_PAGE_RATIO, NOSLEEP_ALLOC_MAX, RATE_ALLOC_INC, RATE_ALLOC_MAX, RATE_ALLOC_MIN,
	RATE_FREE_INC, RATE_FREE_MAX, RATE_FREE_MIN, SLOW_PAGE_ALLOCATION_CYCLES,
};
use crate::mm::{PageSize, ReservedPageAllocator};
use crate::runtime_params::BalloonConfig;

mod batch;
pub mod monitor;
mod ops;
pub mod stats;
pub mod storage;

/// Balloon engine driving a [`Monitor`] toward the hypervisor's target.
pub struct Balloon {
	state: BalloonState,
	ops: Ops,
	guest_type: GuestType,
	supported: Capabilities,
	rate_alloc: u32,
	rate_free: u32,
	slow_page_allocation_cycles: u32,
}

impl Balloon {
	/// Creates an empty balloon. The channel is started on the first cycle.
	pub fn new(
		config: &BalloonConfig,
		backdoor: Box<dyn Backdoor + Send>,
		pages: Box<dyn ReservedPageAllocator + Send>,
	) -> Self {
		Self {
			state: BalloonState {
				monitor: Monitor::new(backdoor),
				pages,
				storage: BalloonStorage::new(),
				stats: PageStats::default(),
				n_pages: 0,
				target: 0,
			},
			ops: Ops::default(),
			guest_type: config.guest_type,
			supported: config.capabilities,
			rate_alloc: RATE_ALLOC_MAX,
			rate_free: RATE_FREE_MAX,
			slow_page_allocation_cycles: 0,
		}
	}

	/// Current size in small pages.
	pub fn n_pages(&self) -> u64 {
		self.state.n_pages
	}

	/// Last target reported by the hypervisor, in small pages.
	pub fn target(&self) -> u64 {
		self.state.target
	}

	pub fn rate_alloc(&self) -> u32 {
		self.rate_alloc
	}

	pub fn rate_free(&self) -> u32 {
		self.rate_free
	}

	pub fn slow_page_allocation_cycles(&self) -> u32 {
		self.slow_page_allocation_cycles
	}

	/// Capabilities negotiated by the last handshake.
	pub fn capabilities(&self) -> Capabilities {
		self.state.monitor.capabilities()
	}

	pub fn reset_required(&self) -> bool {
		self.state.monitor.reset_required()
	}

	pub fn is_batched(&self) -> bool {
		self.ops.is_batched()
	}

	/// Number of pages of the given size locked in the balloon.
	pub fn num_stored_pages(&self, size: PageSize) -> usize {
		self.state.storage.len(size)
	}

	pub fn stats(&self) -> BalloonStats {
		BalloonStats {
			monitor: *self.state.monitor.stats(),
			pages: self.state.stats,
		}
	}

	pub fn status(&self) -> BalloonStatusReport {
		BalloonStatusReport {
			target: self.state.target,
			current: self.state.n_pages,
			rate_nosleep_alloc: NOSLEEP_ALLOC_MAX,
			rate_alloc: self.rate_alloc,
			rate_free: self.rate_free,
			slow_page_allocation_cycles: self.slow_page_allocation_cycles,
			capabilities: self.capabilities(),
			chunks: PageSize::ALL.map(|size| self.state.storage.num_chunks(size)),
			stats: self.stats(),
		}
	}

	/// Runs one polling cycle.
	pub fn query_and_execute(&mut self) {
		self.state.stats.timer += 1;

		if self.state.monitor.reset_required() && self.reset().is_err() {
			return;
		}

		let limit = self.state.pages.page_limit();
		let target = match self.state.monitor.get_target(limit) {
			Ok(target) => target,
			Err(status) => {
				debug!("<balloon> Unable to get target: {status}");
				return;
			}
		};

		self.slow_page_allocation_cycles = self.slow_page_allocation_cycles.saturating_sub(1);
		self.adjust_size(target);
	}

	/// Drops every page and restarts the channel.
	fn reset(&mut self) -> Result<(), BalloonStatus> {
		self.state.release_all();
		self.ops.teardown(self.state.pages.as_mut());

		let capabilities = self.state.monitor.start(self.supported).inspect_err(|status| {
			error!("<balloon> Unable to start the balloon channel: {status}");
		})?;

		if capabilities.contains(Capabilities::BATCHED_CMDS) {
			let Some(batch) = BatchPage::new(self.state.pages.as_mut()) else {
				error!("<balloon> Unable to set up the batch page, falling back to single pages");
				// Leaves the reset pending, the next cycle negotiates again.
				if let Err(status) = self.state.monitor.start(Capabilities::empty()) {
					warn!("<balloon> Unable to restart the balloon channel: {status}");
				}
				return Err(BalloonStatus::Failure);
			};
			self.ops = Ops::from(BatchedOps::new(batch));
		}

		self.state.monitor.reset_done();

		if let Err(status) = self.state.monitor.guest_type(self.guest_type) {
			warn!("<balloon> Unable to report guest type: {status}");
		}

		infoheader!(" BALLOON INFORMATION ");
		infoentry!("Capabilities", "{:?}", self.capabilities());
		infoentry!("Batched requests", self.ops.is_batched());
		infoentry!("Guest type", "{:?}", self.guest_type);
		infofooter!();

		Ok(())
	}

	/// Inflates or deflates toward `target` small pages.
	pub fn adjust_size(&mut self, target: u64) {
		self.state.target = target;

		let n_pages = self.state.n_pages;
		if n_pages < target {
			self.inflate(target);
		} else if target == 0 || n_pages >= target + LARGE_PAGE_RATIO {
			self.deflate(target);
		}
	}

	fn large_pages_enabled(&self) -> bool {
		self.ops.is_batched()
			&& self
				.capabilities()
				.contains(Capabilities::BATCHED_2M_CMDS)
	}

	/// Locks the first `staged` staged pages. Returns whether inflating may continue.
	fn flush(&mut self, staged: &mut usize, size: PageSize) -> bool {
		if *staged == 0 {
			return true;
		}

		let result = self.ops.lock(&mut self.state, *staged, size);
		*staged = 0;
		result.is_ok() && !self.state.monitor.reset_required()
	}

	fn inflate(&mut self, target: u64) {
		let goal = target - self.state.n_pages;
		let rate_alloc = u64::from(self.rate_alloc);
		let nosleep_budget = if self.slow_page_allocation_cycles > 0 {
			goal.min(rate_alloc)
		} else {
			goal.min(u64::from(NOSLEEP_ALLOC_MAX))
		};
		let sleep_budget = goal.min(rate_alloc);

		debug!(
			"<balloon> Inflating by up to {nosleep_budget} pages, current {}, target {target}",
			self.state.n_pages
		);

		let mut size = if self.large_pages_enabled() {
			PageSize::Large
		} else {
			PageSize::Small
		};
		let mut can_sleep = false;
		let mut allocated = 0;
		let mut staged = 0;
		let mut failed = false;

		loop {
			let budget = if can_sleep {
				sleep_budget
			} else {
				nosleep_budget
			};
			if allocated >= budget {
				break;
			}

			if size == PageSize::Large && budget - allocated < LARGE_PAGE_RATIO {
				if !self.flush(&mut staged, size) {
					failed = true;
					break;
				}
				size = PageSize::Small;
			}

			let index = size.index();
			let Some(handle) = self.state.pages.alloc(size, can_sleep) else {
				failed = true;
				if can_sleep {
					self.state.stats.sleep_alloc_fail += 1;
				} else {
					self.state.stats.prim_alloc_fail[index] += 1;
				}

				match (size, can_sleep) {
					(PageSize::Large, _) => {
						trace!("<balloon> Large page allocation failed, using small pages");
						if !self.flush(&mut staged, size) {
							break;
						}
						size = PageSize::Small;
					}
					(PageSize::Small, false) => {
						self.slow_page_allocation_cycles = SLOW_PAGE_ALLOCATION_CYCLES;
						if allocated >= sleep_budget {
							break;
						}
						trace!("<balloon> Non-sleeping allocation failed, switching to sleeping");
						can_sleep = true;
					}
					(PageSize::Small, true) => {
						self.rate_alloc = (self.rate_alloc / 2).max(RATE_ALLOC_MIN);
						debug!(
							"<balloon> Sleeping allocation failed, rate lowered to {}",
							self.rate_alloc
						);
						break;
					}
				}
				continue;
			};

			if can_sleep {
				self.state.stats.sleep_alloc += 1;
			} else {
				self.state.stats.prim_alloc[index] += 1;
			}

			self.ops.add_page(&self.state, staged, handle);
			staged += 1;
			allocated += size.small_pages();

			if staged == self.ops.max_entries() && !self.flush(&mut staged, size) {
				failed = true;
				break;
			}
		}

		if !self.flush(&mut staged, size) {
			failed = true;
		}

		if !failed && allocated >= rate_alloc {
			let mult = (allocated / rate_alloc) as u32;
			self.rate_alloc = self
				.rate_alloc
				.saturating_add(mult.saturating_mul(RATE_ALLOC_INC))
				.min(RATE_ALLOC_MAX);
		}

		self.state.release_error_pages();
	}

	fn deflate(&mut self, target: u64) {
		for size in PageSize::ALL {
			let excess = self.state.n_pages.saturating_sub(target) / size.small_pages();
			let stored = self.state.storage.len(size) as u64;
			let budget = excess.min(u64::from(self.rate_free)).min(stored);
			if budget == 0 {
				continue;
			}

			debug!(
				"<balloon> Deflating {budget} {size:?} pages, current {}, target {target}",
				self.state.n_pages
			);

			let mut staged = 0;
			let mut freed = 0;
			while freed < budget {
				let Some(handle) = self.state.storage.pop(size) else {
					break;
				};
				self.ops.add_page(&self.state, staged, handle);
				staged += 1;
				freed += 1;

				if staged == self.ops.max_entries() || freed == budget {
					let result = self.ops.unlock(&mut self.state, staged, size);
					staged = 0;

					if result.is_err() {
						self.rate_free = (self.rate_free / 2).max(RATE_FREE_MIN);
						return;
					}
				}
			}

			if staged > 0 && self.ops.unlock(&mut self.state, staged, size).is_err() {
				self.rate_free = (self.rate_free / 2).max(RATE_FREE_MIN);
				return;
			}

			self.rate_free = (self.rate_free + RATE_FREE_INC).min(RATE_FREE_MAX);
		}
	}

	/// Restarts the channel and returns every page to the OS.
	///
	/// The restart comes first so the hypervisor no longer tracks the pages
	/// by the time the OS reuses them.
	pub fn cleanup(&mut self) {
		if let Err(status) = self.state.monitor.start(Capabilities::empty()) {
			warn!("<balloon> Unable to restart the balloon channel: {status}");
		}

		self.state.release_all();
		self.ops.teardown(self.state.pages.as_mut());
		info!("<balloon> Released all pages");
	}
}

impl Driver for Balloon {
	fn get_name(&self) -> &'static str {
		"vmmemctl"
	}
}
