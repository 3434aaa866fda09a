use core::fmt;

use super::monitor::Capabilities;

/// Counters of the hypercalls issued by the [`Monitor`](super::monitor::Monitor).
///
/// Per-size counters are indexed by [`PageSize::index`](crate::mm::PageSize::index).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorStats {
	pub start: u64,
	pub start_fail: u64,
	pub guest_type: u64,
	pub guest_type_fail: u64,
	pub target: u64,
	pub target_fail: u64,
	pub lock: [u64; 2],
	pub lock_fail: [u64; 2],
	pub unlock: [u64; 2],
	pub unlock_fail: [u64; 2],
}

/// Counters of the page primitives used by the balloon engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
	/// Polling cycles run.
	pub timer: u64,
	/// Non-sleeping allocations.
	pub prim_alloc: [u64; 2],
	pub prim_alloc_fail: [u64; 2],
	/// Sleeping allocations, small pages only.
	pub sleep_alloc: u64,
	pub sleep_alloc_fail: u64,
	pub prim_free: [u64; 2],
	/// Pages the hypervisor refused to lock.
	pub refused_alloc: [u64; 2],
	/// Pages the hypervisor refused to unlock.
	pub refused_free: [u64; 2],
	/// Quarantined pages released at the end of a cycle.
	pub error_free: [u64; 2],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalloonStats {
	pub monitor: MonitorStats,
	pub pages: PageStats,
}

/// Snapshot of the balloon, rendered in the classic `/proc/vmmemctl` layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalloonStatusReport {
	pub target: u64,
	pub current: u64,
	pub rate_nosleep_alloc: u32,
	pub rate_alloc: u32,
	pub rate_free: u32,
	pub slow_page_allocation_cycles: u32,
	pub capabilities: Capabilities,
	pub chunks: [usize; 2],
	pub stats: BalloonStats,
}

impl fmt::Display for BalloonStatusReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let monitor = &self.stats.monitor;
		let pages = &self.stats.pages;

		writeln!(f, "target:             {:8} pages", self.target)?;
		writeln!(f, "current:            {:8} pages", self.current)?;
		writeln!(f)?;
		writeln!(f, "rateNoSleepAlloc:   {:8} pages/sec", self.rate_nosleep_alloc)?;
		writeln!(f, "rateSleepAlloc:     {:8} pages/sec", self.rate_alloc)?;
		writeln!(f, "rateFree:           {:8} pages/sec", self.rate_free)?;
		writeln!(f, "slowAllocCycles:    {:8}", self.slow_page_allocation_cycles)?;
		writeln!(f, "capabilities:       {:#8x}", self.capabilities.bits())?;
		writeln!(f, "chunks4K:           {:8}", self.chunks[0])?;
		writeln!(f, "chunks2M:           {:8}", self.chunks[1])?;
		writeln!(f)?;
		writeln!(f, "timer:              {:8}", pages.timer)?;
		failed(f, "start:", monitor.start, monitor.start_fail)?;
		failed(f, "guestType:", monitor.guest_type, monitor.guest_type_fail)?;
		failed(f, "lock4K:", monitor.lock[0], monitor.lock_fail[0])?;
		failed(f, "lock2M:", monitor.lock[1], monitor.lock_fail[1])?;
		failed(f, "unlock4K:", monitor.unlock[0], monitor.unlock_fail[0])?;
		failed(f, "unlock2M:", monitor.unlock[1], monitor.unlock_fail[1])?;
		failed(f, "target:", monitor.target, monitor.target_fail)?;
		failed(
			f,
			"primNoSleepAlloc4K:",
			pages.prim_alloc[0],
			pages.prim_alloc_fail[0],
		)?;
		failed(
			f,
			"primNoSleepAlloc2M:",
			pages.prim_alloc[1],
			pages.prim_alloc_fail[1],
		)?;
		failed(
			f,
			"primCanSleepAlloc:",
			pages.sleep_alloc,
			pages.sleep_alloc_fail,
		)?;
		writeln!(f, "primFree4K:         {:8}", pages.prim_free[0])?;
		writeln!(f, "primFree2M:         {:8}", pages.prim_free[1])?;
		writeln!(f, "errAlloc4K:         {:8}", pages.refused_alloc[0])?;
		writeln!(f, "errAlloc2M:         {:8}", pages.refused_alloc[1])?;
		writeln!(f, "errFree4K:          {:8}", pages.refused_free[0])?;
		writeln!(f, "errFree2M:          {:8}", pages.refused_free[1])
	}
}

fn failed(f: &mut fmt::Formatter<'_>, name: &str, total: u64, fail: u64) -> fmt::Result {
	writeln!(f, "{name:20}{total:8} ({fail:4} failed)")
}
