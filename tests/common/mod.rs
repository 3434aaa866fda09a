//! Common code for integration tests.
//!
//! [`FakeHost`] plays the hypervisor side of the balloon protocol and
//! [`FakePages`] the page reservation of the guest OS. Both share the page
//! memory so the host can read and answer batch pages.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use vmmemctl::config::{LARGE_PAGE_RATIO, PAGE_SHIFT};
use vmmemctl::drivers::balloon::monitor::{
	Backdoor, BackdoorReply, BalloonCommand, BalloonStatus, Capabilities,
};
use vmmemctl::mm::{PageHandle, PageSize, PhysAddr, ReservedPageAllocator};
use vmmemctl::{Balloon, BalloonConfig};

const ENTRIES_PER_PAGE: usize = 512;

/// Guest physical memory as seen by both sides.
#[derive(Debug)]
pub struct PageMemory {
	next_ppn: u64,
	/// Reserved pages by page number.
	pub reserved: BTreeMap<u64, PageSize>,
	mapped: BTreeMap<u64, Box<[u64; ENTRIES_PER_PAGE]>>,
	pub fail_small: bool,
	pub fail_large: bool,
	pub fail_sleep: bool,
	pub allocs: u64,
	pub frees: u64,
	pub limit: u64,
}

impl Default for PageMemory {
	fn default() -> Self {
		Self {
			next_ppn: 1,
			reserved: BTreeMap::new(),
			mapped: BTreeMap::new(),
			fail_small: false,
			fail_large: false,
			fail_sleep: false,
			allocs: 0,
			frees: 0,
			limit: u64::MAX,
		}
	}
}

impl PageMemory {
	/// Reserved pages in small-page units.
	pub fn reserved_pages(&self) -> u64 {
		self.reserved.values().map(|size| size.small_pages()).sum()
	}
}

pub struct FakePages {
	memory: Arc<Mutex<PageMemory>>,
}

// SAFETY: Mappings are boxed page buffers that live until unmapped, handles
// are page numbers.
unsafe impl ReservedPageAllocator for FakePages {
	fn alloc(&mut self, size: PageSize, can_sleep: bool) -> Option<PageHandle> {
		let mut memory = self.memory.lock().unwrap();
		let fail = match (size, can_sleep) {
			(PageSize::Large, _) => memory.fail_large,
			(PageSize::Small, false) => memory.fail_small,
			(PageSize::Small, true) => memory.fail_sleep,
		};
		if fail {
			return None;
		}

		let ppn = match size {
			PageSize::Small => memory.next_ppn,
			PageSize::Large => memory.next_ppn.next_multiple_of(LARGE_PAGE_RATIO),
		};
		memory.next_ppn = ppn + size.small_pages();
		memory.reserved.insert(ppn, size);
		memory.allocs += 1;
		Some(PageHandle::new(ppn as usize))
	}

	fn free(&mut self, handle: PageHandle, size: PageSize) {
		let mut memory = self.memory.lock().unwrap();
		assert_eq!(memory.reserved.remove(&(handle.as_usize() as u64)), Some(size));
		memory.frees += 1;
	}

	fn phys_addr(&self, handle: PageHandle) -> PhysAddr {
		PhysAddr::new((handle.as_usize() as u64) << PAGE_SHIFT)
	}

	fn handle_from_phys(&self, addr: PhysAddr) -> PageHandle {
		PageHandle::new((addr.as_u64() >> PAGE_SHIFT) as usize)
	}

	fn map(&mut self, handle: PageHandle) -> Option<NonNull<u64>> {
		let mut memory = self.memory.lock().unwrap();
		let page = memory
			.mapped
			.entry(handle.as_usize() as u64)
			.or_insert_with(|| Box::new([0; ENTRIES_PER_PAGE]));
		NonNull::new(page.as_mut_ptr())
	}

	fn unmap(&mut self, mapping: NonNull<u64>) {
		let mut memory = self.memory.lock().unwrap();
		memory
			.mapped
			.retain(|_, page| page.as_mut_ptr() != mapping.as_ptr());
	}

	fn page_limit(&self) -> u64 {
		self.memory.lock().unwrap().limit
	}
}

/// Hypervisor side of the balloon protocol.
#[derive(Debug, Default)]
pub struct HostState {
	/// Balloon size requested by the host.
	pub target: u64,
	/// Capabilities the host supports. `None` answers the handshake like a
	/// host that predates capability negotiation.
	pub offered: Option<Capabilities>,
	/// Locked page numbers with their size in small pages.
	pub locked: BTreeMap<u64, u64>,
	/// Answer the next get-target request with a reset.
	pub reset_once: bool,
	/// Number of upcoming page locks to refuse.
	pub refuse_locks: usize,
	/// Status of refused page locks, `ERROR_PPN_PINNED` if unset.
	pub refusal: Option<BalloonStatus>,
	/// Command answered with `ERROR_BUSY` as a whole.
	pub busy: Option<BalloonCommand>,
	pub fail_unlock: bool,
	pub commands: Vec<BalloonCommand>,
	pub last_limit: u64,
}

impl HostState {
	pub fn locked_pages(&self) -> u64 {
		self.locked.values().sum()
	}

	pub fn count(&self, cmd: BalloonCommand) -> usize {
		self.commands.iter().filter(|&&c| c == cmd).count()
	}
}

pub struct FakeHost {
	state: Arc<Mutex<HostState>>,
	memory: Arc<Mutex<PageMemory>>,
}

fn reply(status: BalloonStatus, result: u64) -> BackdoorReply {
	BackdoorReply {
		status: u64::from(i32::from(status) as u32),
		result,
		capabilities: 0,
	}
}

impl FakeHost {
	fn lock_one(state: &mut HostState, ppn: u64, weight: u64) -> BalloonStatus {
		if state.refuse_locks > 0 {
			state.refuse_locks -= 1;
			return state.refusal.unwrap_or(BalloonStatus::ErrorPpnPinned);
		}
		state.locked.insert(ppn, weight);
		BalloonStatus::Success
	}

	fn unlock_one(state: &mut HostState, ppn: u64) -> BalloonStatus {
		match state.locked.remove(&ppn) {
			Some(_) => BalloonStatus::Success,
			None => BalloonStatus::ErrorPpnUnlocked,
		}
	}

	fn batched(&self, state: &mut HostState, lock: bool, batch_ppn: u64, num: u64, weight: u64) -> BackdoorReply {
		if !lock && state.fail_unlock {
			return reply(BalloonStatus::Failure, 0);
		}

		let mut memory = self.memory.lock().unwrap();
		let Some(page) = memory.mapped.get_mut(&batch_ppn) else {
			return reply(BalloonStatus::ErrorPpnInvalid, 0);
		};

		for entry in page.iter_mut().take(num as usize) {
			let ppn = *entry >> PAGE_SHIFT;
			let status = if lock {
				Self::lock_one(state, ppn, weight)
			} else {
				Self::unlock_one(state, ppn)
			};
			*entry |= u64::from(i32::from(status) as u32 & 0x1f);
		}

		reply(BalloonStatus::Success, state.target)
	}
}

impl Backdoor for FakeHost {
	fn call(&mut self, cmd: BalloonCommand, arg1: u64, arg2: u64) -> BackdoorReply {
		let mut state = self.state.lock().unwrap();
		state.commands.push(cmd);
		if state.busy == Some(cmd) {
			return reply(BalloonStatus::ErrorBusy, 0);
		}

		match cmd {
			BalloonCommand::Start => {
				state.locked.clear();
				match state.offered {
					None => reply(BalloonStatus::Success, 0),
					Some(offered) => BackdoorReply {
						capabilities: u64::from(offered.bits()),
						..reply(BalloonStatus::SuccessWithCapabilities, 0)
					},
				}
			}
			BalloonCommand::GetTarget => {
				state.last_limit = arg1;
				if state.reset_once {
					state.reset_once = false;
					return reply(BalloonStatus::ErrorReset, 0);
				}
				reply(BalloonStatus::Success, state.target)
			}
			BalloonCommand::GuestId => reply(BalloonStatus::Success, 0),
			BalloonCommand::Lock => {
				let status = Self::lock_one(&mut state, arg1, 1);
				reply(status, state.target)
			}
			BalloonCommand::Unlock => {
				if state.fail_unlock {
					return reply(BalloonStatus::Failure, 0);
				}
				let status = Self::unlock_one(&mut state, arg1);
				reply(status, state.target)
			}
			BalloonCommand::BatchedLock => self.batched(&mut state, true, arg1, arg2, 1),
			BalloonCommand::BatchedUnlock => self.batched(&mut state, false, arg1, arg2, 1),
			BalloonCommand::Batched2mLock => {
				self.batched(&mut state, true, arg1, arg2, LARGE_PAGE_RATIO)
			}
			BalloonCommand::Batched2mUnlock => {
				self.batched(&mut state, false, arg1, arg2, LARGE_PAGE_RATIO)
			}
			BalloonCommand::VmciDoorbellSet => reply(BalloonStatus::ErrorCmdInvalid, 0),
		}
	}
}

/// Handles to inspect and steer the fakes behind a balloon.
#[derive(Clone)]
pub struct Harness {
	host: Arc<Mutex<HostState>>,
	memory: Arc<Mutex<PageMemory>>,
}

impl Harness {
	pub fn host(&self) -> MutexGuard<'_, HostState> {
		self.host.lock().unwrap()
	}

	pub fn memory(&self) -> MutexGuard<'_, PageMemory> {
		self.memory.lock().unwrap()
	}

	pub fn set_target(&self, target: u64) {
		self.host().target = target;
	}
}

/// Creates a balloon talking to a host that offers `offered`.
pub fn setup(offered: Option<Capabilities>) -> (Balloon, Harness) {
	setup_with_config(offered, &BalloonConfig::default())
}

pub fn setup_with_config(offered: Option<Capabilities>, config: &BalloonConfig) -> (Balloon, Harness) {
	let harness = Harness {
		host: Arc::new(Mutex::new(HostState {
			offered,
			..HostState::default()
		})),
		memory: Arc::new(Mutex::new(PageMemory::default())),
	};

	let host = FakeHost {
		state: harness.host.clone(),
		memory: harness.memory.clone(),
	};
	let pages = FakePages {
		memory: harness.memory.clone(),
	};

	let balloon = Balloon::new(config, Box::new(host), Box::new(pages));
	(balloon, harness)
}

/// Capabilities of a host that supports small page batching.
pub fn batched() -> Option<Capabilities> {
	Some(Capabilities::BASIC_CMDS | Capabilities::BATCHED_CMDS)
}

/// Capabilities of a host that supports everything.
pub fn all() -> Option<Capabilities> {
	Some(
		Capabilities::BASIC_CMDS
			| Capabilities::BATCHED_CMDS
			| Capabilities::BATCHED_2M_CMDS
			| Capabilities::SIGNALED_WAKEUP
			| Capabilities::BALLOON_64_BIT_TARGET,
	)
}

/// Checks that the balloon, the host, and the stored pages agree on the size.
pub fn assert_accounting(balloon: &Balloon, harness: &Harness) {
	let small = balloon.num_stored_pages(PageSize::Small) as u64;
	let large = balloon.num_stored_pages(PageSize::Large) as u64;

	assert_eq!(balloon.n_pages(), small + LARGE_PAGE_RATIO * large);
	assert_eq!(balloon.n_pages(), harness.host().locked_pages());

	let batch_page = u64::from(balloon.is_batched());
	assert_eq!(harness.memory().reserved_pages(), balloon.n_pages() + batch_page);
}
