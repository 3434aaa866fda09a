//! Balloon hypercall protocol.
//!
//! Every call issues exactly one backdoor hypercall. The register layout is
//! fixed by the hypervisor: `eax` carries [`BALLOON_BDOOR_MAGIC`], `ecx` the
//! command, `edx` [`BALLOON_BDOOR_PORT`], `ebx` the first and `esi` the second
//! argument. The reply carries the status in `eax`, the result in `ebx`, and
//! the negotiated capabilities in `ecx` (start only).

use alloc::boxed::Box;

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use super::stats::MonitorStats;
use crate::mm::PageSize;

pub const BALLOON_BDOOR_MAGIC: u32 = 0x456c_6d6f;
pub const BALLOON_BDOOR_PORT: u16 = 0x5670;

/// Hypercall command codes.
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BalloonCommand {
	Start = 0,
	GetTarget = 1,
	Lock = 2,
	Unlock = 3,
	GuestId = 4,
	// 5 is reserved
	BatchedLock = 6,
	BatchedUnlock = 7,
	Batched2mLock = 8,
	Batched2mUnlock = 9,
	VmciDoorbellSet = 10,
}

/// Status codes reported by the hypervisor.
///
/// Codes the driver does not know are treated as [`BalloonStatus::Failure`].
#[derive(Error, FromPrimitive, IntoPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum BalloonStatus {
	#[error("Success")]
	Success = 0,

	#[num_enum(default)]
	#[error("Generic failure")]
	Failure = -1,

	#[error("Invalid command")]
	ErrorCmdInvalid = 1,

	#[error("Invalid physical page number")]
	ErrorPpnInvalid = 2,

	#[error("Page is already locked")]
	ErrorPpnLocked = 3,

	#[error("Page is already unlocked")]
	ErrorPpnUnlocked = 4,

	#[error("Page is pinned")]
	ErrorPpnPinned = 5,

	#[error("Page is not needed")]
	ErrorPpnNotNeeded = 6,

	#[error("Protocol reset required")]
	ErrorReset = 7,

	#[error("Hypervisor is busy")]
	ErrorBusy = 8,

	#[error("Success, capabilities attached")]
	SuccessWithCapabilities = 0x0300_0000,
}

impl BalloonStatus {
	/// Decodes the status word of a hypercall reply.
	pub fn from_reply(word: u64) -> Self {
		// The status travels in `eax`, the upper half of `rax` is not part of it.
		Self::from_primitive(word as u32 as i32)
	}
}

bitflags! {
	/// Optional protocol features, negotiated by [`Monitor::start`].
	///
	/// Bit 0 is never used so that a capability mask cannot be mistaken for
	/// the protocol version sent by legacy drivers.
	#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
	pub struct Capabilities: u32 {
		const BASIC_CMDS = 1 << 1;
		const BATCHED_CMDS = 1 << 2;
		const BATCHED_2M_CMDS = 1 << 3;
		const SIGNALED_WAKEUP = 1 << 4;
		const BALLOON_64_BIT_TARGET = 1 << 5;
	}
}

impl Capabilities {
	/// Everything this driver can make use of.
	pub const SUPPORTED: Capabilities = Capabilities::BASIC_CMDS
		.union(Capabilities::BATCHED_CMDS)
		.union(Capabilities::BATCHED_2M_CMDS)
		.union(Capabilities::BALLOON_64_BIT_TARGET);
}

/// Guest OS identifiers reported through [`BalloonCommand::GuestId`].
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestType {
	Unknown = 0,
	#[default]
	Linux = 1,
	Bsd = 2,
	WindowsNt4 = 3,
	WindowsNt5 = 4,
	Solaris = 5,
	MacOs = 6,
}

impl GuestType {
	pub fn from_name(name: &str) -> Option<Self> {
		let guest_type = match name {
			"unknown" => GuestType::Unknown,
			"linux" => GuestType::Linux,
			"bsd" => GuestType::Bsd,
			"windows" | "windows-nt5" => GuestType::WindowsNt5,
			"windows-nt4" => GuestType::WindowsNt4,
			"solaris" => GuestType::Solaris,
			"macos" => GuestType::MacOs,
			_ => return None,
		};
		Some(guest_type)
	}
}

/// Raw registers returned by a backdoor hypercall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackdoorReply {
	/// `rax`, holding the [`BalloonStatus`] in its lower half.
	pub status: u64,
	/// `rbx`
	pub result: u64,
	/// `rcx`
	pub capabilities: u64,
}

/// Transport that issues a single balloon hypercall.
pub trait Backdoor {
	fn call(&mut self, cmd: BalloonCommand, arg1: u64, arg2: u64) -> BackdoorReply;
}

/// Encodes and decodes the balloon commands on top of a [`Backdoor`].
pub struct Monitor {
	backdoor: Box<dyn Backdoor + Send>,
	capabilities: Capabilities,
	reset_required: bool,
	stats: MonitorStats,
}

impl Monitor {
	/// A fresh channel has not been started yet and therefore requires a reset.
	pub fn new(backdoor: Box<dyn Backdoor + Send>) -> Self {
		Self {
			backdoor,
			capabilities: Capabilities::empty(),
			reset_required: true,
			stats: MonitorStats::default(),
		}
	}

	/// Capabilities negotiated by the last successful [`Self::start`].
	pub fn capabilities(&self) -> Capabilities {
		self.capabilities
	}

	pub fn reset_required(&self) -> bool {
		self.reset_required
	}

	pub(crate) fn reset_done(&mut self) {
		self.reset_required = false;
	}

	pub fn stats(&self) -> &MonitorStats {
		&self.stats
	}

	fn call(&mut self, cmd: BalloonCommand, arg1: u64, arg2: u64) -> (BalloonStatus, BackdoorReply) {
		let reply = self.backdoor.call(cmd, arg1, arg2);
		let status = BalloonStatus::from_reply(reply.status);

		trace!("<balloon:monitor> {cmd:?}({arg1:#x}, {arg2:#x}) -> {status:?}");

		if status == BalloonStatus::ErrorReset {
			warn!("<balloon:monitor> Hypervisor requested a protocol reset");
			self.reset_required = true;
		}

		(status, reply)
	}

	/// Output values are limited to 32 bits unless 64-bit targets were negotiated.
	fn clamp(&self, value: u64) -> u64 {
		if self.capabilities.contains(Capabilities::BALLOON_64_BIT_TARGET) {
			value
		} else {
			value.min(u64::from(u32::MAX))
		}
	}

	/// Page numbers must fit into 32 bits unless 64-bit targets were negotiated.
	fn ppn_arg(&self, ppn: u64) -> Result<u64, BalloonStatus> {
		if self.capabilities.contains(Capabilities::BALLOON_64_BIT_TARGET)
			|| u32::try_from(ppn).is_ok()
		{
			Ok(ppn)
		} else {
			Err(BalloonStatus::ErrorPpnInvalid)
		}
	}

	/// Starts (or restarts) the channel, offering `supported`.
	///
	/// Returns the capabilities both sides agree on. Hypervisors predating
	/// capability negotiation answer with plain success, which means only
	/// [`Capabilities::BASIC_CMDS`].
	pub fn start(&mut self, supported: Capabilities) -> Result<Capabilities, BalloonStatus> {
		self.stats.start += 1;

		let (status, reply) = self.call(BalloonCommand::Start, u64::from(supported.bits()), 0);
		let capabilities = match status {
			BalloonStatus::Success => Capabilities::BASIC_CMDS,
			BalloonStatus::SuccessWithCapabilities => {
				Capabilities::from_bits_truncate(reply.capabilities as u32) & supported
			}
			status => {
				self.stats.start_fail += 1;
				return Err(status);
			}
		};

		self.capabilities = capabilities;
		Ok(capabilities)
	}

	pub fn guest_type(&mut self, guest_type: GuestType) -> Result<(), BalloonStatus> {
		self.stats.guest_type += 1;

		match self.call(BalloonCommand::GuestId, u64::from(u32::from(guest_type)), 0) {
			(BalloonStatus::Success, _) => Ok(()),
			(status, _) => {
				self.stats.guest_type_fail += 1;
				Err(status)
			}
		}
	}

	/// Asks for the balloon size in small pages, telling the hypervisor that
	/// the guest can hold at most `limit` pages.
	pub fn get_target(&mut self, limit: u64) -> Result<u64, BalloonStatus> {
		self.stats.target += 1;

		let limit = self.clamp(limit);
		match self.call(BalloonCommand::GetTarget, limit, 0) {
			(BalloonStatus::Success, reply) => Ok(self.clamp(reply.result)),
			(status, _) => {
				self.stats.target_fail += 1;
				Err(status)
			}
		}
	}

	/// Locks a single small page. Returns the updated target.
	pub fn lock_page(&mut self, ppn: u64) -> Result<u64, BalloonStatus> {
		self.page_command(BalloonCommand::Lock, ppn)
	}

	/// Unlocks a single small page. Returns the updated target.
	pub fn unlock_page(&mut self, ppn: u64) -> Result<u64, BalloonStatus> {
		self.page_command(BalloonCommand::Unlock, ppn)
	}

	fn page_command(&mut self, cmd: BalloonCommand, ppn: u64) -> Result<u64, BalloonStatus> {
		let lock = cmd == BalloonCommand::Lock;
		self.count(lock, PageSize::Small, false);

		let result = match self.ppn_arg(ppn) {
			Ok(ppn) => match self.call(cmd, ppn, 0) {
				(BalloonStatus::Success, reply) => Ok(self.clamp(reply.result)),
				(status, _) => Err(status),
			},
			Err(status) => Err(status),
		};

		if result.is_err() {
			self.count(lock, PageSize::Small, true);
		}
		result
	}

	/// Locks the first `num_entries` entries of the batch page at `batch_ppn`.
	///
	/// The per-page outcome is written back into the entries by the hypervisor.
	/// Returns the updated target.
	pub fn lock_batched(
		&mut self,
		batch_ppn: u64,
		num_entries: usize,
		size: PageSize,
	) -> Result<u64, BalloonStatus> {
		let cmd = match size {
			PageSize::Small => BalloonCommand::BatchedLock,
			PageSize::Large => BalloonCommand::Batched2mLock,
		};
		self.batched_command(cmd, true, batch_ppn, num_entries, size)
	}

	/// Unlocks the first `num_entries` entries of the batch page at `batch_ppn`.
	pub fn unlock_batched(
		&mut self,
		batch_ppn: u64,
		num_entries: usize,
		size: PageSize,
	) -> Result<u64, BalloonStatus> {
		let cmd = match size {
			PageSize::Small => BalloonCommand::BatchedUnlock,
			PageSize::Large => BalloonCommand::Batched2mUnlock,
		};
		self.batched_command(cmd, false, batch_ppn, num_entries, size)
	}

	fn batched_command(
		&mut self,
		cmd: BalloonCommand,
		lock: bool,
		batch_ppn: u64,
		num_entries: usize,
		size: PageSize,
	) -> Result<u64, BalloonStatus> {
		self.count(lock, size, false);

		let result = match self.ppn_arg(batch_ppn) {
			Ok(ppn) => match self.call(cmd, ppn, num_entries as u64) {
				(BalloonStatus::Success, reply) => Ok(self.clamp(reply.result)),
				(status, _) => Err(status),
			},
			Err(status) => Err(status),
		};

		if result.is_err() {
			self.count(lock, size, true);
		}
		result
	}

	fn count(&mut self, lock: bool, size: PageSize, failed: bool) {
		let counter = match (lock, failed) {
			(true, false) => &mut self.stats.lock,
			(true, true) => &mut self.stats.lock_fail,
			(false, false) => &mut self.stats.unlock,
			(false, true) => &mut self.stats.unlock_fail,
		};
		counter[size.index()] += 1;
	}
}
