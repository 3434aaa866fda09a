//! VMware backdoor reached through the `in` instruction on the balloon port.

use core::arch::asm;

use crate::drivers::balloon::monitor::{
	BALLOON_BDOOR_MAGIC, BALLOON_BDOOR_PORT, Backdoor, BackdoorReply, BalloonCommand,
};

/// Issues balloon hypercalls through the I/O port backdoor.
#[derive(Debug)]
pub struct IoPortBackdoor {
	_private: (),
}

impl IoPortBackdoor {
	/// # Safety
	///
	/// The guest must run on a VMware hypervisor and the caller must be allowed
	/// to access I/O ports. On bare hardware the port access faults.
	pub const unsafe fn new() -> Self {
		Self { _private: () }
	}
}

impl Backdoor for IoPortBackdoor {
	fn call(&mut self, cmd: BalloonCommand, arg1: u64, arg2: u64) -> BackdoorReply {
		let status: u64;
		let result: u64;
		let capabilities: u64;

		// rbx is reserved by LLVM, so the first argument travels through a
		// scratch register and is swapped in around the port access.
		unsafe {
			asm!(
				"xchg rbx, {arg1}",
				"in eax, dx",
				"xchg rbx, {arg1}",
				arg1 = inout(reg) arg1 => result,
				inout("rax") u64::from(BALLOON_BDOOR_MAGIC) => status,
				inout("rcx") u64::from(u16::from(cmd)) => capabilities,
				inout("rdx") u64::from(BALLOON_BDOOR_PORT) => _,
				inout("rsi") arg2 => _,
				options(nostack),
			);
		}

		BackdoorReply {
			status,
			result,
			capabilities,
		}
	}
}
