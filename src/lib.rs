//! Guest side of the VMware memory balloon.
//!
//! The crate contains the page accounting and rate control engine of the
//! balloon together with the hypercall protocol it speaks. The embedding
//! kernel supplies page reservation through [`mm::ReservedPageAllocator`]
//! and drives the engine through [`executor::BalloonTask`].
//!
//! ## Feature flags
#![cfg_attr(
	feature = "document-features",
	doc = document_features::document_features!()
)]
#![warn(clippy::all)]
#![allow(clippy::tabs_in_doc_comments)]
#![no_std]

// EXTERNAL CRATES
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

#[macro_use]
mod logging;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod executor;
pub mod mm;
pub mod runtime_params;

pub use self::drivers::balloon::Balloon;
pub use self::logging::{LogSink, init as init_logging};
pub use self::runtime_params::{BalloonConfig, ConfigError};
