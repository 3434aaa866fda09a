//! A module containing the vmmemctl driver and the driver trait.

pub mod balloon;

/// A trait to determine general driver information
pub trait Driver {
	/// Returns the device driver name
	fn get_name(&self) -> &'static str;
}
