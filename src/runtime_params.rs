//! Central parsing of the balloon command-line parameters.

use alloc::string::{String, ToString};
use core::time::Duration;

use thiserror::Error;

use crate::config::DEFAULT_POLL_INTERVAL;
use crate::drivers::balloon::monitor::{Capabilities, GuestType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("Unable to split the command line: {0}")]
	Split(String),

	#[error("The argument '{0}' requires a value but none was supplied")]
	MissingValue(String),

	#[error("Invalid value '{value}' for argument '{name}'")]
	InvalidValue { name: String, value: String },
}

/// Settings of the balloon driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalloonConfig {
	/// Period between two polling cycles.
	pub poll_interval: Duration,
	/// Guest OS reported to the hypervisor.
	pub guest_type: GuestType,
	/// Capabilities offered during the handshake.
	pub capabilities: Capabilities,
}

impl Default for BalloonConfig {
	fn default() -> Self {
		Self {
			poll_interval: DEFAULT_POLL_INTERVAL,
			guest_type: GuestType::default(),
			capabilities: Capabilities::SUPPORTED,
		}
	}
}

impl BalloonConfig {
	/// Parses the balloon options out of a kernel command line.
	///
	/// Words that are not balloon options are skipped with a warning.
	pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
		let mut config = Self::default();

		let words =
			shell_words::split(cmdline).map_err(|err| ConfigError::Split(err.to_string()))?;
		debug!("<balloon> cli_words = {words:?}");

		let mut words = words.into_iter();
		let expect_arg = |arg: Option<String>, name: &str| {
			arg.ok_or_else(|| ConfigError::MissingValue(name.into()))
		};
		let invalid = |name: &str, value: String| ConfigError::InvalidValue {
			name: name.into(),
			value,
		};

		while let Some(word) = words.next() {
			match word.as_str() {
				"-balloon-interval" => {
					let value = expect_arg(words.next(), word.as_str())?;
					let millis = match value.parse::<u64>() {
						Ok(millis) if millis > 0 => millis,
						_ => return Err(invalid(word.as_str(), value)),
					};
					config.poll_interval = Duration::from_millis(millis);
				}
				"-balloon-guest" => {
					let value = expect_arg(words.next(), word.as_str())?;
					config.guest_type = GuestType::from_name(&value)
						.ok_or_else(|| invalid(word.as_str(), value))?;
				}
				"-balloon-no-batching" => {
					config
						.capabilities
						.remove(Capabilities::BATCHED_CMDS | Capabilities::BATCHED_2M_CMDS);
				}
				"-balloon-no-2m" => config.capabilities.remove(Capabilities::BATCHED_2M_CMDS),
				"-balloon-no-64bit" => config
					.capabilities
					.remove(Capabilities::BALLOON_64_BIT_TARGET),
				word => warn!(
					"<balloon> Found argument '{word}' which wasn't expected, or isn't valid in this context"
				),
			}
		}

		Ok(config)
	}
}
