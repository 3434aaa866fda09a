use core::fmt;

use hermit_sync::OnceCell;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Output routine of the embedding kernel, e.g. its console writer.
pub type LogSink = fn(fmt::Arguments<'_>);

/// Data structure to filter balloon driver messages
struct BalloonLogger {
	sink: OnceCell<LogSink>,
}

impl log::Log for BalloonLogger {
	fn enabled(&self, _: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {
		// nothing to do
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			if let Some(sink) = self.sink.get() {
				sink(format_args!(
					"[vmmemctl][{}] {}",
					record.level(),
					record.args()
				));
			}
		}
	}
}

static LOGGER: BalloonLogger = BalloonLogger {
	sink: OnceCell::new(),
};

/// Installs the driver's logger, forwarding every record to `sink`.
///
/// Fails if the embedder already installed another logger. The maximum level
/// is fixed at compile time through `VMMEMCTL_LOG_LEVEL_FILTER`.
pub fn init(sink: LogSink) -> Result<(), SetLoggerError> {
	if LOGGER.sink.set(sink).is_err() {
		debug!("Balloon logger sink was already registered");
	}
	log::set_logger(&LOGGER)?;
	// Determines LevelFilter at compile time
	log::set_max_level(level_filter(option_env!("VMMEMCTL_LOG_LEVEL_FILTER")));
	Ok(())
}

fn level_filter(log_level: Option<&str>) -> LevelFilter {
	match log_level {
		Some("Error") => LevelFilter::Error,
		Some("Debug") => LevelFilter::Debug,
		Some("Off") => LevelFilter::Off,
		Some("Trace") => LevelFilter::Trace,
		Some("Warn") => LevelFilter::Warn,
		Some("Info") => LevelFilter::Info,
		_ => LevelFilter::Info,
	}
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}
