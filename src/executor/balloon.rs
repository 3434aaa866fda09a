use core::future;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;
use core::time::Duration;

use hermit_sync::SpinMutex;
use thiserror::Error;

use crate::drivers::balloon::Balloon;
use crate::drivers::balloon::stats::BalloonStats;
use crate::runtime_params::BalloonConfig;

static TASK_STARTED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
	#[error("The balloon task is already running")]
	AlreadyRunning,
}

/// Runs a polling cycle of the balloon once per interval.
pub struct BalloonTask {
	balloon: Balloon,
	interval: Duration,
	next_poll: Option<Duration>,
	running: bool,
}

impl BalloonTask {
	pub fn new(balloon: Balloon, config: &BalloonConfig) -> Self {
		Self {
			balloon,
			interval: config.poll_interval,
			next_poll: None,
			running: true,
		}
	}

	/// Runs a cycle if the interval elapsed at `now`. Returns whether it did.
	pub fn poll(&mut self, now: Duration) -> bool {
		if !self.running {
			return false;
		}
		if let Some(next_poll) = self.next_poll
			&& now < next_poll
		{
			return false;
		}

		self.balloon.query_and_execute();
		self.next_poll = Some(now + self.interval);
		true
	}

	/// Stops polling. A cycle in flight is not interrupted.
	pub fn stop(&mut self) {
		self.running = false;
	}

	pub fn is_running(&self) -> bool {
		self.running
	}

	pub fn balloon(&self) -> &Balloon {
		&self.balloon
	}

	/// Stops polling and returns every page to the OS.
	pub fn shutdown(mut self) -> BalloonStats {
		self.stop();
		self.balloon.cleanup();
		info!("<balloon:task> Balloon task shut down");
		self.balloon.stats()
	}
}

/// Polls `task` every time the executor polls the returned future.
///
/// Completes once the task was stopped.
pub async fn balloon_run<F>(task: &SpinMutex<BalloonTask>, clock: F)
where
	F: Fn() -> Duration,
{
	future::poll_fn(|_cx| {
		let Some(mut task_guard) = task.try_lock() else {
			debug!(
				"<balloon:task> Balloon task was polled while it was locked elsewhere, doing nothing"
			);
			return Poll::Pending;
		};

		if !task_guard.is_running() {
			return Poll::Ready(());
		}

		task_guard.poll(clock());
		Poll::Pending
	})
	.await;
}

/// Creates the balloon task. Only one task may exist per process.
pub fn init(balloon: Balloon, config: &BalloonConfig) -> Result<BalloonTask, TaskError> {
	if TASK_STARTED.swap(true, Ordering::AcqRel) {
		return Err(TaskError::AlreadyRunning);
	}

	info!("<balloon:task> Try to initialize balloon interface!");
	Ok(BalloonTask::new(balloon, config))
}

#[cfg(test)]
mod tests {
	use alloc::boxed::Box;
	use core::pin::pin;
	use core::task::{Context, Waker};

	use super::*;
	use crate::drivers::balloon::monitor::{Backdoor, BackdoorReply, BalloonCommand};
	use crate::mm::test::TestPages;

	/// Hypervisor without any memory demand.
	struct IdleHost;

	impl Backdoor for IdleHost {
		fn call(&mut self, _cmd: BalloonCommand, _arg1: u64, _arg2: u64) -> BackdoorReply {
			BackdoorReply::default()
		}
	}

	fn balloon() -> Balloon {
		Balloon::new(
			&BalloonConfig::default(),
			Box::new(IdleHost),
			Box::new(TestPages::default()),
		)
	}

	#[test]
	fn poll_honors_interval() {
		let config = BalloonConfig {
			poll_interval: Duration::from_millis(100),
			..BalloonConfig::default()
		};
		let mut task = BalloonTask::new(balloon(), &config);

		assert!(task.poll(Duration::from_millis(5)));
		assert!(!task.poll(Duration::from_millis(50)));
		assert!(task.poll(Duration::from_millis(105)));
		assert_eq!(task.balloon().stats().pages.timer, 2);

		task.stop();
		assert!(!task.poll(Duration::from_secs(10)));
		assert_eq!(task.shutdown().pages.timer, 2);
	}

	#[test]
	fn run_completes_after_stop() {
		let task = SpinMutex::new(BalloonTask::new(balloon(), &BalloonConfig::default()));
		let now = SpinMutex::new(Duration::ZERO);
		let mut cx = Context::from_waker(Waker::noop());

		{
			let mut run = pin!(balloon_run(&task, || *now.lock()));
			assert!(run.as_mut().poll(&mut cx).is_pending());

			*now.lock() = Duration::from_secs(1);
			assert!(run.as_mut().poll(&mut cx).is_pending());

			// Contended polls do nothing.
			let guard = task.lock();
			assert!(run.as_mut().poll(&mut cx).is_pending());
			drop(guard);

			task.lock().stop();
			assert!(run.as_mut().poll(&mut cx).is_ready());
		}

		assert_eq!(task.lock().balloon().stats().pages.timer, 2);
	}

	#[test]
	fn only_one_task_per_process() {
		assert!(init(balloon(), &BalloonConfig::default()).is_ok());
		assert_eq!(
			init(balloon(), &BalloonConfig::default()).err(),
			Some(TaskError::AlreadyRunning)
		);
	}
}
