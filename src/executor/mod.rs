//! Cooperative polling of the balloon engine.

pub mod balloon;

pub use self::balloon::{BalloonTask, TaskError, balloon_run, init};
