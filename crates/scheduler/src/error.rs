use std::path::PathBuf;

use thiserror::Error;

pub use keel_context::CancelReason;

/// Errors surfaced to read callbacks and public operations.
#[derive(Debug, Error)]
pub enum SchedError {
	/// The file was never updated, or has been removed.
	#[error("file not tracked: {0}")]
	FileNotTracked(PathBuf),

	/// The operation was cancelled before or during execution.
	#[error("cancelled: {0:?}")]
	Cancelled(CancelReason),

	/// The parser failed to produce an artifact.
	#[error("parse failed: {0}")]
	Parse(String),
}

impl SchedError {
	/// Cancellation reason, if this is a cancellation.
	pub fn cancel_reason(&self) -> Option<CancelReason> {
		match self {
			Self::Cancelled(reason) => Some(*reason),
			_ => None,
		}
	}
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedError>;
