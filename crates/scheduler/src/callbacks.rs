//! Consumer-facing parsing callbacks and per-file status.

use std::path::Path;

use lsp_types::Diagnostic;
use parking_lot::Mutex;

use crate::engine::{InputsAndAst, OpaquePayload};

/// What the preamble worker of a file is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleAction {
	Idle,
	Building,
}

/// What the AST worker of a file is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstActionKind {
	Idle,
	Queued,
	RunningAction,
	Building,
}

/// AST activity with the display name of the running item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstAction {
	pub kind: AstActionKind,
	pub name: String,
}

impl AstAction {
	pub fn idle() -> Self {
		Self {
			kind: AstActionKind::Idle,
			name: String::new(),
		}
	}
}

/// Best-effort per-file status snapshot.
///
/// Preamble and AST workers report independently; consumers must treat the
/// sequence as lossy, not as a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
	pub preamble: PreambleAction,
	pub ast: AstAction,
}

impl FileStatus {
	pub fn idle() -> Self {
		Self {
			preamble: PreambleAction::Idle,
			ast: AstAction::idle(),
		}
	}
}

pub(crate) struct PublishState {
	pub delivered_hash: Option<u64>,
	pub closed: bool,
}

/// Serializes diagnostic deliveries for one file.
///
/// `deliver` runs the closure under the file's publish lock, so reports for
/// one file never interleave. Delivery is suppressed when the publish gate
/// rejected the report or the worker has been torn down (dead writes never
/// fire).
pub struct Publish<'a> {
	pub(crate) allowed: bool,
	pub(crate) report_hash: u64,
	pub(crate) state: &'a Mutex<PublishState>,
}

impl Publish<'_> {
	/// Runs `f` serialized with other deliveries for this file, recording
	/// the report as delivered. No-op when suppressed.
	pub fn deliver(self, f: impl FnOnce()) {
		if !self.allowed {
			return;
		}
		let mut state = self.state.lock();
		if state.closed {
			return;
		}
		f();
		state.delivered_hash = Some(self.report_hash);
	}
}

/// Hooks driven by the scheduler as artifacts are produced.
///
/// Never invoked re-entrantly for the same file; calls for different files
/// may overlap.
pub trait ParsingCallbacks: Send + Sync {
	/// Called synchronously on the preamble worker while its artifact is
	/// still a stable, lock-free snapshot.
	fn on_preamble_ast(&self, _file: &Path, _version: &str, _payload: &OpaquePayload) {}

	/// Called once per distinct published preamble content. Identical
	/// republication does not notify.
	fn on_preamble_published(&self, _file: &Path) {}

	/// Called on the AST worker after a diagnostics-producing build.
	fn on_main_ast(&self, _file: &Path, _ast: &InputsAndAst, _publish: Publish<'_>) {}

	/// Called when an AST build failed but still produced diagnostics.
	fn on_failed_ast(&self, _file: &Path, _version: &str, _diagnostics: &[Diagnostic], _publish: Publish<'_>) {}

	/// Best-effort status report; may miss intermediate states.
	fn on_file_updated(&self, _file: &Path, _status: &FileStatus) {}
}

/// Callbacks that do nothing. Useful for consumers that only read.
pub struct NoopCallbacks;

impl ParsingCallbacks for NoopCallbacks {}

/// Merged preamble/AST status for one file, reported on every transition.
pub(crate) struct StatusCell {
	file: std::path::PathBuf,
	callbacks: std::sync::Arc<dyn ParsingCallbacks>,
	state: Mutex<FileStatus>,
}

impl StatusCell {
	pub fn new(file: std::path::PathBuf, callbacks: std::sync::Arc<dyn ParsingCallbacks>) -> Self {
		Self {
			file,
			callbacks,
			state: Mutex::new(FileStatus::idle()),
		}
	}

	pub fn set_preamble(&self, action: PreambleAction) {
		let snapshot = {
			let mut state = self.state.lock();
			state.preamble = action;
			state.clone()
		};
		self.callbacks.on_file_updated(&self.file, &snapshot);
	}

	pub fn set_ast(&self, action: AstAction) {
		let snapshot = {
			let mut state = self.state.lock();
			state.ast = action;
			state.clone()
		};
		self.callbacks.on_file_updated(&self.file, &snapshot);
	}
}
