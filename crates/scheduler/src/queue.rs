//! Per-file operation queue for the AST worker.
//!
//! A single-consumer FIFO with two lanes: preamble-driven diagnostics tasks
//! (processed first) and public operations. Enqueue never blocks. Update
//! enqueues rewrite the tail: a pending `Auto` update at the tail is
//! clobbered, and reads that opted into invalidation are cancelled when the
//! new update actually changes the file state.

use std::collections::VecDeque;

use keel_context::{CancelHandle, CancelReason, Context};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{InputsAndAst, InputsAndPreamble};
use crate::error::Result;
use crate::inputs::ParseInputs;

/// Whether an update wants its diagnostics published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantDiagnostics {
	/// Publish diagnostics for this exact version.
	Yes,
	/// Publish if the content changed since the last published report;
	/// superseded updates are coalesced away.
	Auto,
	/// Never publish for this update; the AST is built lazily by reads.
	No,
}

/// Whether a read is cancelled by a later update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
	/// The read runs even if the file changes underneath it.
	None,
	/// A later update enqueued before the read starts cancels it with
	/// `ContentModified`.
	OnUpdate,
}

/// Preamble freshness requirement for a preamble read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleConsistency {
	/// Any published preamble, possibly older than the current inputs;
	/// waits for the first one if none was ever published.
	Stale,
	/// Like `Stale`, but delivers a null preamble instead of waiting
	/// forever when none will ever be published.
	StaleOrAbsent,
	/// Waits until the published preamble matches the current inputs'
	/// version.
	Consistent,
}

pub(crate) type ReadAstCallback = Box<dyn FnOnce(Result<InputsAndAst>) + Send>;
pub(crate) type ReadPreambleCallback = Box<dyn FnOnce(Result<InputsAndPreamble>) + Send>;

pub(crate) struct UpdateOp {
	pub inputs: ParseInputs,
	pub want: WantDiagnostics,
	pub ctx: Context,
	/// Whether these inputs differ from the previously enqueued file state.
	pub content_changed: bool,
}

pub(crate) struct ReadAstOp {
	pub name: String,
	pub ctx: Context,
	pub cancel: Option<CancelHandle>,
	pub invalidation: Invalidation,
	pub callback: ReadAstCallback,
}

pub(crate) struct ReadPreambleOp {
	pub name: String,
	pub ctx: Context,
	pub consistency: PreambleConsistency,
	pub callback: ReadPreambleCallback,
}

pub(crate) enum Op {
	Update(UpdateOp),
	ReadAst(ReadAstOp),
	ReadPreamble(ReadPreambleOp),
}

/// Diagnostics task generated by the preamble worker after it settles a
/// request (built, reused, or failed).
pub(crate) struct DiagTask {
	pub inputs: ParseInputs,
	pub want: WantDiagnostics,
	pub ctx: Context,
}

pub(crate) enum Next {
	Diag(DiagTask),
	Op(Op),
	Closed,
}

struct QueueState {
	diag: VecDeque<DiagTask>,
	ops: VecDeque<Op>,
	latest_inputs: Option<ParseInputs>,
	busy: bool,
	closed: bool,
}

pub(crate) struct OpQueue {
	state: Mutex<QueueState>,
	notify: Notify,
}

impl OpQueue {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(QueueState {
				diag: VecDeque::new(),
				ops: VecDeque::new(),
				latest_inputs: None,
				busy: false,
				closed: false,
			}),
			notify: Notify::new(),
		}
	}

	/// Enqueues an update, applying the tail rewrites.
	///
	/// Returns whether the update changes the enqueued file state.
	pub fn push_update(&self, inputs: ParseInputs, want: WantDiagnostics, ctx: Context) -> bool {
		let mut state = self.state.lock();
		if state.closed {
			return false;
		}

		let content_changed = match &state.latest_inputs {
			Some(prev) => !inputs.content_equivalent(prev),
			None => true,
		};

		// No-op refreshes do not invalidate pending reads.
		if content_changed {
			for op in state.ops.iter().rev() {
				match op {
					Op::ReadAst(read) if read.invalidation == Invalidation::OnUpdate => {
						if let Some(cancel) = &read.cancel {
							cancel.cancel(CancelReason::ContentModified);
						}
					}
					// Older items were already invalidated when this
					// update was enqueued.
					Op::Update(update) if update.content_changed => break,
					_ => {}
				}
			}
		}

		// A pending Auto update at the tail is obsoleted by any newer
		// update; its diagnostics callback never fires.
		if let Some(Op::Update(prev)) = state.ops.back() {
			if prev.want == WantDiagnostics::Auto {
				state.ops.pop_back();
			}
		}

		state.ops.push_back(Op::Update(UpdateOp {
			inputs: inputs.clone(),
			want,
			ctx,
			content_changed,
		}));
		state.latest_inputs = Some(inputs);
		drop(state);
		self.notify.notify_one();
		content_changed
	}

	/// Enqueues a read. Hands the operation back when the queue is closed,
	/// so the caller can still deliver its callback. On success, reports
	/// whether the read landed behind other work.
	pub fn push_op(&self, op: Op) -> std::result::Result<bool, Op> {
		let mut state = self.state.lock();
		if state.closed {
			return Err(op);
		}
		let queued_behind = state.busy || !state.ops.is_empty() || !state.diag.is_empty();
		state.ops.push_back(op);
		drop(state);
		self.notify.notify_one();
		Ok(queued_behind)
	}

	/// Enqueues a preamble-driven diagnostics task; these run before
	/// ordinary operations.
	pub fn push_diag(&self, task: DiagTask) {
		let mut state = self.state.lock();
		if state.closed {
			return;
		}
		state.diag.push_back(task);
		drop(state);
		self.notify.notify_one();
	}

	/// Receives the next item, diagnostics lane first. Marks the queue busy
	/// until [`Self::done`]. Returns [`Next::Closed`] once closed and
	/// drained.
	pub async fn recv(&self) -> Next {
		loop {
			let notified = self.notify.notified();
			{
				let mut state = self.state.lock();
				if let Some(task) = state.diag.pop_front() {
					state.busy = true;
					return Next::Diag(task);
				}
				if let Some(op) = state.ops.pop_front() {
					state.busy = true;
					return Next::Op(op);
				}
				if state.closed {
					return Next::Closed;
				}
			}
			notified.await;
		}
	}

	/// Tries to receive without waiting. Used by the synchronous driver.
	pub fn try_recv(&self) -> Option<Next> {
		let mut state = self.state.lock();
		if let Some(task) = state.diag.pop_front() {
			state.busy = true;
			return Some(Next::Diag(task));
		}
		if let Some(op) = state.ops.pop_front() {
			state.busy = true;
			return Some(Next::Op(op));
		}
		None
	}

	/// Marks the current item finished.
	pub fn done(&self) {
		self.state.lock().busy = false;
	}

	/// Whether any update is queued. Pending diagnostics tasks for
	/// coalescable updates are abandoned when this turns true.
	pub fn has_pending_update(&self) -> bool {
		self.state
			.lock()
			.ops
			.iter()
			.any(|op| matches!(op, Op::Update(_)))
	}

	/// Whether a newer diagnostics task is queued.
	pub fn has_pending_diag(&self) -> bool {
		!self.state.lock().diag.is_empty()
	}

	/// Waits for any enqueue. The caller re-checks state afterwards.
	pub async fn wait_arrival(&self) {
		self.notify.notified().await;
	}

	/// Whether the queue is empty and no item is executing.
	pub fn is_idle(&self) -> bool {
		let state = self.state.lock();
		state.diag.is_empty() && state.ops.is_empty() && !state.busy
	}

	/// Closes the queue; subsequent enqueues are rejected.
	pub fn close(&self) {
		self.state.lock().closed = true;
		self.notify.notify_one();
	}

	/// Takes everything still queued, for shutdown delivery.
	pub fn drain(&self) -> Vec<Op> {
		let mut state = self.state.lock();
		state.diag.clear();
		state.ops.drain(..).collect()
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;
	use std::sync::Arc;

	use super::*;
	use crate::inputs::{CompileCommand, SnapshotFs};

	struct NullFs;

	impl SnapshotFs for NullFs {
		fn timestamp(&self, _path: &std::path::Path) -> Option<std::time::SystemTime> {
			None
		}

		fn snapshot_token(&self) -> u64 {
			0
		}
	}

	fn inputs(contents: &str) -> ParseInputs {
		ParseInputs {
			contents: Arc::from(contents),
			version: contents.to_string(),
			command: CompileCommand {
				directory: PathBuf::from("/work"),
				argv: vec!["cc".into()],
				heuristic: None,
			},
			fs: Arc::new(NullFs),
			force_rebuild: false,
		}
	}

	fn tagged_read(name: &str) -> (Op, CancelHandle) {
		let (ctx, cancel) = keel_context::cancelable(&Context::empty());
		let op = Op::ReadAst(ReadAstOp {
			name: name.to_string(),
			ctx,
			cancel: Some(cancel.clone()),
			invalidation: Invalidation::OnUpdate,
			callback: Box::new(|_| {}),
		});
		(op, cancel)
	}

	fn plain_read(name: &str) -> Op {
		Op::ReadAst(ReadAstOp {
			name: name.to_string(),
			ctx: Context::empty(),
			cancel: None,
			invalidation: Invalidation::None,
			callback: Box::new(|_| {}),
		})
	}

	// ── Tail rewrites ──

	#[test]
	fn tail_auto_update_is_clobbered() {
		let q = OpQueue::new();
		q.push_update(inputs("a"), WantDiagnostics::Auto, Context::empty());
		q.push_update(inputs("b"), WantDiagnostics::No, Context::empty());

		let mut contents = Vec::new();
		while let Some(Next::Op(Op::Update(u))) = q.try_recv() {
			contents.push(u.inputs.contents.to_string());
			q.done();
		}
		assert_eq!(contents, vec!["b"]);
	}

	#[test]
	fn tail_yes_update_is_preserved() {
		let q = OpQueue::new();
		q.push_update(inputs("a"), WantDiagnostics::Yes, Context::empty());
		q.push_update(inputs("b"), WantDiagnostics::Auto, Context::empty());

		let mut contents = Vec::new();
		while let Some(Next::Op(Op::Update(u))) = q.try_recv() {
			contents.push(u.inputs.contents.to_string());
			q.done();
		}
		assert_eq!(contents, vec!["a", "b"]);
	}

	#[test]
	fn update_cancels_tagged_reads_past_untagged_ones() {
		let q = OpQueue::new();
		q.push_update(inputs("a"), WantDiagnostics::Yes, Context::empty());
		let (tagged, cancel) = tagged_read("tagged");
		q.push_op(tagged).ok().unwrap();
		q.push_op(plain_read("plain")).ok().unwrap();
		q.push_update(inputs("b"), WantDiagnostics::Yes, Context::empty());

		assert_eq!(cancel.reason(), Some(CancelReason::ContentModified));
	}

	#[test]
	fn walk_stops_at_older_content_changed_update() {
		let q = OpQueue::new();
		let (older, older_cancel) = tagged_read("older");
		q.push_op(older).ok().unwrap();
		q.push_update(inputs("a"), WantDiagnostics::Yes, Context::empty());
		let (newer, newer_cancel) = tagged_read("newer");
		q.push_op(newer).ok().unwrap();
		q.push_update(inputs("b"), WantDiagnostics::Yes, Context::empty());

		assert_eq!(newer_cancel.reason(), Some(CancelReason::ContentModified));
		assert_eq!(older_cancel.reason(), None, "the update for 'a' already owned that prefix");
	}

	#[test]
	fn noop_refresh_does_not_invalidate() {
		let q = OpQueue::new();
		q.push_update(inputs("a"), WantDiagnostics::Yes, Context::empty());
		let (tagged, cancel) = tagged_read("tagged");
		q.push_op(tagged).ok().unwrap();

		let changed = q.push_update(inputs("a"), WantDiagnostics::Yes, Context::empty());
		assert!(!changed);
		assert_eq!(cancel.reason(), None);
	}

	// ── Lanes and lifecycle ──

	#[tokio::test]
	async fn diag_lane_runs_first() {
		let q = OpQueue::new();
		q.push_op(plain_read("r")).ok().unwrap();
		q.push_diag(DiagTask {
			inputs: inputs("a"),
			want: WantDiagnostics::Auto,
			ctx: Context::empty(),
		});

		assert!(matches!(q.recv().await, Next::Diag(_)));
		q.done();
		assert!(matches!(q.recv().await, Next::Op(_)));
		q.done();
	}

	#[test]
	fn close_rejects_new_ops_and_drains() {
		let q = OpQueue::new();
		q.push_op(plain_read("r")).ok().unwrap();
		q.close();

		assert!(q.push_op(plain_read("rejected")).is_err());
		assert_eq!(q.drain().len(), 1);
		assert!(q.is_idle());
	}

	#[test]
	fn busy_until_done() {
		let q = OpQueue::new();
		q.push_op(plain_read("r")).ok().unwrap();
		assert!(!q.is_idle());
		let _ = q.try_recv().expect("op queued");
		assert!(!q.is_idle(), "executing item keeps the queue busy");
		q.done();
		assert!(q.is_idle());
	}
}
