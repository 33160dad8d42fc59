//! Per-file preamble worker.
//!
//! Serializes preamble builds for one file. The most recent pending inputs
//! override earlier pending ones, except that a pending request with
//! `WantDiagnostics::Yes` is never dropped: the caller blocks until the
//! builder has taken it. Every settled request (built, reused, or failed)
//! hands a diagnostics task back to the AST worker.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use keel_context::{with_current, Context};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::ast_worker::WorkerDeps;
use crate::callbacks::{PreambleAction, StatusCell};
use crate::engine::Preamble;
use crate::inputs::ParseInputs;
use crate::queue::{DiagTask, OpQueue, WantDiagnostics};
use crate::throttle::ReleaseGuard;

fn next_preamble_id() -> u64 {
	static NEXT: AtomicU64 = AtomicU64::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}

struct PendingRequest {
	inputs: ParseInputs,
	want: WantDiagnostics,
	ctx: Context,
}

#[derive(Default)]
struct PreambleState {
	pending: Option<PendingRequest>,
	published: Option<Arc<Preamble>>,
	building: bool,
	/// At least one request has settled (first outcome).
	attempted: bool,
	last_published_hash: Option<u64>,
}

struct PreambleShared {
	state: Mutex<PreambleState>,
	/// Wakes the builder when a request is pending.
	request_notify: Notify,
	/// Wakes a blocked `request` caller when the pending slot frees up.
	taken_notify: Notify,
	/// Wakes the AST worker when a request settles.
	outcome_notify: Notify,
}

/// Handle to one file's preamble worker. Clones share state; the builder
/// loop runs on one clone while the AST worker requests and waits on another.
#[derive(Clone)]
pub(crate) struct PreambleWorker {
	file: PathBuf,
	shared: Arc<PreambleShared>,
	deps: Arc<WorkerDeps>,
	ast_queue: Arc<OpQueue>,
	status: Arc<StatusCell>,
	shutdown: CancellationToken,
}

impl PreambleWorker {
	pub fn new(
		file: PathBuf,
		deps: Arc<WorkerDeps>,
		ast_queue: Arc<OpQueue>,
		status: Arc<StatusCell>,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			file,
			shared: Arc::new(PreambleShared {
				state: Mutex::new(PreambleState::default()),
				request_notify: Notify::new(),
				taken_notify: Notify::new(),
				outcome_notify: Notify::new(),
			}),
			deps,
			ast_queue,
			status,
			shutdown,
		}
	}

	/// Submits inputs for a preamble build.
	///
	/// Coalesces with any pending request, but never drops a pending
	/// `Yes` request on the floor: this call blocks (the AST worker, not the
	/// builder) until that request starts building.
	pub async fn request(&self, inputs: ParseInputs, want: WantDiagnostics, ctx: Context) {
		let mut req = Some(PendingRequest { inputs, want, ctx });
		if self.deps.sync {
			if let Some(req) = req.take() {
				self.process(req).await;
			}
			return;
		}
		loop {
			let taken = self.shared.taken_notify.notified();
			{
				let mut state = self.shared.state.lock();
				let replaceable = state.pending.as_ref().is_none_or(|p| p.want != WantDiagnostics::Yes);
				if replaceable {
					state.pending = req.take();
					drop(state);
					self.shared.request_notify.notify_one();
					return;
				}
			}
			tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => return,
				_ = taken => {}
			}
		}
	}

	/// Latest published preamble, possibly stale.
	pub fn published(&self) -> Option<Arc<Preamble>> {
		self.shared.state.lock().published.clone()
	}

	/// Whether any request has ever settled for this file.
	pub fn has_outcome(&self) -> bool {
		self.shared.state.lock().attempted
	}

	/// Waits until the first request settles. Returns false on shutdown.
	pub async fn wait_first_outcome(&self) -> bool {
		loop {
			let notified = self.shared.outcome_notify.notified();
			if self.has_outcome() {
				return true;
			}
			tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => return false,
				_ = notified => {}
			}
		}
	}

	/// Waits until some preamble is published. `None` on shutdown.
	pub async fn wait_published(&self) -> Option<Arc<Preamble>> {
		loop {
			let notified = self.shared.outcome_notify.notified();
			if let Some(preamble) = self.published() {
				return Some(preamble);
			}
			tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => return None,
				_ = notified => {}
			}
		}
	}

	/// Waits for the next settled request.
	pub async fn outcome_event(&self) {
		self.shared.outcome_notify.notified().await;
	}

	/// No pending request and no build in flight.
	pub fn is_idle(&self) -> bool {
		let state = self.shared.state.lock();
		state.pending.is_none() && !state.building
	}

	/// Whether the published preamble would be reused as-is for `inputs`:
	/// same preamble-affecting portion and no include changed on disk.
	pub fn up_to_date(&self, inputs: &ParseInputs) -> bool {
		if inputs.force_rebuild {
			return false;
		}
		let prefix_len = self.deps.engine.preamble_bounds(&inputs.contents);
		let fingerprint = inputs.preamble_fingerprint(&self.file, prefix_len);
		self.reusable(fingerprint, inputs)
	}

	/// Builder loop; one task per file in asynchronous mode.
	pub async fn run(self) {
		loop {
			let req = loop {
				let notified = self.shared.request_notify.notified();
				{
					let mut state = self.shared.state.lock();
					if let Some(req) = state.pending.take() {
						state.building = true;
						break req;
					}
				}
				tokio::select! {
					biased;
					_ = self.shutdown.cancelled() => return,
					_ = notified => {}
				}
			};
			self.shared.taken_notify.notify_one();
			self.process(req).await;
			self.shared.state.lock().building = false;
		}
	}

	/// Handles one request: reuse, or build behind the throttler.
	async fn process(&self, req: PendingRequest) {
		let PendingRequest { inputs, want, ctx } = req;
		let prefix_len = self.deps.engine.preamble_bounds(&inputs.contents);
		let fingerprint = inputs.preamble_fingerprint(&self.file, prefix_len);

		if !inputs.force_rebuild && self.reusable(fingerprint, &inputs) {
			tracing::debug!(file = %self.file.display(), version = %inputs.version, "sched.preamble.reuse");
			self.refresh_published_version(&inputs);
			self.settle(inputs, want, ctx);
			return;
		}

		// Admission gate. The guard releases the slot on completion,
		// cancellation, and teardown, even if `on_ready` never fired.
		let _slot = match &self.deps.throttler {
			Some(throttler) => {
				let ready = Arc::new(Notify::new());
				let signal = Arc::clone(&ready);
				let id = throttler.acquire(&self.file, Box::new(move || signal.notify_one()));
				let guard = ReleaseGuard::new(Arc::clone(throttler), id);
				tokio::select! {
					biased;
					_ = self.shutdown.cancelled() => return,
					_ = ready.notified() => {}
				}
				Some(guard)
			}
			None => None,
		};

		self.status.set_preamble(PreambleAction::Building);
		let started = Instant::now();
		let built = with_current(ctx.clone(), self.deps.engine.build_preamble(&self.file, &inputs)).await;
		match built {
			Ok(built) => {
				let build_time = started.elapsed();
				self.deps.stats.lock().entry(self.file.clone()).or_default().preamble_builds += 1;

				let mut includes: Vec<(PathBuf, Option<SystemTime>)> = Vec::with_capacity(built.includes.len() + built.missing.len());
				for path in &built.includes {
					includes.push((path.clone(), inputs.fs.timestamp(path)));
				}
				for path in &built.missing {
					includes.push((path.clone(), None));
				}

				let content_hash = preamble_content_hash(fingerprint, &includes);
				let preamble = Arc::new(Preamble {
					id: next_preamble_id(),
					version: inputs.version.clone(),
					command: inputs.command.clone(),
					payload: built.payload,
					size_bytes: built.size_bytes,
					content_hash,
					inputs_fingerprint: fingerprint,
					includes,
					build_time,
				});

				with_current(ctx.clone(), async {
					self.deps
						.callbacks
						.on_preamble_ast(&self.file, &preamble.version, &preamble.payload);
				})
				.await;

				// Headers without an authoritative command of their own
				// borrow this main file's command.
				let claimable: Vec<PathBuf> = built
					.includes
					.iter()
					.filter(|header| match self.deps.cdb.command_for(header) {
						Some(cmd) => cmd.is_heuristic(),
						None => true,
					})
					.cloned()
					.collect();
				self.deps.includer.update(&self.file, &inputs.command, &claimable);

				let newly_published = {
					let mut state = self.shared.state.lock();
					state.published = Some(Arc::clone(&preamble));
					let distinct = state.last_published_hash != Some(content_hash);
					state.last_published_hash = Some(content_hash);
					distinct
				};
				if newly_published {
					self.deps.callbacks.on_preamble_published(&self.file);
				}
				tracing::debug!(
					file = %self.file.display(),
					version = %preamble.version,
					bytes = preamble.size_bytes,
					ms = build_time.as_millis() as u64,
					"sched.preamble.build"
				);
			}
			Err(error) => {
				// The previously published preamble, if any, stays current.
				tracing::warn!(file = %self.file.display(), version = %inputs.version, error = %error, "sched.preamble.build_failed");
			}
		}
		self.status.set_preamble(PreambleAction::Idle);
		self.settle(inputs, want, ctx);
	}

	fn reusable(&self, fingerprint: u64, inputs: &ParseInputs) -> bool {
		let published = self.published();
		let Some(published) = published else { return false };
		if published.inputs_fingerprint != fingerprint {
			return false;
		}
		// A header that changed, appeared, or vanished since the build
		// invalidates the preamble. Headers the build never saw are not
		// checked.
		published
			.includes
			.iter()
			.all(|(path, stamp)| inputs.fs.timestamp(path) == *stamp)
	}

	/// On reuse, carries the published preamble forward to the new inputs'
	/// version so consistent readers observe it as current. Same build id,
	/// same content hash: not a republication.
	pub fn refresh_published_version(&self, inputs: &ParseInputs) {
		let mut state = self.shared.state.lock();
		if let Some(published) = &state.published {
			if published.version != inputs.version {
				state.published = Some(Arc::new(Preamble {
					id: published.id,
					version: inputs.version.clone(),
					command: inputs.command.clone(),
					payload: Arc::clone(&published.payload),
					size_bytes: published.size_bytes,
					content_hash: published.content_hash,
					inputs_fingerprint: published.inputs_fingerprint,
					includes: published.includes.clone(),
					build_time: published.build_time,
				}));
			}
		}
	}

	fn settle(&self, inputs: ParseInputs, want: WantDiagnostics, ctx: Context) {
		self.shared.state.lock().attempted = true;
		self.ast_queue.push_diag(DiagTask { inputs, want, ctx });
		self.shared.outcome_notify.notify_one();
	}
}

fn preamble_content_hash(fingerprint: u64, includes: &[(PathBuf, Option<SystemTime>)]) -> u64 {
	let mut hasher = DefaultHasher::new();
	fingerprint.hash(&mut hasher);
	for (path, stamp) in includes {
		path.hash(&mut hasher);
		stamp.hash(&mut hasher);
	}
	hasher.finish()
}
