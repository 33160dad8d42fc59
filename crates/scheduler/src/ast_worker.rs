//! Per-file AST worker.
//!
//! Owns the file's operation queue and drives the update → preamble →
//! diagnostics pipeline. Reads run against the last built AST when the
//! inputs still match, adopt a cached AST when one fits, and rebuild inline
//! otherwise. Diagnostics for a cancelled update are owed: the next build of
//! those inputs publishes them under the update's captured context.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_context::{cancelled, with_current, CancelReason, Context};
use lsp_types::Diagnostic;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::{AstCache, CachedAst};
use crate::callbacks::{AstAction, AstActionKind, ParsingCallbacks, Publish, PublishState, StatusCell};
use crate::debounce::DebouncePolicy;
use crate::engine::{Ast, InputsAndAst, InputsAndPreamble, OpaquePayload, ParseEngine, Preamble};
use crate::error::SchedError;
use crate::includer::IncluderCache;
use crate::inputs::{CompileCommand, CompileCommands, ParseInputs};
use crate::preamble::PreambleWorker;
use crate::queue::{DiagTask, Next, Op, OpQueue, PreambleConsistency, ReadAstOp, ReadPreambleOp, UpdateOp, WantDiagnostics};
use crate::throttle::PreambleThrottler;
use crate::trace::{Tracer, AST_ACCESS_DIAG, AST_ACCESS_READ, HIT, MISS};
use crate::FileStats;

/// Build history window feeding the debounce policy.
const BUILD_HISTORY: usize = 10;

/// Collaborators and configuration shared by every worker.
pub(crate) struct WorkerDeps {
	pub engine: Arc<dyn ParseEngine>,
	pub cdb: Arc<dyn CompileCommands>,
	pub callbacks: Arc<dyn ParsingCallbacks>,
	pub includer: Arc<IncluderCache>,
	pub cache: Arc<AstCache>,
	pub stats: Arc<Mutex<HashMap<PathBuf, FileStats>>>,
	pub tracer: Arc<dyn Tracer>,
	pub throttler: Option<Arc<dyn PreambleThrottler>>,
	pub debounce: DebouncePolicy,
	pub sync: bool,
}

/// The most recent AST build attempt and the inputs it was made from.
struct BuildRecord {
	inputs: ParseInputs,
	fingerprint: u64,
	preamble_id: Option<u64>,
	version: String,
	report_hash: u64,
	ast: Option<Arc<Ast>>,
	failed_diags: Vec<Diagnostic>,
	error: Option<String>,
}

/// Diagnostics skipped by a cancelled update, published by the next build
/// of the same inputs under the update's context.
struct OwedDiags {
	want: WantDiagnostics,
	ctx: Context,
}

pub(crate) struct AstWorker {
	file: PathBuf,
	queue: Arc<OpQueue>,
	preamble: PreambleWorker,
	deps: Arc<WorkerDeps>,
	publish: Arc<Mutex<PublishState>>,
	status: Arc<StatusCell>,
	shutdown: CancellationToken,

	current_inputs: Option<ParseInputs>,
	last_build: Option<BuildRecord>,
	latest_signals: Option<OpaquePayload>,
	owed: Option<OwedDiags>,
	history: VecDeque<Duration>,
}

enum Served {
	Ast(Arc<Ast>),
	Failed(String),
}

impl AstWorker {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		file: PathBuf,
		queue: Arc<OpQueue>,
		preamble: PreambleWorker,
		deps: Arc<WorkerDeps>,
		publish: Arc<Mutex<PublishState>>,
		status: Arc<StatusCell>,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			file,
			queue,
			preamble,
			deps,
			publish,
			status,
			shutdown,
			current_inputs: None,
			last_build: None,
			latest_signals: None,
			owed: None,
			history: VecDeque::new(),
		}
	}

	/// Worker loop; one task per file in asynchronous mode.
	pub async fn run(mut self) {
		loop {
			let next = tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => break,
				next = self.queue.recv() => next,
			};
			let proceed = self.dispatch(next).await;
			self.queue.done();
			if self.queue.is_idle() {
				self.status.set_ast(AstAction::idle());
			}
			if !proceed {
				break;
			}
		}
		self.shutdown_now();
	}

	/// Processes everything currently queued. Synchronous-mode driver.
	pub async fn drain_inline(&mut self) {
		while let Some(next) = self.queue.try_recv() {
			let proceed = self.dispatch(next).await;
			self.queue.done();
			if !proceed {
				break;
			}
		}
		if self.queue.is_idle() {
			self.status.set_ast(AstAction::idle());
		}
	}

	async fn dispatch(&mut self, next: Next) -> bool {
		match next {
			Next::Diag(task) => self.process_diag(task).await,
			Next::Op(Op::Update(update)) => self.process_update(update).await,
			Next::Op(Op::ReadAst(read)) => self.process_read_ast(read).await,
			Next::Op(Op::ReadPreamble(read)) => self.process_read_preamble(read).await,
			Next::Closed => return false,
		}
		true
	}

	/// Delivers shutdown cancellations to everything still queued. Dead
	/// update callbacks never fire.
	pub fn shutdown_now(&mut self) {
		for op in self.queue.drain() {
			match op {
				Op::ReadAst(read) => (read.callback)(Err(SchedError::Cancelled(CancelReason::Shutdown))),
				Op::ReadPreamble(read) => (read.callback)(Err(SchedError::Cancelled(CancelReason::Shutdown))),
				Op::Update(_) => {}
			}
		}
		self.publish.lock().closed = true;
		self.queue.done();
		self.status.set_ast(AstAction::idle());
	}

	// ── Updates ──

	async fn process_update(&mut self, update: UpdateOp) {
		self.status.set_ast(AstAction {
			kind: AstActionKind::RunningAction,
			name: "Update".to_string(),
		});
		let UpdateOp { mut inputs, want, ctx, .. } = update;

		inputs.command = self.resolve_command();
		let fingerprint = inputs.fingerprint();
		if self.last_build.as_ref().is_some_and(|b| b.fingerprint != fingerprint) {
			// The cached snapshot no longer matches any future request.
			self.deps.cache.remove(&self.file);
		}
		self.current_inputs = Some(inputs.clone());
		tracing::debug!(file = %self.file.display(), version = %inputs.version, want = ?want, "sched.update");

		if cancelled(&ctx).is_some() {
			// Skip the build but remember that diagnostics are owed; a
			// later read that builds these inputs publishes them.
			self.owed = Some(OwedDiags { want, ctx });
			return;
		}

		// No-op update: the last build still matches these inputs and the
		// published preamble is valid, so nothing is forwarded and nothing
		// waits out a debounce window. If the stored report was never
		// delivered, it is published right here.
		let preamble_id = self.preamble.published().map(|p| p.id);
		let noop = !inputs.force_rebuild
			&& self
				.last_build
				.as_ref()
				.is_some_and(|b| b.fingerprint == fingerprint && b.preamble_id == preamble_id)
			&& self.preamble.up_to_date(&inputs);
		if noop {
			tracing::debug!(file = %self.file.display(), version = %inputs.version, "sched.update.noop");
			self.preamble.refresh_published_version(&inputs);
			if want != WantDiagnostics::No {
				let report_hash = self.last_build.as_ref().map(|b| b.report_hash);
				if self.publish.lock().delivered_hash != report_hash {
					self.deps.tracer.metric(AST_ACCESS_DIAG, HIT);
					self.emit_record(want, &ctx).await;
				}
			}
			return;
		}

		self.preamble.request(inputs, want, ctx).await;
		if !self.preamble.has_outcome() {
			// First update of the file: block until the first preamble
			// attempt settles so the initial build has it available.
			let _ = self.preamble.wait_first_outcome().await;
		}
	}

	/// Compile command resolution at update execution time: the file's own
	/// authoritative command, else a validated includer association, else
	/// the file's own heuristic command, else the fallback.
	fn resolve_command(&self) -> CompileCommand {
		let own = self.deps.cdb.command_for(&self.file);
		if let Some(cmd) = &own {
			if !cmd.is_heuristic() {
				return cmd.clone();
			}
		}
		if let Some(assoc) = self.deps.includer.get(&self.file) {
			if self.deps.cdb.command_for(&assoc.main).is_some() {
				return assoc.command;
			}
			// The main file vanished from the database; drop everything
			// rooted at it.
			self.deps.includer.invalidate_main(&assoc.main);
		}
		own.unwrap_or_else(|| self.deps.cdb.fallback_for(&self.file))
	}

	// ── Preamble-driven diagnostics ──

	async fn process_diag(&mut self, task: DiagTask) {
		let DiagTask { inputs, want, ctx } = task;

		// Coalescable reports are abandoned once newer work is queued;
		// explicitly requested reports always run.
		if want != WantDiagnostics::Yes && self.superseded() {
			return;
		}

		if want == WantDiagnostics::Auto && !self.deps.sync {
			let history: Vec<Duration> = self.history.iter().copied().collect();
			let delay = self.deps.debounce.compute(&history);
			let deadline = tokio::time::Instant::now() + delay;
			loop {
				tokio::select! {
					biased;
					_ = self.shutdown.cancelled() => return,
					_ = tokio::time::sleep_until(deadline) => break,
					_ = self.queue.wait_arrival() => {
						if self.superseded() {
							return;
						}
					}
				}
			}
		}

		if want == WantDiagnostics::No {
			// The AST is built lazily by the next read.
			return;
		}

		if cancelled(&ctx).is_some() {
			self.owed = Some(OwedDiags { want, ctx });
			return;
		}

		self.build_diagnostics(inputs, want, ctx).await;
	}

	fn superseded(&self) -> bool {
		self.queue.has_pending_update() || self.queue.has_pending_diag()
	}

	async fn build_diagnostics(&mut self, inputs: ParseInputs, want: WantDiagnostics, ctx: Context) {
		let fingerprint = inputs.fingerprint();
		let published = self.preamble.published();
		let preamble_id = published.as_ref().map(|p| p.id);

		let reusable = !inputs.force_rebuild
			&& self
				.last_build
				.as_ref()
				.is_some_and(|b| b.fingerprint == fingerprint && b.preamble_id == preamble_id);
		if reusable {
			let report_hash = self.last_build.as_ref().map(|b| b.report_hash);
			if self.publish.lock().delivered_hash == report_hash {
				// This exact report has already been delivered.
				return;
			}
			self.deps.tracer.metric(AST_ACCESS_DIAG, HIT);
			self.emit_record(want, &ctx).await;
		} else {
			self.deps.tracer.metric(AST_ACCESS_DIAG, MISS);
			self.status.set_ast(AstAction {
				kind: AstActionKind::Building,
				name: inputs.version.clone(),
			});
			self.build_ast(&inputs, published.as_ref()).await;
			self.emit_record(want, &ctx).await;
		}
		self.owed = None;
	}

	/// Invokes the consumer's AST callback for the last build, with a
	/// publish handle carrying the diagnostics gate decision.
	async fn emit_record(&self, want: WantDiagnostics, ctx: &Context) {
		let Some(record) = &self.last_build else { return };
		let allowed = match want {
			WantDiagnostics::Yes => true,
			WantDiagnostics::Auto => self.publish.lock().delivered_hash != Some(record.report_hash),
			WantDiagnostics::No => false,
		};
		let publish = Publish {
			allowed,
			report_hash: record.report_hash,
			state: self.publish.as_ref(),
		};
		match &record.ast {
			Some(ast) => {
				let bundle = InputsAndAst {
					inputs: record.inputs.clone(),
					ast: Arc::clone(ast),
				};
				with_current(ctx.clone(), async {
					self.deps.callbacks.on_main_ast(&self.file, &bundle, publish);
				})
				.await;
			}
			None => {
				with_current(ctx.clone(), async {
					self.deps
						.callbacks
						.on_failed_ast(&self.file, &record.version, &record.failed_diags, publish);
				})
				.await;
			}
		}
	}

	/// One engine AST build; records the outcome as the current build.
	async fn build_ast(&mut self, inputs: &ParseInputs, preamble: Option<&Arc<Preamble>>) -> bool {
		let started = Instant::now();
		let built = self.deps.engine.build_ast(&self.file, inputs, preamble).await;
		let elapsed = started.elapsed();
		if self.history.len() >= BUILD_HISTORY {
			self.history.pop_front();
		}
		self.history.push_back(elapsed);

		let fingerprint = inputs.fingerprint();
		let preamble_id = preamble.map(|p| p.id);
		let report_hash = report_hash(inputs);
		match built {
			Ok(built) => {
				self.deps.stats.lock().entry(self.file.clone()).or_default().ast_builds += 1;
				let ast = Arc::new(Ast {
					version: inputs.version.clone(),
					preamble_version: preamble.map(|p| p.version.clone()),
					payload: built.payload,
					diagnostics: built.diagnostics,
				});
				self.deps.cache.put(
					&self.file,
					CachedAst {
						ast: Arc::clone(&ast),
						fingerprint,
						preamble_id,
					},
				);
				self.latest_signals = built.signals;
				self.last_build = Some(BuildRecord {
					inputs: inputs.clone(),
					fingerprint,
					preamble_id,
					version: inputs.version.clone(),
					report_hash,
					ast: Some(ast),
					failed_diags: Vec::new(),
					error: None,
				});
				tracing::debug!(
					file = %self.file.display(),
					version = %inputs.version,
					ms = elapsed.as_millis() as u64,
					"sched.ast.build"
				);
				true
			}
			Err(failed) => {
				tracing::warn!(file = %self.file.display(), version = %inputs.version, error = %failed.message, "sched.ast.build_failed");
				self.last_build = Some(BuildRecord {
					inputs: inputs.clone(),
					fingerprint,
					preamble_id,
					version: inputs.version.clone(),
					report_hash,
					ast: None,
					failed_diags: failed.diagnostics,
					error: Some(failed.message),
				});
				false
			}
		}
	}

	// ── Reads ──

	async fn process_read_ast(&mut self, read: ReadAstOp) {
		self.status.set_ast(AstAction {
			kind: AstActionKind::RunningAction,
			name: read.name.clone(),
		});
		let ReadAstOp { ctx, callback, .. } = read;

		if let Some(reason) = cancelled(&ctx) {
			(callback)(Err(SchedError::Cancelled(reason)));
			return;
		}
		let Some(inputs) = self.current_inputs.clone() else {
			(callback)(Err(SchedError::FileNotTracked(self.file.clone())));
			return;
		};

		let fingerprint = inputs.fingerprint();
		let matches_last = self.last_build.as_ref().is_some_and(|b| b.fingerprint == fingerprint);
		let mut rebuilt = false;
		if !matches_last {
			if let Some(adopted) = self.deps.cache.take_if_matches(&self.file, fingerprint) {
				self.last_build = Some(BuildRecord {
					inputs: inputs.clone(),
					fingerprint,
					preamble_id: adopted.preamble_id,
					version: adopted.ast.version.clone(),
					report_hash: report_hash(&inputs),
					ast: Some(adopted.ast),
					failed_diags: Vec::new(),
					error: None,
				});
			} else {
				rebuilt = true;
				self.deps.tracer.metric(AST_ACCESS_READ, MISS);
				if !self.preamble.has_outcome() && !self.preamble.wait_first_outcome().await {
					(callback)(Err(SchedError::Cancelled(CancelReason::Shutdown)));
					return;
				}
				let published = self.preamble.published();
				self.status.set_ast(AstAction {
					kind: AstActionKind::Building,
					name: inputs.version.clone(),
				});
				self.build_ast(&inputs, published.as_ref()).await;
			}
		}
		if !rebuilt {
			self.deps.tracer.metric(AST_ACCESS_READ, HIT);
		}

		let served = match &self.last_build {
			Some(record) if record.fingerprint == fingerprint => match &record.ast {
				Some(ast) => Served::Ast(Arc::clone(ast)),
				None => Served::Failed(record.error.clone().unwrap_or_default()),
			},
			_ => Served::Failed("no build for current inputs".to_string()),
		};

		if let Served::Ast(_) = &served {
			// A cancelled update owes diagnostics for exactly these inputs;
			// this build settles the debt under the update's context.
			if let Some(owed) = self.owed.take() {
				self.emit_record(owed.want, &owed.ctx).await;
			}
		}

		with_current(ctx, async {
			match served {
				Served::Ast(ast) => (callback)(Ok(InputsAndAst { inputs, ast })),
				Served::Failed(error) => (callback)(Err(SchedError::Parse(error))),
			}
		})
		.await;
	}

	async fn process_read_preamble(&mut self, read: ReadPreambleOp) {
		self.status.set_ast(AstAction {
			kind: AstActionKind::RunningAction,
			name: read.name.clone(),
		});
		let ReadPreambleOp { ctx, consistency, callback, .. } = read;

		if let Some(reason) = cancelled(&ctx) {
			(callback)(Err(SchedError::Cancelled(reason)));
			return;
		}
		let Some(inputs) = self.current_inputs.clone() else {
			(callback)(Err(SchedError::FileNotTracked(self.file.clone())));
			return;
		};

		let waited: Result<Option<Arc<Preamble>>, SchedError> = match consistency {
			PreambleConsistency::Stale => match self.preamble.wait_published().await {
				Some(preamble) => Ok(Some(preamble)),
				None => Err(SchedError::Cancelled(CancelReason::Shutdown)),
			},
			PreambleConsistency::StaleOrAbsent => {
				if !self.preamble.has_outcome() {
					let _ = self.preamble.wait_first_outcome().await;
				}
				Ok(self.preamble.published())
			}
			PreambleConsistency::Consistent => loop {
				if let Some(published) = self.preamble.published() {
					if published.version == inputs.version {
						break Ok(Some(published));
					}
				}
				tokio::select! {
					biased;
					_ = self.shutdown.cancelled() => break Err(SchedError::Cancelled(CancelReason::Shutdown)),
					_ = self.preamble.outcome_event() => {}
				}
			},
		};

		let signals = self.latest_signals.clone();
		with_current(ctx, async {
			match waited {
				Ok(preamble) => (callback)(Ok(InputsAndPreamble {
					command: inputs.command.clone(),
					inputs,
					preamble,
					signals,
				})),
				Err(error) => (callback)(Err(error)),
			}
		})
		.await;
	}
}

/// Content hash of the inputs a diagnostics report was produced from.
fn report_hash(inputs: &ParseInputs) -> u64 {
	let mut hasher = DefaultHasher::new();
	inputs.contents.hash(&mut hasher);
	inputs.command.directory.hash(&mut hasher);
	inputs.command.argv.hash(&mut hasher);
	hasher.finish()
}
