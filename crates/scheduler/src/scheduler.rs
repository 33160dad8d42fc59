//! Scheduler facade: owns the per-file workers and dispatches operations.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use keel_context::{cancelable, with_current, Context, Key};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ast_worker::{AstWorker, WorkerDeps};
use crate::cache::AstCache;
use crate::callbacks::{AstAction, AstActionKind, ParsingCallbacks, PublishState, StatusCell};
use crate::debounce::DebouncePolicy;
use crate::engine::{InputsAndAst, InputsAndPreamble, ParseEngine};
use crate::error::{Result, SchedError};
use crate::includer::IncluderCache;
use crate::inputs::{CompileCommands, ParseInputs};
use crate::preamble::PreambleWorker;
use crate::queue::{Invalidation, Op, OpQueue, PreambleConsistency, ReadAstOp, ReadPreambleOp, WantDiagnostics};
use crate::throttle::PreambleThrottler;
use crate::trace::{NoopTracer, Tracer};
use crate::FileStats;

/// Derives a per-file context for every task bound to that file.
pub type ContextProvider = Arc<dyn Fn(&Path, &Context) -> Context + Send + Sync>;

/// Bound on retained ASTs across all files.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
	pub max_retained_asts: usize,
}

impl Default for RetentionPolicy {
	fn default() -> Self {
		Self { max_retained_asts: 3 }
	}
}

/// Scheduler configuration, consumed at construction.
pub struct SchedulerOptions {
	/// Zero selects synchronous mode: operations execute their effects
	/// inline before returning and no tasks are spawned.
	pub async_workers: usize,
	/// Delay policy between an update and its diagnostics rebuild.
	pub update_debounce: DebouncePolicy,
	pub retention: RetentionPolicy,
	/// Attaches host metadata to every file-bound task context.
	pub context_provider: Option<ContextProvider>,
	/// Optional global admission gate for preamble builds.
	pub throttler: Option<Arc<dyn PreambleThrottler>>,
	/// Metric sink; defaults to a no-op.
	pub tracer: Arc<dyn Tracer>,
}

impl Default for SchedulerOptions {
	fn default() -> Self {
		Self {
			async_workers: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4),
			update_debounce: DebouncePolicy::default(),
			retention: RetentionPolicy::default(),
			context_provider: None,
			throttler: None,
			tracer: Arc::new(NoopTracer),
		}
	}
}

fn file_key() -> &'static Key<PathBuf> {
	static KEY: OnceLock<Key<PathBuf>> = OnceLock::new();
	KEY.get_or_init(Key::new)
}

struct FileEntry {
	queue: Arc<OpQueue>,
	preamble: PreambleWorker,
	token: CancellationToken,
	publish: Arc<Mutex<PublishState>>,
	status: Arc<StatusCell>,
	/// Worker tasks in asynchronous mode.
	tasks: Mutex<Vec<JoinHandle<()>>>,
	/// Inline-driven worker in synchronous mode.
	sync_worker: Option<tokio::sync::Mutex<AstWorker>>,
}

impl FileEntry {
	fn report_queued(&self, name: &str) {
		self.status.set_ast(AstAction {
			kind: AstActionKind::Queued,
			name: name.to_string(),
		});
	}
}

/// Per-file build scheduler.
///
/// Fans public operations out to per-file worker pairs, multiplexes reads
/// against the artifacts they produce, and keeps rebuilds bounded through
/// debouncing, coalescing, and the shared AST cache.
pub struct Scheduler {
	deps: Arc<WorkerDeps>,
	context_provider: Option<ContextProvider>,
	files: Mutex<HashMap<PathBuf, Arc<FileEntry>>>,
	last_active: Mutex<PathBuf>,
	aux_active: Arc<AtomicUsize>,
	/// Worker tasks of removed files, still draining.
	zombies: Mutex<Vec<JoinHandle<()>>>,
	root_token: CancellationToken,
}

impl Scheduler {
	pub fn new(
		engine: Arc<dyn ParseEngine>,
		cdb: Arc<dyn CompileCommands>,
		callbacks: Arc<dyn ParsingCallbacks>,
		options: SchedulerOptions,
	) -> Self {
		let deps = Arc::new(WorkerDeps {
			engine,
			cdb,
			callbacks,
			includer: Arc::new(IncluderCache::new()),
			cache: Arc::new(AstCache::new(options.retention.max_retained_asts)),
			stats: Arc::new(Mutex::new(HashMap::new())),
			tracer: options.tracer,
			throttler: options.throttler,
			debounce: options.update_debounce,
			sync: options.async_workers == 0,
		});
		Self {
			deps,
			context_provider: options.context_provider,
			files: Mutex::new(HashMap::new()),
			last_active: Mutex::new(PathBuf::new()),
			aux_active: Arc::new(AtomicUsize::new(0)),
			zombies: Mutex::new(Vec::new()),
			root_token: CancellationToken::new(),
		}
	}

	/// File bound to the currently executing scheduler task, if any.
	pub fn file_being_processed_in_context() -> Option<PathBuf> {
		Context::current().get(file_key()).cloned()
	}

	/// Schedules an update of `file` to `inputs`. Fire-and-forget: the
	/// diagnostics policy decides whether a report is ever published.
	pub async fn update(&self, file: &Path, inputs: ParseInputs, want: WantDiagnostics) {
		let entry = self.entry_or_create(file);
		let ctx = self.task_context(file);
		let content_changed = entry.queue.push_update(inputs, want, ctx);
		if content_changed {
			*self.last_active.lock() = file.to_path_buf();
		}
		self.drive(&entry).await;
	}

	/// Tears down `file`'s workers. Queued operations are cancelled with
	/// `Shutdown`; the running one completes. No-op for unknown files.
	pub async fn remove(&self, file: &Path) {
		let entry = self.files.lock().remove(file);
		let Some(entry) = entry else { return };
		entry.queue.close();
		entry.token.cancel();
		if let Some(worker) = &entry.sync_worker {
			worker.lock().await.shutdown_now();
		} else {
			let mut tasks = entry.tasks.lock();
			self.zombies.lock().append(&mut tasks);
		}
		self.deps.cache.remove(file);
		tracing::debug!(file = %file.display(), "sched.remove");
	}

	/// Runs `action` with the file's AST once the worker reaches it.
	///
	/// The action receives `FileNotTracked` for unknown files, a
	/// cancellation error, or a parse error; it is invoked exactly once and
	/// never silently dropped.
	pub async fn run_with_ast<F>(&self, name: &str, file: &Path, invalidation: Invalidation, action: F)
	where
		F: FnOnce(Result<InputsAndAst>) + Send + 'static,
	{
		let entry = self.files.lock().get(file).cloned();
		let Some(entry) = entry else {
			action(Err(SchedError::FileNotTracked(file.to_path_buf())));
			return;
		};
		*self.last_active.lock() = file.to_path_buf();

		let base = self.task_context(file);
		let (ctx, cancel) = match invalidation {
			Invalidation::OnUpdate => {
				let (ctx, handle) = cancelable(&base);
				(ctx, Some(handle))
			}
			Invalidation::None => (base, None),
		};
		let op = Op::ReadAst(ReadAstOp {
			name: name.to_string(),
			ctx,
			cancel,
			invalidation,
			callback: Box::new(action),
		});
		match entry.queue.push_op(op) {
			Ok(queued_behind) => {
				if queued_behind {
					entry.report_queued(name);
				}
			}
			Err(op) => {
				reject(op, file);
				return;
			}
		}
		self.drive(&entry).await;
	}

	/// Runs `action` with the current inputs and a preamble satisfying
	/// `consistency`.
	pub async fn run_with_preamble<F>(&self, name: &str, file: &Path, consistency: PreambleConsistency, action: F)
	where
		F: FnOnce(Result<InputsAndPreamble>) + Send + 'static,
	{
		let entry = self.files.lock().get(file).cloned();
		let Some(entry) = entry else {
			action(Err(SchedError::FileNotTracked(file.to_path_buf())));
			return;
		};
		*self.last_active.lock() = file.to_path_buf();

		let op = Op::ReadPreamble(ReadPreambleOp {
			name: name.to_string(),
			ctx: self.task_context(file),
			consistency,
			callback: Box::new(action),
		});
		match entry.queue.push_op(op) {
			Ok(queued_behind) => {
				if queued_behind {
					entry.report_queued(name);
				}
			}
			Err(op) => {
				reject(op, file);
				return;
			}
		}
		self.drive(&entry).await;
	}

	/// Runs `task` on the auxiliary pool. `file` only binds context; when
	/// absent, the most recently active file is bound instead.
	pub async fn run<F>(&self, name: &str, file: Option<&Path>, task: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.run_on_aux(name, file, task).await;
	}

	/// Like [`Self::run`] for short-lived tasks that should not queue
	/// behind long operations.
	pub async fn run_quick<F>(&self, name: &str, file: Option<&Path>, task: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.run_on_aux(name, file, task).await;
	}

	async fn run_on_aux<F>(&self, name: &str, file: Option<&Path>, task: F)
	where
		F: FnOnce() + Send + 'static,
	{
		let bound = match file {
			Some(path) if !path.as_os_str().is_empty() => {
				*self.last_active.lock() = path.to_path_buf();
				path.to_path_buf()
			}
			_ => self.last_active.lock().clone(),
		};
		let ctx = self.task_context(&bound);
		if self.deps.sync {
			with_current(ctx, async move { task() }).await;
			return;
		}

		let active = Arc::clone(&self.aux_active);
		active.fetch_add(1, Ordering::AcqRel);
		let name = name.to_string();
		let _ = tokio::spawn(async move {
			struct ActiveGuard(Arc<AtomicUsize>);
			impl Drop for ActiveGuard {
				fn drop(&mut self) {
					self.0.fetch_sub(1, Ordering::AcqRel);
				}
			}
			let _guard = ActiveGuard(active);
			tracing::trace!(task = %name, "sched.aux.run");
			with_current(ctx, async move { task() }).await;
		});
	}

	/// Waits until every worker is idle: no queued or running items, no
	/// pending preamble work, no auxiliary tasks, no draining removals.
	pub async fn block_until_idle(&self, timeout: Duration) -> bool {
		if self.deps.sync {
			return true;
		}
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			if self.is_idle() {
				return true;
			}
			if tokio::time::Instant::now() >= deadline {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(4)).await;
		}
	}

	/// Per-file build counters. Cumulative across remove/re-add.
	pub fn file_stats(&self) -> HashMap<PathBuf, FileStats> {
		self.deps.stats.lock().clone()
	}

	/// Files currently holding an entry in the AST cache.
	pub fn files_with_cached_ast(&self) -> Vec<PathBuf> {
		self.deps.cache.cached_files()
	}

	/// The compile command the scheduler would use for `file` right now:
	/// the file's own authoritative command, a validated includer
	/// association, or a fallback.
	pub fn get_compile_command(&self, file: &Path) -> crate::inputs::CompileCommand {
		if let Some(cmd) = self.deps.cdb.command_for(file) {
			if !cmd.is_heuristic() {
				return cmd;
			}
		}
		if let Some(assoc) = self.deps.includer.get(file) {
			if self.deps.cdb.command_for(&assoc.main).is_some() {
				return assoc.command;
			}
			self.deps.includer.invalidate_main(&assoc.main);
		}
		self.deps
			.cdb
			.command_for(file)
			.unwrap_or_else(|| self.deps.cdb.fallback_for(file))
	}

	/// Stops all workers and waits for them to drain. Queued operations
	/// receive `Shutdown`; outstanding throttler acquisitions are released.
	pub async fn shutdown(&self) {
		self.root_token.cancel();
		let entries: Vec<Arc<FileEntry>> = self.files.lock().drain().map(|(_, entry)| entry).collect();
		for entry in &entries {
			entry.queue.close();
		}
		for entry in entries {
			if let Some(worker) = &entry.sync_worker {
				worker.lock().await.shutdown_now();
			}
			let tasks: Vec<JoinHandle<()>> = entry.tasks.lock().drain(..).collect();
			for task in tasks {
				let _ = task.await;
			}
			entry.publish.lock().closed = true;
		}
		let zombies: Vec<JoinHandle<()>> = self.zombies.lock().drain(..).collect();
		for task in zombies {
			let _ = task.await;
		}
		while self.aux_active.load(Ordering::Acquire) != 0 {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
	}

	fn is_idle(&self) -> bool {
		if self.aux_active.load(Ordering::Acquire) != 0 {
			return false;
		}
		{
			let files = self.files.lock();
			for entry in files.values() {
				if !entry.queue.is_idle() || !entry.preamble.is_idle() {
					return false;
				}
			}
		}
		let mut zombies = self.zombies.lock();
		zombies.retain(|task| !task.is_finished());
		zombies.is_empty()
	}

	fn task_context(&self, file: &Path) -> Context {
		let base = Context::current();
		let derived = match &self.context_provider {
			Some(provider) => provider(file, &base),
			None => base,
		};
		derived.derive(file_key(), file.to_path_buf())
	}

	fn entry_or_create(&self, file: &Path) -> Arc<FileEntry> {
		let mut files = self.files.lock();
		if let Some(entry) = files.get(file) {
			return Arc::clone(entry);
		}
		let entry = self.create_entry(file);
		files.insert(file.to_path_buf(), Arc::clone(&entry));
		entry
	}

	fn create_entry(&self, file: &Path) -> Arc<FileEntry> {
		let queue = Arc::new(OpQueue::new());
		let token = self.root_token.child_token();
		let status = Arc::new(StatusCell::new(file.to_path_buf(), Arc::clone(&self.deps.callbacks)));
		let publish = Arc::new(Mutex::new(PublishState {
			delivered_hash: None,
			closed: false,
		}));
		let preamble = PreambleWorker::new(
			file.to_path_buf(),
			Arc::clone(&self.deps),
			Arc::clone(&queue),
			Arc::clone(&status),
			token.clone(),
		);
		let worker = AstWorker::new(
			file.to_path_buf(),
			Arc::clone(&queue),
			preamble.clone(),
			Arc::clone(&self.deps),
			Arc::clone(&publish),
			Arc::clone(&status),
			token.clone(),
		);
		let (tasks, sync_worker) = if self.deps.sync {
			(Vec::new(), Some(tokio::sync::Mutex::new(worker)))
		} else {
			// Public operations are async, so worker tasks always have an
			// ambient runtime to land on.
			let preamble_task = tokio::spawn(preamble.clone().run());
			let ast_task = tokio::spawn(worker.run());
			(vec![preamble_task, ast_task], None)
		};
		tracing::debug!(file = %file.display(), "sched.track");
		Arc::new(FileEntry {
			queue,
			preamble,
			token,
			publish,
			status,
			tasks: Mutex::new(tasks),
			sync_worker,
		})
	}

	/// In synchronous mode, executes everything just enqueued before
	/// returning to the caller.
	async fn drive(&self, entry: &FileEntry) {
		let Some(worker) = &entry.sync_worker else { return };
		worker.lock().await.drain_inline().await;
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		self.root_token.cancel();
		for entry in self.files.lock().values() {
			entry.queue.close();
		}
	}
}

fn reject(op: Op, file: &Path) {
	let err = || SchedError::FileNotTracked(file.to_path_buf());
	match op {
		Op::ReadAst(read) => (read.callback)(Err(err())),
		Op::ReadPreamble(read) => (read.callback)(Err(err())),
		Op::Update(_) => {}
	}
}
