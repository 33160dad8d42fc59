//! Test doubles for the scheduler's collaborators.
//!
//! A mock filesystem with mutable timestamps, a line-oriented mock engine
//! that resolves quoted includes against `-I` directories, and a mock
//! compile-command provider. Used by the crate's own scenario tests; public
//! so downstream crates can drive the scheduler in theirs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use keel_context::{Context, Key};
use lsp_types::Diagnostic;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::callbacks::{ParsingCallbacks, Publish};
use crate::engine::{BuiltAst, BuiltPreamble, FailedAst, InputsAndAst, ParseEngine, Preamble};
use crate::inputs::{CompileCommand, CompileCommands, ParseInputs, SnapshotFs};

/// Builds a bare diagnostic with just a message.
pub fn diag(message: impl Into<String>) -> Diagnostic {
	Diagnostic {
		message: message.into(),
		..Default::default()
	}
}

// ── Filesystem ──

/// In-memory snapshot filesystem with mutable timestamps.
#[derive(Default)]
pub struct MockFs {
	files: Mutex<HashMap<PathBuf, String>>,
	timestamps: Mutex<HashMap<PathBuf, SystemTime>>,
	token: AtomicU64,
}

impl MockFs {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
		self.files.lock().insert(path.into(), contents.into());
	}

	pub fn remove_file(&self, path: &Path) {
		self.files.lock().remove(path);
		self.timestamps.lock().remove(path);
	}

	/// Stamps `path` with an offset from the epoch, creating it if needed.
	pub fn set_timestamp(&self, path: impl Into<PathBuf>, seconds: u64) {
		let path = path.into();
		self.files.lock().entry(path.clone()).or_default();
		self.timestamps.lock().insert(path, UNIX_EPOCH + Duration::from_secs(seconds));
	}

	pub fn exists(&self, path: &Path) -> bool {
		self.files.lock().contains_key(path)
	}
}

impl SnapshotFs for MockFs {
	fn timestamp(&self, path: &Path) -> Option<SystemTime> {
		if let Some(stamp) = self.timestamps.lock().get(path) {
			return Some(*stamp);
		}
		self.files.lock().contains_key(path).then_some(UNIX_EPOCH)
	}

	fn snapshot_token(&self) -> u64 {
		self.token.load(Ordering::Acquire)
	}
}

// ── Engine ──

/// Opaque payload the mock engine attaches to preambles.
pub struct PreambleData {
	pub includes: Vec<PathBuf>,
	pub prefix: String,
}

/// Opaque payload the mock engine attaches to ASTs.
pub struct AstData {
	pub contents: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum GateKind {
	Preamble,
	Ast,
}

#[derive(Clone)]
struct GateInner {
	entered: Arc<Notify>,
	open: Arc<Notify>,
}

/// Blocks one mock build until the test opens it.
pub struct Gate {
	inner: GateInner,
}

impl Gate {
	/// Waits until the gated build has started.
	pub async fn wait_entered(&self) {
		self.inner.entered.notified().await;
	}

	/// Lets the gated build proceed.
	pub fn open(&self) {
		self.inner.open.notify_one();
	}
}

/// Line-oriented parser stand-in.
///
/// The preamble region is the leading run of blank and `#`-prefixed lines.
/// Quoted includes resolve against the including file's directory, then
/// `-I` directories from the compile command, in order. Unresolved includes
/// are diagnosed and recorded so their later appearance invalidates the
/// preamble. Contents containing `@syntax-error` fail the AST build.
pub struct MockEngine {
	fs: Arc<MockFs>,
	preamble_builds: AtomicU64,
	ast_builds: AtomicU64,
	fail_preambles: Mutex<HashSet<PathBuf>>,
	gates: Mutex<HashMap<(GateKind, String), GateInner>>,
}

impl MockEngine {
	pub fn new(fs: Arc<MockFs>) -> Arc<Self> {
		Arc::new(Self {
			fs,
			preamble_builds: AtomicU64::new(0),
			ast_builds: AtomicU64::new(0),
			fail_preambles: Mutex::new(HashSet::new()),
			gates: Mutex::new(HashMap::new()),
		})
	}

	pub fn total_preamble_builds(&self) -> u64 {
		self.preamble_builds.load(Ordering::SeqCst)
	}

	pub fn total_ast_builds(&self) -> u64 {
		self.ast_builds.load(Ordering::SeqCst)
	}

	/// All preamble builds for `file` fail until cleared.
	pub fn fail_preamble_for(&self, file: impl Into<PathBuf>) {
		self.fail_preambles.lock().insert(file.into());
	}

	/// Blocks the preamble build for inputs at `version`.
	pub fn gate_preamble(&self, version: impl Into<String>) -> Gate {
		self.gate(GateKind::Preamble, version.into())
	}

	/// Blocks the AST build for inputs at `version`.
	pub fn gate_ast(&self, version: impl Into<String>) -> Gate {
		self.gate(GateKind::Ast, version.into())
	}

	fn gate(&self, kind: GateKind, version: String) -> Gate {
		let inner = GateInner {
			entered: Arc::new(Notify::new()),
			open: Arc::new(Notify::new()),
		};
		self.gates.lock().insert((kind, version), inner.clone());
		Gate { inner }
	}

	async fn enter_gate(&self, kind: GateKind, version: &str) {
		let gate = self.gates.lock().get(&(kind, version.to_string())).cloned();
		if let Some(gate) = gate {
			gate.entered.notify_one();
			gate.open.notified().await;
		}
	}

	fn prefix_len(contents: &str) -> usize {
		let mut end = 0;
		for line in contents.split_inclusive('\n') {
			let trimmed = line.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') {
				end += line.len();
			} else {
				break;
			}
		}
		end
	}

	/// Resolves the quoted includes of the preamble region.
	fn scan_includes(&self, file: &Path, inputs: &ParseInputs, prefix: &str) -> (Vec<PathBuf>, Vec<PathBuf>, Vec<Diagnostic>) {
		let mut search_dirs: Vec<PathBuf> = Vec::new();
		if let Some(parent) = file.parent() {
			search_dirs.push(parent.to_path_buf());
		}
		for arg in &inputs.command.argv {
			if let Some(dir) = arg.strip_prefix("-I") {
				if !dir.is_empty() {
					search_dirs.push(PathBuf::from(dir));
				}
			}
		}

		let mut resolved = Vec::new();
		let mut missing = Vec::new();
		let mut diagnostics = Vec::new();
		for line in prefix.lines() {
			let trimmed = line.trim();
			let Some(rest) = trimmed.strip_prefix("#include") else { continue };
			let name = rest.trim().trim_matches('"');
			if name.is_empty() {
				continue;
			}
			let candidates: Vec<PathBuf> = search_dirs.iter().map(|dir| dir.join(name)).collect();
			match candidates.iter().find(|c| self.fs.exists(c)) {
				Some(hit) => resolved.push(hit.clone()),
				None => {
					// Record every miss so the include is re-checked when
					// any candidate appears.
					missing.extend(candidates);
					diagnostics.push(diag(format!("'{name}' file not found")));
				}
			}
		}
		(resolved, missing, diagnostics)
	}
}

#[async_trait]
impl ParseEngine for MockEngine {
	fn preamble_bounds(&self, contents: &str) -> usize {
		Self::prefix_len(contents)
	}

	async fn build_preamble(&self, file: &Path, inputs: &ParseInputs) -> std::result::Result<BuiltPreamble, String> {
		self.enter_gate(GateKind::Preamble, &inputs.version).await;
		if self.fail_preambles.lock().contains(file) {
			return Err("preamble build failed".to_string());
		}
		self.preamble_builds.fetch_add(1, Ordering::SeqCst);

		let prefix = &inputs.contents[..Self::prefix_len(&inputs.contents)];
		let (includes, missing, _diags) = self.scan_includes(file, inputs, prefix);
		Ok(BuiltPreamble {
			payload: Arc::new(PreambleData {
				includes: includes.clone(),
				prefix: prefix.to_string(),
			}),
			size_bytes: prefix.len(),
			includes,
			missing,
		})
	}

	async fn build_ast(
		&self,
		file: &Path,
		inputs: &ParseInputs,
		_preamble: Option<&Arc<Preamble>>,
	) -> std::result::Result<BuiltAst, FailedAst> {
		self.enter_gate(GateKind::Ast, &inputs.version).await;
		if inputs.contents.contains("@syntax-error") {
			return Err(FailedAst {
				message: "syntax error".to_string(),
				diagnostics: vec![diag("syntax error")],
			});
		}
		self.ast_builds.fetch_add(1, Ordering::SeqCst);

		let prefix = &inputs.contents[..Self::prefix_len(&inputs.contents)];
		let (_resolved, _missing, diagnostics) = self.scan_includes(file, inputs, prefix);
		Ok(BuiltAst {
			payload: Arc::new(AstData {
				contents: inputs.contents.to_string(),
			}),
			diagnostics,
			signals: Some(Arc::new(inputs.version.clone())),
		})
	}
}

// ── Compile commands ──

/// Mock compilation database.
#[derive(Default)]
pub struct MockCdb {
	commands: Mutex<HashMap<PathBuf, CompileCommand>>,
	without_command: Mutex<HashSet<PathBuf>>,
	extra_flags: Mutex<Vec<String>>,
	fail_all: AtomicBool,
}

impl MockCdb {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_command(&self, file: impl Into<PathBuf>, command: CompileCommand) {
		self.commands.lock().insert(file.into(), command);
	}

	/// `command_for(file)` returns `None` for this file.
	pub fn drop_command(&self, file: impl Into<PathBuf>) {
		self.without_command.lock().insert(file.into());
	}

	/// Appends a flag to every returned command.
	pub fn push_flag(&self, flag: impl Into<String>) {
		self.extra_flags.lock().push(flag.into());
	}

	/// When set, `command_for` returns `None` for every file.
	pub fn set_fail_all(&self, fail: bool) {
		self.fail_all.store(fail, Ordering::SeqCst);
	}

	fn base_command(&self, file: &Path) -> CompileCommand {
		let mut argv = vec!["cc".to_string()];
		argv.extend(self.extra_flags.lock().iter().cloned());
		argv.push(file.to_string_lossy().into_owned());
		CompileCommand {
			directory: PathBuf::from("/work"),
			argv,
			heuristic: None,
		}
	}
}

impl CompileCommands for MockCdb {
	fn command_for(&self, file: &Path) -> Option<CompileCommand> {
		if self.fail_all.load(Ordering::SeqCst) {
			return None;
		}
		if self.without_command.lock().contains(file) {
			return None;
		}
		if let Some(custom) = self.commands.lock().get(file) {
			let mut cmd = custom.clone();
			cmd.argv.extend(self.extra_flags.lock().iter().cloned());
			return Some(cmd);
		}
		Some(self.base_command(file))
	}

	fn fallback_for(&self, file: &Path) -> CompileCommand {
		let mut cmd = self.base_command(file);
		cmd.heuristic = Some("inferred command".to_string());
		cmd
	}
}

// ── Callbacks ──

/// Per-update diagnostics callback, carried through the update's context.
pub type DiagsCallback = Arc<dyn Fn(&Path, &[Diagnostic]) + Send + Sync>;

/// Context key the capture callbacks look up at publish time.
pub fn diags_key() -> &'static Key<DiagsCallback> {
	static KEY: OnceLock<Key<DiagsCallback>> = OnceLock::new();
	KEY.get_or_init(Key::new)
}

/// Parsing callbacks that forward published diagnostics to the callback
/// bound in the producing update's context.
#[derive(Default)]
pub struct CaptureDiags;

impl ParsingCallbacks for CaptureDiags {
	fn on_main_ast(&self, file: &Path, ast: &InputsAndAst, publish: Publish<'_>) {
		let Some(callback) = Context::current().get(diags_key()).cloned() else { return };
		let diagnostics = ast.ast.diagnostics.clone();
		publish.deliver(|| callback(file, &diagnostics));
	}

	fn on_failed_ast(&self, file: &Path, _version: &str, diagnostics: &[Diagnostic], publish: Publish<'_>) {
		let Some(callback) = Context::current().get(diags_key()).cloned() else { return };
		let diagnostics = diagnostics.to_vec();
		publish.deliver(|| callback(file, &diagnostics));
	}
}

/// ParseInputs against the mock filesystem.
pub fn test_inputs(fs: &Arc<MockFs>, contents: &str, version: &str) -> ParseInputs {
	let fs: Arc<dyn SnapshotFs> = fs.clone();
	ParseInputs {
		contents: Arc::from(contents),
		version: version.to_string(),
		command: CompileCommand::default(),
		fs,
		force_rebuild: false,
	}
}
