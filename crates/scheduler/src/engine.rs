//! Artifacts and the outward contract to the parser.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lsp_types::Diagnostic;

use crate::inputs::{CompileCommand, ParseInputs};

/// Opaque parser payload carried by artifacts. The engine downcasts it back.
pub type OpaquePayload = Arc<dyn Any + Send + Sync>;

/// Preamble build output handed back by the engine.
pub struct BuiltPreamble {
	/// Parser-owned payload.
	pub payload: OpaquePayload,
	/// Serialized size in bytes, for retention accounting.
	pub size_bytes: usize,
	/// Headers the preamble resolved and read.
	pub includes: Vec<PathBuf>,
	/// Includes that could not be resolved at build time. Their later
	/// appearance invalidates the preamble.
	pub missing: Vec<PathBuf>,
}

/// AST build output handed back by the engine.
pub struct BuiltAst {
	/// Parser-owned payload.
	pub payload: OpaquePayload,
	/// Diagnostics produced by the build.
	pub diagnostics: Vec<Diagnostic>,
	/// Derived signals (e.g. symbol usage) published to preamble readers.
	pub signals: Option<OpaquePayload>,
}

/// AST build failure that still produced diagnostics.
pub struct FailedAst {
	/// Why the build failed.
	pub message: String,
	/// Diagnostics worth reporting despite the failure.
	pub diagnostics: Vec<Diagnostic>,
}

/// The parser collaborator.
///
/// The scheduler guarantees the engine is never invoked re-entrantly for one
/// file: preamble builds are serialized by the preamble worker and AST builds
/// by the AST worker.
#[async_trait]
pub trait ParseEngine: Send + Sync {
	/// Length in bytes of the leading region that feeds the preamble
	/// (the include/import prefix). Cheap; called on every update.
	fn preamble_bounds(&self, contents: &str) -> usize;

	/// Builds a preamble for `inputs`. Errors keep the previously published
	/// preamble current.
	async fn build_preamble(&self, file: &Path, inputs: &ParseInputs) -> std::result::Result<BuiltPreamble, String>;

	/// Builds a full AST on top of `preamble` (absent when no preamble has
	/// ever been published for the file).
	async fn build_ast(
		&self,
		file: &Path,
		inputs: &ParseInputs,
		preamble: Option<&Arc<Preamble>>,
	) -> std::result::Result<BuiltAst, FailedAst>;
}

/// A published preamble.
pub struct Preamble {
	/// Process-unique build id; a new id per (re)build.
	pub id: u64,
	/// Version of the inputs it was built from.
	pub version: String,
	/// Effective compile command used for the build.
	pub command: CompileCommand,
	/// Parser payload.
	pub payload: OpaquePayload,
	/// Serialized size in bytes.
	pub size_bytes: usize,
	/// Hash of the preamble-affecting inputs, for publish deduplication.
	pub content_hash: u64,
	/// Hash of the preamble-affecting portion of the inputs it was built
	/// from, for the reuse check.
	pub inputs_fingerprint: u64,
	/// Include set with the timestamps observed at build time. `None`
	/// timestamps record includes that were missing.
	pub includes: Vec<(PathBuf, Option<SystemTime>)>,
	/// Wall-clock build duration.
	pub build_time: Duration,
}

impl std::fmt::Debug for Preamble {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Preamble")
			.field("id", &self.id)
			.field("version", &self.version)
			.field("size_bytes", &self.size_bytes)
			.finish()
	}
}

/// A built AST.
pub struct Ast {
	/// Version of the inputs it was built from.
	pub version: String,
	/// Version of the preamble it was built on, if any.
	pub preamble_version: Option<String>,
	/// Parser payload.
	pub payload: OpaquePayload,
	/// Diagnostics from the build.
	pub diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Debug for Ast {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Ast")
			.field("version", &self.version)
			.field("preamble_version", &self.preamble_version)
			.field("diagnostics", &self.diagnostics.len())
			.finish()
	}
}

/// Inputs paired with the AST a read runs against.
pub struct InputsAndAst {
	pub inputs: ParseInputs,
	pub ast: Arc<Ast>,
}

/// Inputs paired with a (possibly stale) preamble for a preamble read.
pub struct InputsAndPreamble {
	pub inputs: ParseInputs,
	/// Effective compile command of the current inputs.
	pub command: CompileCommand,
	/// `None` only for `StaleOrAbsent` reads on files that will never get
	/// a preamble.
	pub preamble: Option<Arc<Preamble>>,
	/// Latest signals derived from an AST build of this file, if any.
	pub signals: Option<OpaquePayload>,
}
