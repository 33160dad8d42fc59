//! Parse inputs and their reuse fingerprints.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot view of the filesystem an update was captured against.
///
/// The token identifies the snapshot for reuse fingerprinting; timestamps
/// feed the preamble reuse check, which stats the headers recorded by the
/// last preamble build.
pub trait SnapshotFs: Send + Sync {
	/// Modification time of `path`, `None` when the file does not exist.
	fn timestamp(&self, path: &Path) -> Option<SystemTime>;

	/// Opaque token identifying this snapshot.
	fn snapshot_token(&self) -> u64;
}

/// A compile command from the database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompileCommand {
	/// Working directory the command runs in.
	pub directory: PathBuf,
	/// Full argument vector, including the tool name and the input file.
	pub argv: Vec<String>,
	/// Human-readable reason when the command was guessed rather than found.
	/// Empty/None means the command is authoritative.
	pub heuristic: Option<String>,
}

impl CompileCommand {
	/// Whether this command was inferred rather than found in the database.
	pub fn is_heuristic(&self) -> bool {
		self.heuristic.as_deref().is_some_and(|h| !h.is_empty())
	}

	/// Arguments that affect the preamble region.
	///
	/// Output-file arguments and the input path only affect the main file,
	/// so they are excluded from preamble reuse decisions.
	pub fn preamble_relevant_argv<'a>(&'a self, input: &'a Path) -> impl Iterator<Item = &'a str> {
		let input = input.to_string_lossy().into_owned();
		let mut skip_next = false;
		self.argv.iter().filter_map(move |arg| {
			if skip_next {
				skip_next = false;
				return None;
			}
			if arg == "-o" {
				skip_next = true;
				return None;
			}
			if let Some(rest) = arg.strip_prefix("-o") {
				if !rest.is_empty() {
					return None;
				}
			}
			if *arg == input {
				return None;
			}
			Some(arg.as_str())
		})
	}
}

/// Provider of compile commands, typically backed by a compilation database.
pub trait CompileCommands: Send + Sync {
	/// Command recorded for `file`, if any. May be heuristic.
	fn command_for(&self, file: &Path) -> Option<CompileCommand>;

	/// Best-effort command used when nothing else applies. Always heuristic.
	fn fallback_for(&self, file: &Path) -> CompileCommand;
}

/// Immutable inputs for one build of a file.
#[derive(Clone)]
pub struct ParseInputs {
	/// Full file contents.
	pub contents: Arc<str>,
	/// Opaque version label, monotonic within a file.
	pub version: String,
	/// Effective compile command. Callers may prefill it; the worker
	/// overwrites it with the resolved command when the update executes.
	pub command: CompileCommand,
	/// Filesystem snapshot the contents were captured against.
	pub fs: Arc<dyn SnapshotFs>,
	/// Skip all reuse checks and rebuild from scratch.
	pub force_rebuild: bool,
}

impl ParseInputs {
	/// Reuse fingerprint: content bytes, compile command, snapshot token.
	pub fn fingerprint(&self) -> u64 {
		let mut hasher = DefaultHasher::new();
		self.contents.hash(&mut hasher);
		self.command.directory.hash(&mut hasher);
		self.command.argv.hash(&mut hasher);
		self.fs.snapshot_token().hash(&mut hasher);
		hasher.finish()
	}

	/// Whether `other` describes the same file state.
	///
	/// Used for the no-op-refresh exception: updates that change nothing do
	/// not invalidate pending reads. A forced rebuild never counts as
	/// equivalent.
	pub fn content_equivalent(&self, other: &ParseInputs) -> bool {
		!self.force_rebuild
			&& !other.force_rebuild
			&& self.contents == other.contents
			&& self.command == other.command
			&& self.fs.snapshot_token() == other.fs.snapshot_token()
	}

	/// Hash of the preamble-affecting portion of these inputs: the
	/// preamble-relevant command plus the leading `prefix_len` bytes.
	pub fn preamble_fingerprint(&self, file: &Path, prefix_len: usize) -> u64 {
		let mut hasher = DefaultHasher::new();
		for arg in self.command.preamble_relevant_argv(file) {
			arg.hash(&mut hasher);
		}
		self.command.directory.hash(&mut hasher);
		let prefix_len = prefix_len.min(self.contents.len());
		self.contents.as_bytes()[..prefix_len].hash(&mut hasher);
		hasher.finish()
	}
}

impl std::fmt::Debug for ParseInputs {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ParseInputs")
			.field("version", &self.version)
			.field("bytes", &self.contents.len())
			.field("force_rebuild", &self.force_rebuild)
			.finish()
	}
}
