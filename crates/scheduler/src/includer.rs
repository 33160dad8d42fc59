//! Header-to-main-file association cache.
//!
//! Headers usually have no compile command of their own. When a main file's
//! preamble includes such a header, the header borrows the main file's
//! command until a better owner claims it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::inputs::CompileCommand;

/// One header association.
#[derive(Clone)]
pub(crate) struct Association {
	/// Main file whose preamble claimed the header.
	pub main: PathBuf,
	/// The main file's effective command at claim time.
	pub command: CompileCommand,
	/// Cleared when the main file's includes drop the header or the main
	/// file vanishes from the database. Invalid associations are kept until
	/// another preamble claims the header.
	pub valid: bool,
}

struct State {
	by_header: HashMap<PathBuf, Association>,
	includes_of_main: HashMap<PathBuf, HashSet<PathBuf>>,
}

/// Maps headers to the main file whose command they should borrow.
pub(crate) struct IncluderCache {
	state: Mutex<State>,
}

impl IncluderCache {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State {
				by_header: HashMap::new(),
				includes_of_main: HashMap::new(),
			}),
		}
	}

	/// Records the headers `main`'s freshly built preamble includes.
	///
	/// `claimable` must already be filtered to headers whose own command is
	/// absent or heuristic. Headers no longer included by `main` are marked
	/// invalid but kept; a header is (re)claimed only when unowned, when its
	/// association is invalid, or when `main` already owns it.
	pub fn update(&self, main: &Path, command: &CompileCommand, claimable: &[PathBuf]) {
		let mut state = self.state.lock();

		let new_set: HashSet<PathBuf> = claimable.iter().cloned().collect();
		if let Some(previous) = state.includes_of_main.get(main) {
			let dropped: Vec<PathBuf> = previous.difference(&new_set).cloned().collect();
			for header in dropped {
				if let Some(assoc) = state.by_header.get_mut(&header) {
					if assoc.main == main {
						assoc.valid = false;
					}
				}
			}
		}

		for header in claimable {
			if header == main {
				continue;
			}
			match state.by_header.get_mut(header) {
				Some(assoc) if assoc.valid && assoc.main != main => {}
				Some(assoc) => {
					assoc.main = main.to_path_buf();
					assoc.command = command.clone();
					assoc.valid = true;
				}
				None => {
					state.by_header.insert(
						header.clone(),
						Association {
							main: main.to_path_buf(),
							command: command.clone(),
							valid: true,
						},
					);
				}
			}
		}

		state.includes_of_main.insert(main.to_path_buf(), new_set);
	}

	/// The association for `header`, if any. Invalid associations are still
	/// served until another preamble claims the header; the caller is
	/// expected to validate the main file against the database on use.
	pub fn get(&self, header: &Path) -> Option<Association> {
		self.state.lock().by_header.get(header).cloned()
	}

	/// Invalidates every association rooted at `main` (e.g. when the main
	/// file disappeared from the database).
	pub fn invalidate_main(&self, main: &Path) {
		let mut state = self.state.lock();
		for assoc in state.by_header.values_mut() {
			if assoc.main == main {
				assoc.valid = false;
			}
		}
	}
}
