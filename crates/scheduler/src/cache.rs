//! Bounded cache of recently built ASTs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Ast;

/// A cached AST with the fingerprint of the inputs that produced it.
#[derive(Clone)]
pub(crate) struct CachedAst {
	pub ast: Arc<Ast>,
	pub fingerprint: u64,
	pub preamble_id: Option<u64>,
}

struct Entry {
	file: PathBuf,
	cached: CachedAst,
	last_access: u64,
}

struct State {
	entries: Vec<Entry>,
	clock: u64,
}

/// Process-wide cache of the most recent AST per file.
///
/// Holds at most `capacity` entries; eviction is least recently built or
/// accessed first. A file has at most one entry; re-put updates it in place
/// and refreshes recency.
pub(crate) struct AstCache {
	capacity: usize,
	state: Mutex<State>,
}

impl AstCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			state: Mutex::new(State {
				entries: Vec::new(),
				clock: 0,
			}),
		}
	}

	/// Stores the most recent AST for `file`, evicting the stalest entry
	/// when over capacity.
	pub fn put(&self, file: &Path, cached: CachedAst) {
		if self.capacity == 0 {
			return;
		}
		let mut state = self.state.lock();
		state.clock += 1;
		let now = state.clock;

		if let Some(entry) = state.entries.iter_mut().find(|e| e.file == file) {
			entry.cached = cached;
			entry.last_access = now;
			return;
		}

		if state.entries.len() >= self.capacity {
			if let Some(stalest) = state
				.entries
				.iter()
				.enumerate()
				.min_by_key(|(_, e)| e.last_access)
				.map(|(i, _)| i)
			{
				let evicted = state.entries.swap_remove(stalest);
				tracing::debug!(file = %evicted.file.display(), "sched.cache.evict");
			}
		}
		state.entries.push(Entry {
			file: file.to_path_buf(),
			cached,
			last_access: now,
		});
	}

	/// Takes the entry for `file` if its fingerprint matches the request.
	pub fn take_if_matches(&self, file: &Path, fingerprint: u64) -> Option<CachedAst> {
		let mut state = self.state.lock();
		let index = state
			.entries
			.iter()
			.position(|e| e.file == file && e.cached.fingerprint == fingerprint)?;
		Some(state.entries.swap_remove(index).cached)
	}

	/// Drops the entry for `file`, if any.
	pub fn remove(&self, file: &Path) {
		self.state.lock().entries.retain(|e| e.file != file);
	}

	/// Files currently holding a cached AST, for observability and tests.
	pub fn cached_files(&self) -> Vec<PathBuf> {
		self.state.lock().entries.iter().map(|e| e.file.clone()).collect()
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ast(version: &str) -> Arc<Ast> {
		Arc::new(Ast {
			version: version.to_string(),
			preamble_version: None,
			payload: Arc::new(()),
			diagnostics: Vec::new(),
		})
	}

	fn cached(version: &str, fingerprint: u64) -> CachedAst {
		CachedAst {
			ast: ast(version),
			fingerprint,
			preamble_id: None,
		}
	}

	#[test]
	fn evicts_least_recently_touched() {
		let cache = AstCache::new(2);
		cache.put(Path::new("a"), cached("1", 1));
		cache.put(Path::new("b"), cached("1", 2));
		cache.put(Path::new("c"), cached("1", 3));

		let mut files = cache.cached_files();
		files.sort();
		assert_eq!(files, vec![PathBuf::from("b"), PathBuf::from("c")]);
	}

	#[test]
	fn reput_refreshes_recency_in_place() {
		let cache = AstCache::new(2);
		cache.put(Path::new("a"), cached("1", 1));
		cache.put(Path::new("b"), cached("1", 2));
		// Touch `a`; `b` becomes the eviction candidate.
		cache.put(Path::new("a"), cached("2", 10));
		cache.put(Path::new("c"), cached("1", 3));

		let mut files = cache.cached_files();
		files.sort();
		assert_eq!(files, vec![PathBuf::from("a"), PathBuf::from("c")]);
		assert_eq!(cache.len(), 2);
	}

	#[test]
	fn take_requires_matching_fingerprint() {
		let cache = AstCache::new(2);
		cache.put(Path::new("a"), cached("1", 7));

		assert!(cache.take_if_matches(Path::new("a"), 8).is_none());
		assert_eq!(cache.len(), 1, "mismatched take leaves the entry");

		let hit = cache.take_if_matches(Path::new("a"), 7).expect("fingerprint matches");
		assert_eq!(hit.ast.version, "1");
		assert_eq!(cache.len(), 0, "take removes the entry");
	}

	#[test]
	fn zero_capacity_stores_nothing() {
		let cache = AstCache::new(0);
		cache.put(Path::new("a"), cached("1", 1));
		assert_eq!(cache.len(), 0);
	}
}
