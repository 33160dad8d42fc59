//! Counter sink for scheduler metrics.
//!
//! Metric names are part of the observable surface: `ast_access_read` and
//! `ast_access_diag`, each labelled `hit` or `miss`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Destination for scheduler counters. Installed per scheduler instance.
pub trait Tracer: Send + Sync {
	/// Records one occurrence of `name` with `label`.
	fn metric(&self, name: &'static str, label: &'static str);
}

/// Discards all metrics.
pub struct NoopTracer;

impl Tracer for NoopTracer {
	fn metric(&self, _name: &'static str, _label: &'static str) {}
}

/// Capturing tracer for tests: counts are taken (and reset) per key.
#[derive(Default)]
pub struct TestTracer {
	counts: Mutex<HashMap<(&'static str, &'static str), u64>>,
}

impl TestTracer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Returns and clears the count recorded for `name`/`label`.
	pub fn take(&self, name: &'static str, label: &'static str) -> u64 {
		self.counts.lock().remove(&(name, label)).unwrap_or(0)
	}
}

impl Tracer for TestTracer {
	fn metric(&self, name: &'static str, label: &'static str) {
		*self.counts.lock().entry((name, label)).or_insert(0) += 1;
	}
}

pub(crate) const AST_ACCESS_READ: &str = "ast_access_read";
pub(crate) const AST_ACCESS_DIAG: &str = "ast_access_diag";
pub(crate) const HIT: &str = "hit";
pub(crate) const MISS: &str = "miss";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn take_resets_counts() {
		let tracer = TestTracer::new();
		tracer.metric(AST_ACCESS_READ, HIT);
		tracer.metric(AST_ACCESS_READ, HIT);
		tracer.metric(AST_ACCESS_DIAG, MISS);

		assert_eq!(tracer.take(AST_ACCESS_READ, HIT), 2);
		assert_eq!(tracer.take(AST_ACCESS_READ, HIT), 0);
		assert_eq!(tracer.take(AST_ACCESS_DIAG, MISS), 1);
		assert_eq!(tracer.take(AST_ACCESS_DIAG, HIT), 0);
	}
}
