//! Global admission gate for preamble builds.

use std::path::Path;
use std::sync::Arc;

/// Identifies one outstanding throttler acquisition.
pub type RequestId = u64;

/// Callback fired when a build slot becomes available.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Optional global backpressure on preamble builds.
///
/// The scheduler proceeds with a build only after `on_ready` fires, and
/// calls `release` for every acquisition — on completion, on cancellation,
/// and during teardown even when `on_ready` never fired. `release` must be
/// idempotent and safe to call before `on_ready`. Ordering and fairness are
/// entirely the throttler's choice.
pub trait PreambleThrottler: Send + Sync {
	/// Requests a build slot for `file`; `on_ready` fires when granted.
	fn acquire(&self, file: &Path, on_ready: ReadyCallback) -> RequestId;

	/// Returns the slot for `id`. Idempotent.
	fn release(&self, id: RequestId);
}

/// Releases a throttler acquisition exactly once, on all exit paths.
pub(crate) struct ReleaseGuard {
	throttler: Arc<dyn PreambleThrottler>,
	id: RequestId,
}

impl ReleaseGuard {
	pub fn new(throttler: Arc<dyn PreambleThrottler>, id: RequestId) -> Self {
		Self { throttler, id }
	}
}

impl Drop for ReleaseGuard {
	fn drop(&mut self) {
		self.throttler.release(self.id);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;

	struct CountingThrottler {
		acquired: AtomicU64,
		released: AtomicU64,
	}

	impl PreambleThrottler for CountingThrottler {
		fn acquire(&self, _file: &Path, on_ready: ReadyCallback) -> RequestId {
			let id = self.acquired.fetch_add(1, Ordering::SeqCst);
			on_ready();
			id
		}

		fn release(&self, _id: RequestId) {
			self.released.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn guard_releases_on_drop_and_panic() {
		let throttler = Arc::new(CountingThrottler {
			acquired: AtomicU64::new(0),
			released: AtomicU64::new(0),
		});

		let id = throttler.acquire(Path::new("a.cc"), Box::new(|| {}));
		drop(ReleaseGuard::new(throttler.clone(), id));
		assert_eq!(throttler.released.load(Ordering::SeqCst), 1);

		let t2 = throttler.clone();
		let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
			let id = t2.acquire(Path::new("b.cc"), Box::new(|| {}));
			let _guard = ReleaseGuard::new(t2.clone(), id);
			panic!("build failed");
		}));
		assert!(result.is_err());
		assert_eq!(throttler.released.load(Ordering::SeqCst), 2);
	}
}
