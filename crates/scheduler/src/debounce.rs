//! Rebuild debounce sized from recent build times.

use std::time::Duration;

/// Delay inserted between an update and its diagnostics rebuild.
///
/// The delay tracks the median of recent AST build durations: cheap files
/// rebuild almost immediately, expensive files wait long enough for the
/// typist to pause.
#[derive(Debug, Clone, Copy)]
pub struct DebouncePolicy {
	/// Lower bound on the computed delay.
	pub min: Duration,
	/// Upper bound on the computed delay; also used with no history.
	pub max: Duration,
	/// Scale factor applied to the median build time.
	pub rebuild_ratio: f32,
}

impl Default for DebouncePolicy {
	fn default() -> Self {
		Self {
			min: Duration::from_millis(50),
			max: Duration::from_millis(500),
			rebuild_ratio: 1.0,
		}
	}
}

impl DebouncePolicy {
	/// A constant delay, mainly for tests.
	pub fn fixed(delay: Duration) -> Self {
		Self {
			min: delay,
			max: delay,
			rebuild_ratio: 1.0,
		}
	}

	/// Computes the delay for a file given its recent build durations.
	pub fn compute(&self, history: &[Duration]) -> Duration {
		if history.is_empty() {
			return self.max;
		}
		// Upper median: for an even count take the higher of the two
		// middle elements.
		let mut sorted: Vec<Duration> = history.to_vec();
		sorted.sort_unstable();
		let median = sorted[sorted.len() / 2];
		let scaled = median.mul_f32(self.rebuild_ratio.max(0.0));
		scaled.clamp(self.min, self.max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn secs(s: u64) -> Duration {
		Duration::from_secs(s)
	}

	#[test]
	fn compute_scales_median_and_clamps() {
		let history = [secs(0), secs(5), secs(10), secs(20)];
		let mut policy = DebouncePolicy {
			min: secs(3),
			max: secs(25),
			rebuild_ratio: 1.0,
		};

		// Upper median of the four samples is 10s.
		assert_eq!(policy.compute(&history), secs(10));

		policy.rebuild_ratio = 1.5;
		assert_eq!(policy.compute(&history), secs(15));

		policy.rebuild_ratio = 3.0;
		assert_eq!(policy.compute(&history), secs(25), "constrained by max");

		policy.rebuild_ratio = 0.0;
		assert_eq!(policy.compute(&history), secs(3), "constrained by min");

		assert_eq!(policy.compute(&[]), secs(25), "no history -> max");
	}

	#[test]
	fn fixed_ignores_history() {
		let policy = DebouncePolicy::fixed(Duration::from_millis(500));
		assert_eq!(policy.compute(&[]), Duration::from_millis(500));
		assert_eq!(policy.compute(&[secs(9)]), Duration::from_millis(500));
	}
}
