//! Ambient typed context and cooperative cancellation.
//!
//! A [`Context`] is an immutable chain of typed bindings. Deriving a child
//! context adds one binding in O(1); lookup walks the chain. Every scheduled
//! task captures a context at enqueue time and installs it for the duration
//! of its execution via [`with_current`], which restores the previous context
//! on all exit paths.
//!
//! Cancellation rides inside the context as a [`CancelHandle`] binding.
//! Setting the handle publishes a [`CancelReason`] atomically; consumers
//! observe it with [`cancelled`] at explicit checkpoints.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// Typed key for one context binding.
///
/// Each key value gets a process-unique id, so two keys of the same type
/// address distinct bindings. Keys are usually held in `static` cells.
pub struct Key<T> {
	id: u64,
	_marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Key<T> {
	/// Allocates a fresh key with a process-unique id.
	pub fn new() -> Self {
		static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);
		Self {
			id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
			_marker: PhantomData,
		}
	}
}

impl<T: Send + Sync + 'static> Default for Key<T> {
	fn default() -> Self {
		Self::new()
	}
}

struct Node {
	parent: Option<Arc<Node>>,
	key: u64,
	value: Arc<dyn Any + Send + Sync>,
}

/// Immutable chain of typed bindings.
#[derive(Clone, Default)]
pub struct Context {
	head: Option<Arc<Node>>,
}

tokio::task_local! {
	static CURRENT: Context;
}

impl Context {
	/// The empty context.
	pub fn empty() -> Self {
		Self { head: None }
	}

	/// Snapshot of the ambient current context, empty outside any scope.
	pub fn current() -> Self {
		CURRENT.try_with(Clone::clone).unwrap_or_default()
	}

	/// Derives a child context with one added or overriding binding.
	pub fn derive<T: Send + Sync + 'static>(&self, key: &Key<T>, value: T) -> Self {
		Self {
			head: Some(Arc::new(Node {
				parent: self.head.clone(),
				key: key.id,
				value: Arc::new(value),
			})),
		}
	}

	/// Looks up the nearest binding for `key`.
	pub fn get<T: Send + Sync + 'static>(&self, key: &Key<T>) -> Option<&T> {
		let mut node = self.head.as_deref();
		while let Some(n) = node {
			if n.key == key.id {
				return n.value.downcast_ref::<T>();
			}
			node = n.parent.as_deref();
		}
		None
	}
}

impl std::fmt::Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut depth = 0usize;
		let mut node = self.head.as_deref();
		while let Some(n) = node {
			depth += 1;
			node = n.parent.as_deref();
		}
		f.debug_struct("Context").field("depth", &depth).finish()
	}
}

/// Runs `fut` with `ctx` installed as the ambient current context.
///
/// Scopes nest; the previous context is restored when the future completes,
/// is dropped, or panics.
pub async fn with_current<F: std::future::Future>(ctx: Context, fut: F) -> F::Output {
	CURRENT.scope(ctx, fut).await
}

// ── Cancellation ──

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	/// The caller explicitly cancelled the operation.
	UserCancel,
	/// A newer update made the operation's inputs obsolete.
	ContentModified,
	/// The owning worker or scheduler is shutting down.
	Shutdown,
}

impl CancelReason {
	fn code(self) -> u8 {
		match self {
			Self::UserCancel => 1,
			Self::ContentModified => 2,
			Self::Shutdown => 3,
		}
	}

	fn from_code(code: u8) -> Option<Self> {
		match code {
			1 => Some(Self::UserCancel),
			2 => Some(Self::ContentModified),
			3 => Some(Self::Shutdown),
			_ => None,
		}
	}
}

struct CancelState {
	flag: AtomicU8,
	parent: Option<Arc<CancelState>>,
}

impl CancelState {
	fn reason(&self) -> Option<CancelReason> {
		if let Some(reason) = CancelReason::from_code(self.flag.load(Ordering::Acquire)) {
			return Some(reason);
		}
		self.parent.as_deref().and_then(CancelState::reason)
	}
}

/// Handle that cancels the tasks carrying its paired context.
///
/// The first `cancel` wins; later calls keep the original reason. Handles
/// chain to the token active when they were created, so cancelling an outer
/// scope is observed by tasks holding a derived inner token.
#[derive(Clone)]
pub struct CancelHandle {
	state: Arc<CancelState>,
}

impl CancelHandle {
	/// Publishes the cancellation reason. Idempotent.
	pub fn cancel(&self, reason: CancelReason) {
		let _ = self
			.state
			.flag
			.compare_exchange(0, reason.code(), Ordering::AcqRel, Ordering::Relaxed);
	}

	/// Reason set on this handle or any of its ancestors.
	pub fn reason(&self) -> Option<CancelReason> {
		self.state.reason()
	}
}

fn cancel_key() -> &'static Key<CancelHandle> {
	static KEY: OnceLock<Key<CancelHandle>> = OnceLock::new();
	KEY.get_or_init(Key::new)
}

/// Derives a cancellable context from `parent`, returning the handle.
pub fn cancelable(parent: &Context) -> (Context, CancelHandle) {
	let chained = parent.get(cancel_key()).map(|h| Arc::clone(&h.state));
	let handle = CancelHandle {
		state: Arc::new(CancelState {
			flag: AtomicU8::new(0),
			parent: chained,
		}),
	};
	(parent.derive(cancel_key(), handle.clone()), handle)
}

/// Cancellation reason visible from `ctx`, if any.
pub fn cancelled(ctx: &Context) -> Option<CancelReason> {
	ctx.get(cancel_key()).and_then(CancelHandle::reason)
}

#[cfg(test)]
mod tests {
	use std::sync::LazyLock;

	use super::*;

	static INT_KEY: LazyLock<Key<i64>> = LazyLock::new(Key::new);
	static STR_KEY: LazyLock<Key<String>> = LazyLock::new(Key::new);

	// ── Chain semantics ──

	#[test]
	fn derive_shadows_and_lookup_walks_chain() {
		let root = Context::empty();
		assert!(root.get(&INT_KEY).is_none());

		let a = root.derive(&INT_KEY, 1);
		let b = a.derive(&STR_KEY, "s".to_string());
		let c = b.derive(&INT_KEY, 2);

		assert_eq!(a.get(&INT_KEY), Some(&1));
		assert_eq!(b.get(&INT_KEY), Some(&1));
		assert_eq!(c.get(&INT_KEY), Some(&2));
		assert_eq!(c.get(&STR_KEY).map(String::as_str), Some("s"));
		// Parents are unaffected by child derivations.
		assert_eq!(a.get(&INT_KEY), Some(&1));
	}

	#[test]
	fn distinct_keys_of_same_type_do_not_alias() {
		let k1: Key<i64> = Key::new();
		let k2: Key<i64> = Key::new();
		let ctx = Context::empty().derive(&k1, 10);
		assert_eq!(ctx.get(&k1), Some(&10));
		assert!(ctx.get(&k2).is_none());
	}

	// ── Ambient scoping ──

	#[tokio::test]
	async fn with_current_installs_and_restores() {
		assert!(Context::current().get(&INT_KEY).is_none());

		let ctx = Context::empty().derive(&INT_KEY, 7);
		with_current(ctx, async {
			assert_eq!(Context::current().get(&INT_KEY), Some(&7));

			let inner = Context::current().derive(&INT_KEY, 8);
			with_current(inner, async {
				assert_eq!(Context::current().get(&INT_KEY), Some(&8));
			})
			.await;

			assert_eq!(Context::current().get(&INT_KEY), Some(&7));
		})
		.await;

		assert!(Context::current().get(&INT_KEY).is_none());
	}

	#[tokio::test]
	async fn current_survives_await_points() {
		let ctx = Context::empty().derive(&INT_KEY, 42);
		with_current(ctx, async {
			tokio::task::yield_now().await;
			assert_eq!(Context::current().get(&INT_KEY), Some(&42));
		})
		.await;
	}

	// ── Cancellation ──

	#[test]
	fn first_cancel_wins() {
		let (ctx, handle) = cancelable(&Context::empty());
		assert!(cancelled(&ctx).is_none());

		handle.cancel(CancelReason::ContentModified);
		handle.cancel(CancelReason::UserCancel);
		assert_eq!(cancelled(&ctx), Some(CancelReason::ContentModified));
	}

	#[test]
	fn outer_cancellation_is_visible_through_inner_token() {
		let (outer_ctx, outer) = cancelable(&Context::empty());
		let (inner_ctx, _inner) = cancelable(&outer_ctx);

		assert!(cancelled(&inner_ctx).is_none());
		outer.cancel(CancelReason::UserCancel);
		assert_eq!(cancelled(&inner_ctx), Some(CancelReason::UserCancel));
	}

	#[test]
	fn inner_cancellation_does_not_leak_to_outer() {
		let (outer_ctx, _outer) = cancelable(&Context::empty());
		let (inner_ctx, inner) = cancelable(&outer_ctx);

		inner.cancel(CancelReason::Shutdown);
		assert_eq!(cancelled(&inner_ctx), Some(CancelReason::Shutdown));
		assert!(cancelled(&outer_ctx).is_none());
	}
}
