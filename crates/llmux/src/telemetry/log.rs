use crossbeam::atomic::AtomicCell;
use tracing_subscriber::EnvFilter;

use crate::*;

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// passed default filter.
pub fn setup(default_filter: &str) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_filter));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init();
}

/// A slot for information that arrives after the owning scope is gone,
/// typically filled in while draining a response body. Writers mutate
/// through [`AsyncLog::non_atomic_mutate`]; the final reader takes the
/// value once.
pub struct AsyncLog<T>(Arc<AtomicCell<Option<T>>>);

impl<T> Clone for AsyncLog<T> {
	fn clone(&self) -> Self {
		AsyncLog(self.0.clone())
	}
}

impl<T> AsyncLog<T> {
	/// Racey modify of the current value; during the mutation, loads observe
	/// empty. Acceptable for telemetry, where a lost read only drops detail.
	pub fn non_atomic_mutate(&self, f: impl FnOnce(&mut T)) {
		let Some(mut cur) = self.0.take() else {
			return;
		};
		f(&mut cur);
		self.0.store(Some(cur));
	}

	pub fn store(&self, v: Option<T>) {
		self.0.store(v)
	}

	pub fn take(&self) -> Option<T> {
		self.0.take()
	}
}

impl<T: Copy> AsyncLog<T> {
	pub fn load(&self) -> Option<T> {
		self.0.load()
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(AtomicCell::new(None)))
	}
}

impl<T: Debug> Debug for AsyncLog<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AsyncLog").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mutate_requires_a_value() {
		let log: AsyncLog<u64> = Default::default();
		// No stored value: the mutation is a no-op.
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.take(), None);

		log.store(Some(1));
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.take(), Some(2));
		// take drains.
		assert_eq!(log.take(), None);
	}

	#[test]
	fn clones_share_state() {
		let a: AsyncLog<u64> = Default::default();
		let b = a.clone();
		a.store(Some(7));
		assert_eq!(b.load(), Some(7));
	}
}
