use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locking that survives a panicked holder. A poisoned lock yields its guard instead of an error.
pub trait Lock<T> {
	fn guard(&self) -> MutexGuard<'_, T>;
}

impl<T> Lock<T> for Mutex<T> {
	#[inline]
	fn guard(&self) -> MutexGuard<'_, T> {
		self.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
