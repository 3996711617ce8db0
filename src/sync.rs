//! Small cross-cutting helper for the `parking_lot` / `std::sync` mutex feature switch.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Condvar, Mutex};

#[cfg(not(feature = "parking_lot"))]
pub use std::sync::{Condvar, Mutex};

#[cfg(feature = "parking_lot")]
pub fn lock<T>(mutex: &Mutex<T>) -> parking_lot::MutexGuard<'_, T> {
    mutex.lock()
}

#[cfg(not(feature = "parking_lot"))]
pub fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(feature = "parking_lot")]
pub fn wait<'a, T>(
    condvar: &Condvar,
    mut guard: parking_lot::MutexGuard<'a, T>,
) -> parking_lot::MutexGuard<'a, T> {
    condvar.wait(&mut guard);
    guard
}

#[cfg(not(feature = "parking_lot"))]
pub fn wait<'a, T>(
    condvar: &Condvar,
    guard: std::sync::MutexGuard<'a, T>,
) -> std::sync::MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
}
