//! At-most-once initialization of an expensive shared value.

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

/// Slot for a value that is costly to build (a loaded model, a resolved
/// default) and must be built at most once per owner.
///
/// Reads of an initialized slot are lock-free. A caller that finds the slot
/// empty takes the guard, checks again, and only then runs the initializer;
/// everyone else who found it empty waits on the guard and then sees the same
/// value. A failed initializer leaves the slot empty.
pub struct LazyShared<T> {
    value: OnceCell<Arc<T>>,
    guard: Mutex<()>,
}

impl<T> LazyShared<T> {
    pub const fn new() -> Self {
        Self {
            value: OnceCell::new(),
            guard: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.get().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        if let Some(value) = self.value.get() {
            return Ok(value.clone());
        }
        // A panicking initializer poisons the guard but never sets the value.
        let _held = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(value) = self.value.get() {
            return Ok(value.clone());
        }
        let value = Arc::new(init()?);
        // Only the guard holder writes, so this cannot already be set.
        let _ = self.value.set(value.clone());
        Ok(value)
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> Arc<T> {
        match self.get_or_try_init(|| Ok::<T, std::convert::Infallible>(init())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

impl<T> Default for LazyShared<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LazyShared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyShared")
            .field("value", &self.value.get())
            .finish()
    }
}
